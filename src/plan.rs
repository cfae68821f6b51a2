//! # Plan — Permutation Generation Entry Point
//!
//! Turns an approximate size and an approximate minimum step into a concrete
//! single-cycle permutation:
//!
//! ```text
//! size ─► P = largest prime < size ─┬─► primitive roots ─► shift ≥ min_step ─► stepping
//!                                    └─► shuffle (no root search)
//! ```
//!
//! The modulus and step actually used differ from the requested values and are
//! reported on the returned `CyclePlan` and in the log.

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

use crate::modular;
use crate::permutation::{CycleBuilder, Permutation, ShuffleBuilder, SteppingBuilder};
use crate::roots;

/// Which permutation builder to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Additive stepping by a primitive root >= the minimum step.
    #[default]
    Stepping,
    /// Random single cycle (Sattolo), no root search.
    Shuffle,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Stepping => write!(f, "stepping"),
            Strategy::Shuffle => write!(f, "shuffle"),
        }
    }
}

/// Requested (approximate) permutation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub approx_size: u64,
    pub approx_min_step: u64,
    pub strategy: Strategy,
    /// Shuffle RNG seed; `None` draws one from the OS.
    pub seed: Option<u64>,
}

/// A built permutation plus the parameters actually used.
#[derive(Debug, Clone)]
pub struct CyclePlan {
    pub modulus: u64,
    pub strategy: Strategy,
    /// Chosen primitive root (stepping only).
    pub step: Option<u64>,
    /// Number of generators found (stepping only).
    pub generator_count: Option<usize>,
    pub permutation: Permutation,
}

/// Build a single-cycle permutation of P = largest prime below
/// `request.approx_size` indices.
pub fn generate_cyclic_permutation(request: &PlanRequest) -> Result<CyclePlan> {
    let start = Instant::now();
    let modulus = modular::largest_prime_below(request.approx_size)
        .with_context(|| format!("cannot size a permutation from {}", request.approx_size))?;

    let (permutation, step, generator_count) = match request.strategy {
        Strategy::Stepping => {
            let generators = roots::primitive_roots(modulus)?;
            let shift = roots::choose_generator(&generators, request.approx_min_step, modulus)?;
            info!(
                modulus,
                generators = generators.len(),
                requested_step = request.approx_min_step,
                step = shift,
                "primitive root chosen"
            );
            let count = generators.len();
            drop(generators);
            let perm = SteppingBuilder { shift }.build(modulus)?;
            (perm, Some(shift), Some(count))
        }
        Strategy::Shuffle => {
            let rng = match request.seed {
                Some(seed) => ChaCha8Rng::seed_from_u64(seed),
                None => ChaCha8Rng::from_entropy(),
            };
            let perm = ShuffleBuilder::new(rng).build(modulus)?;
            (perm, None, None)
        }
    };

    info!(
        requested_size = request.approx_size,
        modulus,
        strategy = %request.strategy,
        cycle_length = permutation.cycle_length(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "permutation built"
    );

    Ok(CyclePlan {
        modulus,
        strategy: request.strategy,
        step,
        generator_count,
        permutation,
    })
}
