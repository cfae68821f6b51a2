//! # Roots — Parallel Primitive Root Search
//!
//! Enumerates every generator of the multiplicative group (Z/pZ)* in [2, p)
//! and picks the cycle step from that set.
//!
//! ## Algorithm
//!
//! g is a primitive root mod p iff g^((p−1)/f) ≢ 1 (mod p) for every distinct
//! prime factor f of p − 1. The factor set is computed once and borrowed
//! read-only by every worker.
//!
//! ## Parallelism
//!
//! The candidate range is cut into one contiguous chunk per Rayon worker
//! (equal sizes, the last one possibly shorter). Each worker scans its own
//! chunk into a private `Vec`; the indexed `collect` keeps chunk order, so
//! concatenating the per-worker lists yields an ascending set without a sort,
//! a lock or an atomic.

use rayon::prelude::*;
use std::fmt;
use std::ops::Range;
use tracing::debug;

use crate::modular::{distinct_prime_factors, pow_mod};

/// Errors from the generator search and selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// The environment reported zero available workers.
    NoParallelism,
    /// No generator is >= the requested minimum step.
    NoGeneratorAtLeast { minimum: u64, modulus: u64 },
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::NoParallelism => {
                write!(f, "no parallel workers available for primitive root search")
            }
            SearchError::NoGeneratorAtLeast { minimum, modulus } => write!(
                f,
                "no primitive root mod {} is >= {} (minimum must not exceed {})",
                modulus,
                minimum,
                modulus.saturating_sub(1)
            ),
        }
    }
}

impl std::error::Error for SearchError {}

/// True if `g` generates (Z/pZ)*, given the distinct prime factors of p − 1.
pub fn is_primitive_root(g: u64, p: u64, factors: &[u64]) -> bool {
    let order = p - 1;
    factors.iter().all(|&f| pow_mod(g, order / f, p) != 1)
}

/// Split `range` into `workers` contiguous chunks of ceil(len / workers)
/// candidates. Trailing workers get nothing when the range is short.
pub fn partition(range: Range<u64>, workers: usize) -> Vec<Range<u64>> {
    let len = range.end.saturating_sub(range.start);
    let chunk = len.div_ceil(workers.max(1) as u64).max(1);
    (0..workers as u64)
        .map(|w| {
            let start = (range.start + w * chunk).min(range.end);
            let end = (start + chunk).min(range.end);
            start..end
        })
        .filter(|r| !r.is_empty())
        .collect()
}

/// All primitive roots of prime `p` in [2, p), ascending, using the global
/// Rayon pool width as the worker count.
pub fn primitive_roots(p: u64) -> Result<Vec<u64>, SearchError> {
    primitive_roots_with_workers(p, rayon::current_num_threads())
}

/// All primitive roots of prime `p` in [2, p), ascending, scanned by `workers`
/// statically partitioned workers.
pub fn primitive_roots_with_workers(p: u64, workers: usize) -> Result<Vec<u64>, SearchError> {
    if workers == 0 {
        return Err(SearchError::NoParallelism);
    }
    if p < 3 {
        return Ok(Vec::new());
    }

    let factors = distinct_prime_factors(p - 1);
    let chunks = partition(2..p, workers);
    debug!(
        modulus = p,
        factors = ?factors,
        workers,
        chunks = chunks.len(),
        "primitive root search"
    );

    let per_worker: Vec<Vec<u64>> = chunks
        .into_par_iter()
        .map(|chunk| {
            chunk
                .filter(|&g| is_primitive_root(g, p, &factors))
                .collect::<Vec<u64>>()
        })
        .collect();

    Ok(per_worker.concat())
}

/// Smallest generator >= `minimum` from an ascending generator set.
pub fn choose_generator(generators: &[u64], minimum: u64, modulus: u64) -> Result<u64, SearchError> {
    let idx = generators.partition_point(|&g| g < minimum);
    generators
        .get(idx)
        .copied()
        .ok_or(SearchError::NoGeneratorAtLeast { minimum, modulus })
}
