//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Contains the
//! execution logic for each subcommand and the rayon configuration.

use anyhow::{Context, Result};
use cyclechase::chain::{self, AddressWidth, ChainLayout};
use cyclechase::config::ProbeConfig;
use cyclechase::handoff;
use cyclechase::plan::{self, CyclePlan, Strategy};
use cyclechase::region::MappedRegion;
use serde::Serialize;
use tracing::{info, warn};

// ── Plan (dry run) ──────────────────────────────────────────────

/// What `plan` prints: the parameters actually chosen and the encoded
/// chain's fingerprint.
#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub requested_size: u64,
    pub modulus: u64,
    pub strategy: Strategy,
    pub step: Option<u64>,
    pub generator_count: Option<usize>,
    pub cycle_length: u64,
    pub span: u64,
    pub base_address: String,
    pub entry_address: String,
    pub digest: String,
}

fn build(config: &ProbeConfig) -> Result<CyclePlan> {
    let plan = plan::generate_cyclic_permutation(&config.plan_request())?;
    plan.permutation
        .verify_single_cycle()
        .context("built permutation is not a single cycle")?;
    Ok(plan)
}

/// Build the chain into a heap buffer laid out exactly as `native` would lay
/// it out, verify it, follow it for one lap in software, and report.
pub fn run_plan(config: &ProbeConfig, json: bool) -> Result<()> {
    let plan = build(config)?;
    let region = &config.region;
    let layout = ChainLayout::split(region.native_base, 0, region.span, AddressWidth::Signed32);
    let mut buffer = vec![0u8; region.span as usize];
    let summary = chain::encode(&plan.permutation, &mut buffer, &layout)?;

    let lap = chain::lap_length(&buffer, &layout, summary.entries)?;
    if lap != Some(summary.entries) {
        anyhow::bail!(
            "encoded chain returns to its entry after {:?} jumps, expected {}",
            lap,
            summary.entries
        );
    }

    let report = PlanReport {
        requested_size: config.permutation.size,
        modulus: plan.modulus,
        strategy: plan.strategy,
        step: plan.step,
        generator_count: plan.generator_count,
        cycle_length: plan.permutation.cycle_length(),
        span: region.span,
        base_address: format!("{:#x}", layout.base_address),
        entry_address: format!("{:#x}", summary.entry_address),
        digest: summary.digest,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("modulus:       {}", report.modulus);
        println!("strategy:      {}", report.strategy);
        if let Some(step) = report.step {
            println!("step:          {}", step);
        }
        if let Some(count) = report.generator_count {
            println!("generators:    {}", count);
        }
        println!("cycle length:  {}", report.cycle_length);
        println!("span:          {:#x}", report.span);
        println!("entry:         {}", report.entry_address);
        println!("sha256:        {}", report.digest);
    }
    Ok(())
}

// ── Handoff ─────────────────────────────────────────────────────

/// Encode into executable memory of this process and jump. Only returns on
/// failure.
pub fn run_native(config: &ProbeConfig) -> Result<()> {
    let plan = build(config)?;
    let region = MappedRegion::executable(config.region.span as usize, config.region.native_base)?;
    info!(
        base = format_args!("{:#x}", region.base_address()),
        span = format_args!("{:#x}", region.len()),
        "native region mapped"
    );
    let never = handoff::enter_native(region, plan.permutation)?;
    match never {}
}

/// Encode into a fresh KVM guest and run it. Only returns on failure,
/// including any guest exit.
#[cfg(target_os = "linux")]
pub fn run_guest(config: &ProbeConfig) -> Result<()> {
    use cyclechase::handoff::{GuestPlacement, Hypervisor};
    use cyclechase::kvm::Kvm;

    let plan = build(config)?;
    let kvm = Kvm::open()?;
    let mut ctx = kvm.create_isolated_context(config.region.guest_memory)?;
    let placement = GuestPlacement {
        offset: config.region.guest_offset,
        span: config.region.span,
    };
    let never = handoff::enter_guest(&mut ctx, plan.permutation, placement)?;
    match never {}
}

#[cfg(not(target_os = "linux"))]
pub fn run_guest(_config: &ProbeConfig) -> Result<()> {
    anyhow::bail!("guest mode needs Linux KVM")
}

// ── Rayon Configuration ─────────────────────────────────────────

/// Configure the rayon global thread pool size (`None` or 0 = all cores).
pub fn configure_rayon(threads: Option<usize>) {
    let num_threads = threads.unwrap_or(0);
    if num_threads > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()
        {
            warn!(error = %e, "Could not configure rayon thread pool");
        }
    }
}
