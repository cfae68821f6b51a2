//! # Main — CLI Entry Point
//!
//! Parses arguments, initialises logging and the Rayon pool, merges the probe
//! configuration, and routes to the subcommand runners in `cli.rs`.
//!
//! ## Subcommands
//!
//! - `plan`: build and encode the chain into a heap buffer, verify it and
//!   report modulus, step, cycle length and digest. Never executes anything.
//! - `native`: encode into an executable mapping in this process and jump.
//! - `guest`: encode into the memory of a KVM guest and run its vCPU.
//!
//! `native` and `guest` do not return on success; the process spins inside
//! the chain until it is killed.
//!
//! ## Global Options
//!
//! - `--config` / `CYCLECHASE_CONFIG`: TOML file with `[permutation]` and
//!   `[region]` sections. Flags override it.
//! - `--threads`: Rayon thread pool size for the primitive-root search
//!   (defaults to all logical cores).

mod cli;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use cyclechase::config::Overrides;
use cyclechase::plan::Strategy;
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "cyclechase",
    version,
    about = "Run a maximal-length chain of indirect jumps"
)]
struct Cli {
    /// Probe configuration file (TOML)
    #[arg(long, env = "CYCLECHASE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Number of rayon worker threads (defaults to all logical cores)
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, encode and verify the chain without running it
    Plan {
        #[command(flatten)]
        run: RunArgs,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Jump into the chain in this process (never returns)
    Native {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run the chain inside a KVM guest (never returns)
    Guest {
        #[command(flatten)]
        run: RunArgs,
    },
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Approximate cycle length; the largest prime below it is used
    #[arg(long, env = "CYCLECHASE_SIZE")]
    size: Option<u64>,

    /// Smallest acceptable stepping shift
    #[arg(long, env = "CYCLECHASE_MIN_STEP")]
    min_step: Option<u64>,

    /// Permutation builder
    #[arg(long, value_enum, env = "CYCLECHASE_STRATEGY")]
    strategy: Option<Strategy>,

    /// Seed for the shuffle strategy (random when absent)
    #[arg(long, env = "CYCLECHASE_SEED")]
    seed: Option<u64>,

    /// Bytes reserved for instructions and targets together (even)
    #[arg(long, env = "CYCLECHASE_SPAN")]
    span: Option<u64>,
}

impl From<&RunArgs> for Overrides {
    fn from(args: &RunArgs) -> Self {
        Overrides {
            size: args.size,
            min_step: args.min_step,
            strategy: args.strategy,
            seed: args.seed,
            span: args.span,
        }
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Structured logging: LOG_FORMAT=json for log shippers, human-readable otherwise.
    // Both go to stderr; stdout carries only the `plan` report.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    cli::configure_rayon(cli.threads);

    match &cli.command {
        Commands::Plan { run, json } => {
            let config = cyclechase::config::load(cli.config.as_deref(), &run.into())?;
            cli::run_plan(&config, *json)
        }
        Commands::Native { run } => {
            let config = cyclechase::config::load(cli.config.as_deref(), &run.into())?;
            cli::run_native(&config)
        }
        Commands::Guest { run } => {
            let config = cyclechase::config::load(cli.config.as_deref(), &run.into())?;
            cli::run_guest(&config)
        }
    }
}
