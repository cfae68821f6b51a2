//! TOML probe configuration, CLI overrides, and validation.
//!
//! A probe TOML has two optional sections:
//!
//! ```toml
//! [permutation]
//! size = 67108864       # approximate cycle length; rounded down to a prime
//! min_step = 100000     # smallest acceptable stepping shift
//! strategy = "stepping" # or "shuffle"
//! seed = 42             # shuffle RNG seed; entropy when absent
//!
//! [region]
//! span = 1073741824     # bytes for instruction + target areas
//! native_base = 65536   # mmap hint for the native region
//! guest_memory = 4294967296
//! guest_offset = 4096   # guest address of the first instruction
//! ```
//!
//! Missing keys take the defaults below. Command-line flags win over the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::paging::{MAX_GUEST_MEMORY, PAGE_SIZE};
use crate::plan::{PlanRequest, Strategy};

pub const DEFAULT_SIZE: u64 = 1 << 26;
pub const DEFAULT_MIN_STEP: u64 = 100_000;
pub const DEFAULT_SPAN: u64 = 1 << 30;
pub const DEFAULT_NATIVE_BASE: u64 = 0x1_0000;
pub const DEFAULT_GUEST_MEMORY: u64 = MAX_GUEST_MEMORY;
pub const DEFAULT_GUEST_OFFSET: u64 = 0x1000;

// ── TOML Configuration Structs ──────────────────────────────────

/// Top-level probe configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default)]
    pub permutation: PermutationConfig,
    #[serde(default)]
    pub region: RegionConfig,
}

/// The `[permutation]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PermutationConfig {
    pub size: u64,
    pub min_step: u64,
    pub strategy: Strategy,
    pub seed: Option<u64>,
}

impl Default for PermutationConfig {
    fn default() -> Self {
        PermutationConfig {
            size: DEFAULT_SIZE,
            min_step: DEFAULT_MIN_STEP,
            strategy: Strategy::Stepping,
            seed: None,
        }
    }
}

/// The `[region]` section: where the chain is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegionConfig {
    pub span: u64,
    pub native_base: u64,
    pub guest_memory: u64,
    pub guest_offset: u64,
}

impl Default for RegionConfig {
    fn default() -> Self {
        RegionConfig {
            span: DEFAULT_SPAN,
            native_base: DEFAULT_NATIVE_BASE,
            guest_memory: DEFAULT_GUEST_MEMORY,
            guest_offset: DEFAULT_GUEST_OFFSET,
        }
    }
}

/// Values given on the command line. `None` keeps the file (or default) value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub size: Option<u64>,
    pub min_step: Option<u64>,
    pub strategy: Option<Strategy>,
    pub seed: Option<u64>,
    pub span: Option<u64>,
}

// ── Loading ─────────────────────────────────────────────────────

/// Parse a probe configuration from a TOML string (not yet validated).
pub fn parse_toml(content: &str) -> Result<ProbeConfig> {
    let config: ProbeConfig = toml::from_str(content)?;
    Ok(config)
}

/// Load from `path` if given, otherwise start from defaults; then apply
/// `overrides` and validate the result.
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<ProbeConfig> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            parse_toml(&content).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => ProbeConfig::default(),
    };
    config.apply(overrides);
    config.validate()?;
    Ok(config)
}

impl ProbeConfig {
    pub fn apply(&mut self, overrides: &Overrides) {
        let perm = &mut self.permutation;
        if let Some(size) = overrides.size {
            perm.size = size;
        }
        if let Some(min_step) = overrides.min_step {
            perm.min_step = min_step;
        }
        if let Some(strategy) = overrides.strategy {
            perm.strategy = strategy;
        }
        if overrides.seed.is_some() {
            perm.seed = overrides.seed;
        }
        if let Some(span) = overrides.span {
            self.region.span = span;
        }
    }

    /// Reject settings that can never produce a chain.
    pub fn validate(&self) -> Result<()> {
        let perm = &self.permutation;
        let region = &self.region;
        if perm.size < 3 {
            anyhow::bail!("permutation.size must be at least 3 (got {})", perm.size);
        }
        if perm.size > u32::MAX as u64 + 1 {
            anyhow::bail!(
                "permutation.size {} exceeds the 32-bit index range",
                perm.size
            );
        }
        if region.span == 0 || !region.span.is_multiple_of(2) {
            anyhow::bail!("region.span must be even and non-zero (got {})", region.span);
        }
        if !region.guest_memory.is_multiple_of(PAGE_SIZE) || region.guest_memory > MAX_GUEST_MEMORY {
            anyhow::bail!(
                "region.guest_memory {:#x} must be page aligned and at most {:#x}",
                region.guest_memory,
                MAX_GUEST_MEMORY
            );
        }
        Ok(())
    }

    pub fn plan_request(&self) -> PlanRequest {
        PlanRequest {
            approx_size: self.permutation.size,
            approx_min_step: self.permutation.min_step,
            strategy: self.permutation.strategy,
            seed: self.permutation.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    //! Tests for probe configuration parsing, override precedence, and
    //! validation.

    use super::*;
    use std::io::Write;

    // ── Parsing ─────────────────────────────────────────────────

    #[test]
    fn empty_file_gives_defaults() {
        let config = parse_toml("").unwrap();
        assert_eq!(config, ProbeConfig::default());
        assert_eq!(config.permutation.size, 1 << 26);
        assert_eq!(config.permutation.min_step, 100_000);
        assert_eq!(config.region.span, 1 << 30);
        assert_eq!(config.region.guest_offset, 0x1000);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = parse_toml(
            r#"
            [permutation]
            size = 1000
            strategy = "shuffle"
            seed = 7

            [region]
            span = 65536
            "#,
        )
        .unwrap();
        assert_eq!(config.permutation.size, 1000);
        assert_eq!(config.permutation.strategy, Strategy::Shuffle);
        assert_eq!(config.permutation.seed, Some(7));
        assert_eq!(config.permutation.min_step, DEFAULT_MIN_STEP);
        assert_eq!(config.region.span, 65536);
        assert_eq!(config.region.guest_memory, DEFAULT_GUEST_MEMORY);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse_toml("[permutation]\nsizee = 10\n").is_err());
        assert!(parse_toml("[regions]\nspan = 10\n").is_err());
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!(parse_toml("[permutation]\nstrategy = \"random\"\n").is_err());
    }

    // ── Overrides ───────────────────────────────────────────────

    /// Command-line values replace file values; absent ones leave them alone.
    #[test]
    fn overrides_take_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[permutation]\nsize = 500\nmin_step = 20\nseed = 1").unwrap();
        let overrides = Overrides {
            min_step: Some(30),
            span: Some(4096),
            ..Overrides::default()
        };
        let config = load(Some(file.path()), &overrides).unwrap();
        assert_eq!(config.permutation.size, 500);
        assert_eq!(config.permutation.min_step, 30);
        assert_eq!(config.permutation.seed, Some(1));
        assert_eq!(config.region.span, 4096);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("absent.toml")), &Overrides::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("reading config"));
    }

    #[test]
    fn plan_request_mirrors_permutation_section() {
        let config = ProbeConfig {
            permutation: PermutationConfig {
                size: 10,
                min_step: 2,
                strategy: Strategy::Shuffle,
                seed: Some(9),
            },
            ..ProbeConfig::default()
        };
        let request = config.plan_request();
        assert_eq!(request.approx_size, 10);
        assert_eq!(request.approx_min_step, 2);
        assert_eq!(request.strategy, Strategy::Shuffle);
        assert_eq!(request.seed, Some(9));
    }

    // ── Validation ──────────────────────────────────────────────

    #[test]
    fn rejects_tiny_size() {
        let overrides = Overrides {
            size: Some(2),
            ..Overrides::default()
        };
        let err = load(None, &overrides).unwrap_err();
        assert!(err.to_string().contains("at least 3"));
    }

    #[test]
    fn rejects_odd_or_zero_span() {
        for span in [0, 4097] {
            let overrides = Overrides {
                span: Some(span),
                ..Overrides::default()
            };
            assert!(load(None, &overrides).is_err(), "span {}", span);
        }
    }

    #[test]
    fn rejects_oversized_guest_memory() {
        let mut config = ProbeConfig::default();
        config.region.guest_memory = MAX_GUEST_MEMORY + PAGE_SIZE;
        assert!(config.validate().is_err());
        config.region.guest_memory = 0x10_0001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_validate() {
        assert!(ProbeConfig::default().validate().is_ok());
    }
}
