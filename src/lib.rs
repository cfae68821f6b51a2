//! # cyclechase — Maximal Indirect-Jump Chains
//!
//! Builds a permutation of P indices (P prime) that is one single cycle,
//! encodes it as a chain of `jmp [disp32]` instructions whose targets are
//! stored in a separate table, and hands control to the chain either in
//! this process or inside a KVM guest. Once entered the chain never exits;
//! it exists to be observed from outside (profilers, hardware counters).
//!
//! ## Pipeline
//!
//! ```text
//! config ─► plan (modular → roots → permutation) ─► chain::encode ─► handoff
//!                                                        │              ├─ native (region)
//!                                                        │              └─ guest  (kvm + paging)
//!                                                        └─► verify / trace / digest
//! ```

pub mod chain;
pub mod config;
pub mod handoff;
#[cfg(target_os = "linux")]
pub mod kvm;
pub mod modular;
pub mod paging;
pub mod permutation;
pub mod plan;
pub mod region;
pub mod roots;
