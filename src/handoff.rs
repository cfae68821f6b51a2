//! # Handoff — Transferring Control to the Chain
//!
//! The last step of a run. Both forms encode the permutation into memory the
//! executing CPU can reach, then jump to slot 0 and never come back:
//!
//! - **Native** (`enter_native`): the chain is written into an executable
//!   mapping of this process and entered with a bare `jmp` (no return
//!   address). Only possible on x86-64.
//! - **Guest** (`enter_guest`): the chain is written into the memory of an
//!   isolated virtual machine behind the `IsolatedContext` capability trait,
//!   the vCPU is put in flat paged protected mode with its instruction
//!   pointer on slot 0, and resumed. Any exit the hypervisor reports is fatal
//!   and surfaces as `HandoffError::GuestExited`.
//!
//! Success is `Infallible`: the only values these functions can return are
//! errors.

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::mem::ManuallyDrop;
use tracing::info;

use crate::chain::{self, AddressWidth, ChainLayout, EncodeError};
use crate::paging::{FlatMapping, PagingError};
use crate::permutation::Permutation;
use crate::region::MappedRegion;

/// Why a guest stopped running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The guest executed `hlt`.
    Halt,
    /// Triple fault or similar unrecoverable guest state.
    Shutdown,
    /// VM entry was refused by the hardware.
    FailEntry { hardware_reason: u64 },
    /// The hypervisor could not emulate something.
    InternalError { suberror: u32 },
    /// Port I/O the hypervisor handed to userspace.
    Io,
    /// MMIO access outside guest memory.
    Mmio,
    /// An exception the hypervisor forwarded.
    Exception { vector: u32, error_code: u32 },
    /// Anything else, by raw hypervisor code.
    Other { code: u32 },
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Halt => write!(f, "guest halted"),
            ExitReason::Shutdown => write!(f, "guest shut down (triple fault)"),
            ExitReason::FailEntry { hardware_reason } => {
                write!(f, "VM entry failed (hardware reason {:#x})", hardware_reason)
            }
            ExitReason::InternalError { suberror } => {
                write!(f, "hypervisor internal error (suberror {})", suberror)
            }
            ExitReason::Io => write!(f, "guest port I/O"),
            ExitReason::Mmio => write!(f, "guest MMIO access"),
            ExitReason::Exception { vector, error_code } => {
                write!(f, "guest exception {} (error code {:#x})", vector, error_code)
            }
            ExitReason::Other { code } => write!(f, "guest exit reason {}", code),
        }
    }
}

/// Errors from handing control to the chain.
#[derive(Debug)]
pub enum HandoffError {
    /// The chain could not be encoded into the target memory.
    Encode(EncodeError),
    /// Page tables could not be laid out in guest memory.
    Paging(PagingError),
    /// The chain would overlap memory reserved for page tables.
    LayoutConflict { chain_end: u64, reserved_start: u64 },
    /// An environment setup call failed.
    Setup { step: &'static str, source: io::Error },
    /// The hypervisor speaks a different API revision.
    ApiVersion { found: i32, expected: i32 },
    /// The guest stopped running.
    GuestExited(ExitReason),
    /// Native handoff needs an x86-64 host.
    UnsupportedArch,
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::Encode(e) => write!(f, "encoding jump chain: {}", e),
            HandoffError::Paging(e) => write!(f, "building guest page tables: {}", e),
            HandoffError::LayoutConflict {
                chain_end,
                reserved_start,
            } => write!(
                f,
                "chain ends at {:#x}, past the page tables at {:#x}",
                chain_end, reserved_start
            ),
            HandoffError::Setup { step, source } => write!(f, "{} failed: {}", step, source),
            HandoffError::ApiVersion { found, expected } => write!(
                f,
                "hypervisor API version {}, expected {}",
                found, expected
            ),
            HandoffError::GuestExited(reason) => write!(f, "guest exited: {}", reason),
            HandoffError::UnsupportedArch => {
                write!(f, "native handoff is only supported on x86-64")
            }
        }
    }
}

impl std::error::Error for HandoffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandoffError::Encode(e) => Some(e),
            HandoffError::Paging(e) => Some(e),
            HandoffError::Setup { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<EncodeError> for HandoffError {
    fn from(e: EncodeError) -> Self {
        HandoffError::Encode(e)
    }
}

impl From<PagingError> for HandoffError {
    fn from(e: PagingError) -> Self {
        HandoffError::Paging(e)
    }
}

/// Something that can create isolated guests.
pub trait Hypervisor {
    type Context: IsolatedContext;

    /// A fresh guest with `memory_size` bytes of zeroed RAM at guest-physical 0.
    fn create_isolated_context(&self, memory_size: u64) -> Result<Self::Context, HandoffError>;
}

/// One isolated guest with a single vCPU.
pub trait IsolatedContext {
    /// Guest RAM, guest-physical address 0 at index 0.
    fn memory_mut(&mut self) -> &mut [u8];

    /// Identity-map all guest memory and switch the vCPU to flat paged
    /// protected mode.
    fn install_flat_mapping(&mut self) -> Result<FlatMapping, HandoffError>;

    /// Point the instruction pointer at `address` with clear flags.
    fn set_entry_point(&mut self, address: u64) -> Result<(), HandoffError>;

    /// Run the vCPU until it stops.
    fn resume(&mut self) -> Result<ExitReason, HandoffError>;
}

/// Where the chain goes inside guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestPlacement {
    /// Guest address of instruction slot 0.
    pub offset: u64,
    /// Bytes for both areas together, split evenly.
    pub span: u64,
}

/// Encode `perm` into the guest, set it up and resume it. Returns only on
/// failure, including any guest exit.
pub fn enter_guest<C: IsolatedContext>(
    ctx: &mut C,
    perm: Permutation,
    placement: GuestPlacement,
) -> Result<Infallible, HandoffError> {
    let mapping = ctx.install_flat_mapping()?;
    let layout = ChainLayout::split(0, placement.offset, placement.span, AddressWidth::Unsigned32);
    if layout.end_offset() > mapping.tables_start {
        return Err(HandoffError::LayoutConflict {
            chain_end: layout.end_offset(),
            reserved_start: mapping.tables_start,
        });
    }

    let summary = chain::encode(&perm, ctx.memory_mut(), &layout)?;
    drop(perm);
    ctx.set_entry_point(summary.entry_address)?;

    info!(
        pid = std::process::id(),
        entries = summary.entries,
        entry = format_args!("{:#x}", summary.entry_address),
        digest = %summary.digest,
        page_tables = mapping.table_count,
        "resuming guest"
    );
    let reason = ctx.resume()?;
    Err(HandoffError::GuestExited(reason))
}

/// Encode `perm` at the start of `region` and jump into it. Returns only if
/// the chain cannot be encoded or the host is not x86-64.
pub fn enter_native(mut region: MappedRegion, perm: Permutation) -> Result<Infallible, HandoffError> {
    let layout = ChainLayout::split(
        region.base_address(),
        0,
        region.len() as u64,
        AddressWidth::Signed32,
    );
    let summary = chain::encode(&perm, region.as_mut_slice(), &layout)?;
    drop(perm);

    info!(
        pid = std::process::id(),
        entries = summary.entries,
        entry = format_args!("{:#x}", summary.entry_address),
        digest = %summary.digest,
        "jumping to chain"
    );

    // The chain runs for the rest of the process; its memory must never be
    // unmapped.
    let _region = ManuallyDrop::new(region);
    jump_to(summary.entry_address)
}

#[cfg(target_arch = "x86_64")]
fn jump_to(entry: u64) -> Result<Infallible, HandoffError> {
    // SAFETY: `entry` is slot 0 of a chain that `chain::encode` wrote and
    // verified in RWX memory that is never unmapped. Every slot jumps to
    // another verified slot, so control never leaves the chain and nothing
    // after this point runs.
    unsafe {
        std::arch::asm!("jmp {0}", in(reg) entry, options(noreturn));
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn jump_to(_entry: u64) -> Result<Infallible, HandoffError> {
    Err(HandoffError::UnsupportedArch)
}
