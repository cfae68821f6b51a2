//! # Chain — Jump-Chain Encoder
//!
//! Materialises a `Permutation` as executable x86 code: one indirect jump per
//! index, each loading its destination from a per-index target word.
//!
//! ## Layout
//!
//! ```text
//! instr area:  [ FF 24 25 t0 t0 t0 t0 ][ FF 24 25 t1 ... ] ...   7 bytes / entry
//! target area: [ j(next(0)) 00 00 00 00 ][ j(next(1)) ... ] ...   8 bytes / entry
//! ```
//!
//! `FF /4` with ModRM 0x24 and SIB 0x25 is `jmp [disp32]`: no base, no index,
//! absolute 32-bit displacement. Entry i's displacement is the address of
//! target word i, and target word i holds the address of instruction
//! next(i). The target word is 8 bytes so a 64-bit `jmp` reads a clean
//! zero-extended pointer; a 32-bit guest reads only the low half.
//!
//! ## Address Width
//!
//! In 64-bit mode disp32 is sign-extended, so every address the chain touches
//! must be below 2^31 (`AddressWidth::Signed32`). In 32-bit protected mode
//! it is used as-is and must be below 2^32 (`AddressWidth::Unsigned32`).
//! `encode` refuses any layout that would cross the limit or overflow an area.
//!
//! ## Verification
//!
//! Nothing at the language level can vouch for generated machine code, so the
//! encoder re-decodes every slot after writing it (`verify`) and `trace`
//! follows the encoded jumps in software to prove the chain closes after
//! exactly n hops. A SHA-256 digest of the used bytes is returned for external
//! comparison.

use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

use crate::permutation::Permutation;

/// `jmp [disp32]` opcode, ModRM and SIB bytes.
pub const JMP_TEMPLATE: [u8; 3] = [0xFF, 0x24, 0x25];
/// Bytes per encoded jump.
pub const INSTR_STRIDE: u64 = 7;
/// Bytes per target word.
pub const TARGET_STRIDE: u64 = 8;

/// How the executing CPU interprets the 32-bit absolute operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressWidth {
    /// 64-bit mode: sign-extended, usable addresses are < 2^31.
    Signed32,
    /// 32-bit protected mode: zero-extended, usable addresses are < 2^32.
    Unsigned32,
}

impl AddressWidth {
    /// One past the highest usable address.
    pub fn limit(self) -> u64 {
        match self {
            AddressWidth::Signed32 => 1 << 31,
            AddressWidth::Unsigned32 => 1 << 32,
        }
    }
}

/// Errors from encoding or verifying a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// An area does not fit in the region.
    OutOfRegion { area: &'static str, end: u64, region_len: u64 },
    /// The instruction and target areas overlap.
    Overlap,
    /// More entries than an area has room for.
    TooManyEntries { area: &'static str, entries: u64, capacity: u64 },
    /// An address the chain would use is not encodable.
    AddressOverflow { address: u64, limit: u64 },
    /// A decoded slot does not match what should have been written.
    Corrupt { index: u64, reason: &'static str },
    /// The software trace left the instruction area.
    StrayJump { address: u64 },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::OutOfRegion {
                area,
                end,
                region_len,
            } => write!(
                f,
                "{} area ends at offset {:#x}, past the {:#x}-byte region",
                area, end, region_len
            ),
            EncodeError::Overlap => write!(f, "instruction and target areas overlap"),
            EncodeError::TooManyEntries {
                area,
                entries,
                capacity,
            } => write!(
                f,
                "{} entries do not fit the {} area (capacity {})",
                entries, area, capacity
            ),
            EncodeError::AddressOverflow { address, limit } => write!(
                f,
                "chain address {:#x} is not below the {:#x} encoding limit",
                address, limit
            ),
            EncodeError::Corrupt { index, reason } => {
                write!(f, "chain slot {} is corrupt: {}", index, reason)
            }
            EncodeError::StrayJump { address } => {
                write!(f, "jump to {:#x} does not land on an instruction slot", address)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Where the chain lives inside a region, and what the region's byte 0 is
/// called by the executing CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLayout {
    /// Absolute address of region offset 0.
    pub base_address: u64,
    pub instr_offset: u64,
    pub instr_capacity: u64,
    pub target_offset: u64,
    pub target_capacity: u64,
    pub width: AddressWidth,
}

impl ChainLayout {
    /// Instructions in the first half of `span` bytes at `offset`, targets in
    /// the second half.
    pub fn split(base_address: u64, offset: u64, span: u64, width: AddressWidth) -> Self {
        let half = span / 2;
        ChainLayout {
            base_address,
            instr_offset: offset,
            instr_capacity: half,
            target_offset: offset + half,
            target_capacity: half,
            width,
        }
    }

    /// Address of instruction slot `i`.
    #[inline]
    pub fn instr_address(&self, i: u64) -> u64 {
        self.base_address + self.instr_offset + i * INSTR_STRIDE
    }

    /// Address of target word `i`.
    #[inline]
    pub fn target_address(&self, i: u64) -> u64 {
        self.base_address + self.target_offset + i * TARGET_STRIDE
    }

    /// First instruction of the chain (slot 0).
    pub fn entry_address(&self) -> u64 {
        self.instr_address(0)
    }

    /// One past the last region offset either area may use.
    pub fn end_offset(&self) -> u64 {
        (self.instr_offset + self.instr_capacity).max(self.target_offset + self.target_capacity)
    }

    /// Check that `entries` slots fit in a region of `region_len` bytes and
    /// that every address they use is encodable.
    pub fn validate(&self, entries: u64, region_len: u64) -> Result<(), EncodeError> {
        let areas = [
            ("instruction", self.instr_offset, self.instr_capacity, INSTR_STRIDE),
            ("target", self.target_offset, self.target_capacity, TARGET_STRIDE),
        ];
        for (area, offset, capacity, stride) in areas {
            let end = offset.checked_add(capacity).ok_or(EncodeError::OutOfRegion {
                area,
                end: u64::MAX,
                region_len,
            })?;
            if end > region_len {
                return Err(EncodeError::OutOfRegion {
                    area,
                    end,
                    region_len,
                });
            }
            let needed = entries.checked_mul(stride).unwrap_or(u64::MAX);
            if needed > capacity {
                return Err(EncodeError::TooManyEntries {
                    area,
                    entries,
                    capacity: capacity / stride,
                });
            }
        }

        let instr_end = self.instr_offset + self.instr_capacity;
        let target_end = self.target_offset + self.target_capacity;
        if self.instr_offset < target_end && self.target_offset < instr_end {
            return Err(EncodeError::Overlap);
        }

        // Highest byte the CPU reads: last jump's final operand byte or last
        // target word's final byte.
        let limit = self.width.limit();
        let last = entries.saturating_sub(1);
        let highest = self.base_address.saturating_add(
            (self.instr_offset + last * INSTR_STRIDE + INSTR_STRIDE - 1)
                .max(self.target_offset + last * TARGET_STRIDE + TARGET_STRIDE - 1),
        );
        if highest >= limit {
            return Err(EncodeError::AddressOverflow {
                address: highest,
                limit,
            });
        }
        Ok(())
    }
}

/// Result of a successful encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSummary {
    pub entries: u64,
    pub entry_address: u64,
    /// Hex SHA-256 over the used instruction bytes then the used target bytes.
    pub digest: String,
}

/// Encode `perm` into `region` according to `layout`.
///
/// Both areas are zeroed in full first, then every slot is written and
/// re-verified. The region is left untouched if validation fails.
pub fn encode(
    perm: &Permutation,
    region: &mut [u8],
    layout: &ChainLayout,
) -> Result<ChainSummary, EncodeError> {
    let entries = perm.len() as u64;
    layout.validate(entries, region.len() as u64)?;

    zero_area(region, layout.instr_offset, layout.instr_capacity);
    zero_area(region, layout.target_offset, layout.target_capacity);

    for (i, &next) in perm.as_slice().iter().enumerate() {
        let i = i as u64;
        let target = layout.target_address(i) as u32;
        let next_instr = layout.instr_address(next as u64);

        let t = (layout.target_offset + i * TARGET_STRIDE) as usize;
        region[t..t + TARGET_STRIDE as usize].copy_from_slice(&next_instr.to_le_bytes());

        let j = (layout.instr_offset + i * INSTR_STRIDE) as usize;
        region[j..j + 3].copy_from_slice(&JMP_TEMPLATE);
        region[j + 3..j + INSTR_STRIDE as usize].copy_from_slice(&target.to_le_bytes());
    }

    verify(perm, region, layout)?;

    let summary = ChainSummary {
        entries,
        entry_address: layout.entry_address(),
        digest: digest(region, layout, entries),
    };
    debug!(
        entries,
        entry = format_args!("{:#x}", summary.entry_address),
        digest = %summary.digest,
        "jump chain encoded"
    );
    Ok(summary)
}

fn zero_area(region: &mut [u8], offset: u64, len: u64) {
    region[offset as usize..(offset + len) as usize].fill(0);
}

fn read_u32(region: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&region[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(region: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&region[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Decode instruction slot `i`: the absolute operand of its `jmp [disp32]`,
/// or `None` if the opcode bytes are not the jump template.
pub fn decode_instruction(region: &[u8], layout: &ChainLayout, i: u64) -> Option<u32> {
    let j = (layout.instr_offset + i * INSTR_STRIDE) as usize;
    if region[j..j + 3] != JMP_TEMPLATE {
        return None;
    }
    Some(read_u32(region, j + 3))
}

/// Read target word `i`.
pub fn read_target(region: &[u8], layout: &ChainLayout, i: u64) -> u64 {
    read_u64(region, (layout.target_offset + i * TARGET_STRIDE) as usize)
}

/// Map an instruction address back to its slot index.
pub fn instr_index(layout: &ChainLayout, address: u64, entries: u64) -> Result<u64, EncodeError> {
    let origin = layout.instr_address(0);
    let rel = address
        .checked_sub(origin)
        .ok_or(EncodeError::StrayJump { address })?;
    if !rel.is_multiple_of(INSTR_STRIDE) || rel / INSTR_STRIDE >= entries {
        return Err(EncodeError::StrayJump { address });
    }
    Ok(rel / INSTR_STRIDE)
}

/// Check every slot: jump template present, operand names target word i,
/// target word i names instruction next(i).
pub fn verify(perm: &Permutation, region: &[u8], layout: &ChainLayout) -> Result<(), EncodeError> {
    for (i, &next) in perm.as_slice().iter().enumerate() {
        let i = i as u64;
        let operand = decode_instruction(region, layout, i).ok_or(EncodeError::Corrupt {
            index: i,
            reason: "opcode bytes differ from jmp [disp32]",
        })?;
        if operand as u64 != layout.target_address(i) {
            return Err(EncodeError::Corrupt {
                index: i,
                reason: "operand does not address its own target word",
            });
        }
        if read_target(region, layout, i) != layout.instr_address(next as u64) {
            return Err(EncodeError::Corrupt {
                index: i,
                reason: "target word does not address the successor instruction",
            });
        }
    }
    Ok(())
}

/// Decode slot `slot`'s jump and the target word it reads; return the slot
/// control lands on.
pub fn hop(region: &[u8], layout: &ChainLayout, entries: u64, slot: u64) -> Result<u64, EncodeError> {
    let operand = decode_instruction(region, layout, slot).ok_or(EncodeError::Corrupt {
        index: slot,
        reason: "opcode bytes differ from jmp [disp32]",
    })? as u64;
    let rel = operand
        .checked_sub(layout.target_address(0))
        .filter(|rel| rel.is_multiple_of(TARGET_STRIDE) && rel / TARGET_STRIDE < entries)
        .ok_or(EncodeError::Corrupt {
            index: slot,
            reason: "operand does not address a target word",
        })?;
    let destination = read_target(region, layout, rel / TARGET_STRIDE);
    instr_index(layout, destination, entries)
}

/// Follow `steps` encoded jumps from slot 0 and return the slots visited
/// after each hop.
pub fn trace(
    region: &[u8],
    layout: &ChainLayout,
    entries: u64,
    steps: u64,
) -> Result<Vec<u64>, EncodeError> {
    let mut visited = Vec::with_capacity(steps as usize);
    let mut slot = 0u64;
    for _ in 0..steps {
        slot = hop(region, layout, entries, slot)?;
        visited.push(slot);
    }
    Ok(visited)
}

/// Number of encoded jumps from slot 0 until control first returns to it,
/// or `None` if it has not returned after `entries` hops.
pub fn lap_length(region: &[u8], layout: &ChainLayout, entries: u64) -> Result<Option<u64>, EncodeError> {
    let mut slot = 0u64;
    for hops in 1..=entries {
        slot = hop(region, layout, entries, slot)?;
        if slot == 0 {
            return Ok(Some(hops));
        }
    }
    Ok(None)
}

/// Hex SHA-256 of the used instruction bytes followed by the used target bytes.
pub fn digest(region: &[u8], layout: &ChainLayout, entries: u64) -> String {
    let instr = layout.instr_offset as usize;
    let target = layout.target_offset as usize;
    let mut hasher = Sha256::new();
    hasher.update(&region[instr..instr + (entries * INSTR_STRIDE) as usize]);
    hasher.update(&region[target..target + (entries * TARGET_STRIDE) as usize]);
    format!("{:x}", hasher.finalize())
}
