//! # Paging — Flat 32-bit Protected Mode for the Guest
//!
//! Builds everything a bare x86 vCPU needs to run the chain in 32-bit paged
//! protected mode, as plain data independent of any hypervisor:
//!
//! - An identity-mapped two-level page table (4 KiB pages, no PSE) covering
//!   all of guest memory. The directory sits in the top page of guest memory
//!   and one page table per 4 MiB sits directly below it.
//! - Flat code and data segment descriptors (base 0, limit 4 GiB, 32-bit).
//! - Control register values: CR0 = PE | MP | ET | NE | AM | PG, CR3 = the
//!   directory, CR4 = EFER = 0.
//!
//! 4 KiB pages are deliberate: the chain is a TLB probe, large pages would
//! hide the misses it exists to provoke.

use std::fmt;

pub const PAGE_SIZE: u64 = 0x1000;
/// Bytes mapped by one page table (1024 entries of 4 KiB).
pub const TABLE_SPAN: u64 = 1024 * PAGE_SIZE;
/// Largest guest memory a 32-bit page directory can map.
pub const MAX_GUEST_MEMORY: u64 = 1 << 32;

pub const CR0_PE: u64 = 1;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_ET: u64 = 1 << 4;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_AM: u64 = 1 << 18;
pub const CR0_PG: u64 = 1 << 31;

pub const PDE32_PRESENT: u32 = 1;
pub const PDE32_RW: u32 = 1 << 1;
pub const PDE32_USER: u32 = 1 << 2;

const ENTRY_FLAGS: u32 = PDE32_PRESENT | PDE32_RW | PDE32_USER;

/// RFLAGS with every flag clear except the always-set bit 1.
pub const INITIAL_RFLAGS: u64 = 2;

pub const CODE_SELECTOR: u16 = 1 << 3;
pub const DATA_SELECTOR: u16 = 2 << 3;

/// Errors from laying out guest page tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagingError {
    /// Memory size must be a whole number of pages.
    Unaligned { size: u64 },
    /// More memory than 32-bit paging can address.
    TooLarge { size: u64 },
    /// Not enough memory for the tables plus at least one free page.
    TooSmall { size: u64, needed: u64 },
}

impl fmt::Display for PagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PagingError::Unaligned { size } => {
                write!(f, "guest memory size {:#x} is not page aligned", size)
            }
            PagingError::TooLarge { size } => write!(
                f,
                "guest memory size {:#x} exceeds the {:#x} 32-bit paging limit",
                size, MAX_GUEST_MEMORY
            ),
            PagingError::TooSmall { size, needed } => write!(
                f,
                "guest memory size {:#x} cannot hold {:#x} bytes of page tables",
                size, needed
            ),
        }
    }
}

impl std::error::Error for PagingError {}

/// Segment descriptor state, in the shape hypervisors expose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: bool,
    pub dpl: u8,
    /// 32-bit default operand size.
    pub db: bool,
    /// Code/data (as opposed to system) descriptor.
    pub s: bool,
    /// 64-bit code.
    pub l: bool,
    /// 4 KiB limit granularity.
    pub g: bool,
}

/// Execute/read, accessed code segment spanning 4 GiB.
pub fn flat_code_segment() -> Segment {
    Segment {
        base: 0,
        limit: 0xffff_ffff,
        selector: CODE_SELECTOR,
        type_: 11,
        present: true,
        dpl: 0,
        db: true,
        s: true,
        l: false,
        g: true,
    }
}

/// Read/write, accessed data segment spanning 4 GiB.
pub fn flat_data_segment() -> Segment {
    Segment {
        selector: DATA_SELECTOR,
        type_: 3,
        ..flat_code_segment()
    }
}

/// Where the identity mapping's tables ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatMapping {
    /// Guest-physical address of the page directory (CR3).
    pub directory: u64,
    /// Lowest guest address used by the tables; everything below is free.
    pub tables_start: u64,
    pub table_count: u64,
    pub mapped_bytes: u64,
}

/// Control registers and segments for flat paged protected mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedModeState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub code: Segment,
    pub data: Segment,
}

impl ProtectedModeState {
    pub fn for_mapping(mapping: &FlatMapping) -> Self {
        ProtectedModeState {
            cr0: CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_AM | CR0_PG,
            cr3: mapping.directory,
            cr4: 0,
            efer: 0,
            code: flat_code_segment(),
            data: flat_data_segment(),
        }
    }
}

fn write_u32(mem: &mut [u8], at: u64, value: u32) {
    let at = at as usize;
    mem[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(mem: &[u8], at: u64) -> u32 {
    let at = at as usize;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&mem[at..at + 4]);
    u32::from_le_bytes(bytes)
}

/// Write an identity mapping of all of `mem` into its top pages.
pub fn install_flat_page_tables(mem: &mut [u8]) -> Result<FlatMapping, PagingError> {
    let size = mem.len() as u64;
    if !size.is_multiple_of(PAGE_SIZE) {
        return Err(PagingError::Unaligned { size });
    }
    if size > MAX_GUEST_MEMORY {
        return Err(PagingError::TooLarge { size });
    }
    let table_count = size.div_ceil(TABLE_SPAN);
    let needed = (table_count + 1) * PAGE_SIZE;
    if needed >= size {
        return Err(PagingError::TooSmall { size, needed });
    }

    let directory = size - PAGE_SIZE;
    let tables_start = directory - table_count * PAGE_SIZE;
    mem[tables_start as usize..size as usize].fill(0);

    for i in 0..table_count {
        let table = directory - (i + 1) * PAGE_SIZE;
        write_u32(mem, directory + i * 4, ENTRY_FLAGS | table as u32);
        for j in 0..1024u64 {
            let frame = i * TABLE_SPAN + j * PAGE_SIZE;
            if frame >= size {
                break;
            }
            write_u32(mem, table + j * 4, ENTRY_FLAGS | frame as u32);
        }
    }

    Ok(FlatMapping {
        directory,
        tables_start,
        table_count,
        mapped_bytes: size,
    })
}

/// Walk the two-level tables rooted at `cr3` the way the MMU would.
pub fn translate(mem: &[u8], cr3: u64, vaddr: u32) -> Option<u64> {
    let pde = read_u32(mem, cr3 + ((vaddr >> 22) as u64) * 4);
    if pde & PDE32_PRESENT == 0 {
        return None;
    }
    let table = (pde & !0xfff) as u64;
    let pte = read_u32(mem, table + (((vaddr >> 12) & 0x3ff) as u64) * 4);
    if pte & PDE32_PRESENT == 0 {
        return None;
    }
    Some((pte & !0xfff) as u64 | (vaddr & 0xfff) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    #[test]
    fn identity_maps_every_page() {
        let mut mem = vec![0u8; (16 * MIB) as usize];
        let mapping = install_flat_page_tables(&mut mem).unwrap();
        assert_eq!(mapping.directory, 16 * MIB - PAGE_SIZE);
        assert_eq!(mapping.table_count, 4);
        assert_eq!(mapping.tables_start, 16 * MIB - 5 * PAGE_SIZE);
        for page in 0..(16 * MIB / PAGE_SIZE) {
            let addr = page * PAGE_SIZE + 0x123;
            assert_eq!(translate(&mem, mapping.directory, addr as u32), Some(addr));
        }
    }

    #[test]
    fn entries_carry_present_rw_user() {
        let mut mem = vec![0u8; (8 * MIB) as usize];
        let mapping = install_flat_page_tables(&mut mem).unwrap();
        let pde0 = read_u32(&mem, mapping.directory);
        assert_eq!(pde0 & 0xfff, 0x7);
        assert_eq!((pde0 & !0xfff) as u64, mapping.directory - PAGE_SIZE);
        let pte1 = read_u32(&mem, mapping.directory - PAGE_SIZE + 4);
        assert_eq!(pte1, 0x1000 | 0x7);
    }

    /// 6 MiB needs two tables; the second is only half populated and
    /// addresses past the end of memory stay unmapped.
    #[test]
    fn partial_last_table() {
        let mut mem = vec![0u8; (6 * MIB) as usize];
        let mapping = install_flat_page_tables(&mut mem).unwrap();
        assert_eq!(mapping.table_count, 2);
        let last = 6 * MIB - 1;
        assert_eq!(translate(&mem, mapping.directory, last as u32), Some(last));
        assert_eq!(translate(&mem, mapping.directory, (6 * MIB) as u32), None);
        assert_eq!(translate(&mem, mapping.directory, (8 * MIB) as u32), None);
    }

    #[test]
    fn stale_table_bytes_are_cleared() {
        let mut mem = vec![0xFFu8; (6 * MIB) as usize];
        let mapping = install_flat_page_tables(&mut mem).unwrap();
        // directory entries past the table count must not be present
        assert_eq!(read_u32(&mem, mapping.directory + 2 * 4), 0);
    }

    #[test]
    fn rejects_bad_sizes() {
        let mut small = vec![0u8; 2 * PAGE_SIZE as usize];
        assert_eq!(
            install_flat_page_tables(&mut small),
            Err(PagingError::TooSmall {
                size: 2 * PAGE_SIZE,
                needed: 2 * PAGE_SIZE
            })
        );
        let mut odd = vec![0u8; 3 * PAGE_SIZE as usize + 1];
        assert!(matches!(
            install_flat_page_tables(&mut odd),
            Err(PagingError::Unaligned { .. })
        ));
    }

    #[test]
    fn protected_mode_state_is_flat_and_paged() {
        let mapping = FlatMapping {
            directory: 0xffff_f000,
            tables_start: 0xffbf_f000,
            table_count: 1024,
            mapped_bytes: 1 << 32,
        };
        let state = ProtectedModeState::for_mapping(&mapping);
        assert_eq!(state.cr3, 0xffff_f000);
        assert_ne!(state.cr0 & CR0_PE, 0);
        assert_ne!(state.cr0 & CR0_PG, 0);
        assert_eq!(state.cr4, 0);
        assert_eq!(state.code.selector, 8);
        assert_eq!(state.data.selector, 16);
        assert_eq!(state.code.type_, 11);
        assert_eq!(state.data.type_, 3);
        assert!(state.data.db && state.data.g);
        assert_eq!(state.data.limit, 0xffff_ffff);
    }
}
