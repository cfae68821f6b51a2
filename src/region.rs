//! # Region — Anonymous Memory Mappings
//!
//! RAII wrappers around `mmap` for the two kinds of memory the chain is
//! written into:
//!
//! - **Executable** (`MappedRegion::executable`): private anonymous RWX memory
//!   in this process, mapped near a low address hint so that native chain
//!   addresses stay below 2^31.
//! - **Guest RAM** (`MappedRegion::guest_memory`): private anonymous RW memory
//!   with `MAP_NORESERVE`, handed to the hypervisor as guest-physical memory.
//!   Pages are only committed when touched, so a 4 GiB guest costs what the
//!   chain and page tables actually use.
//!
//! The region is unmapped on drop. Nothing in this module executes the memory.

use std::fmt;
use std::io;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Errors from creating a mapping.
#[derive(Debug)]
pub enum RegionError {
    /// Zero-length mappings are not allowed.
    Empty,
    /// `mmap` failed.
    MapFailed { len: usize, source: io::Error },
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::Empty => write!(f, "cannot map an empty region"),
            RegionError::MapFailed { len, source } => {
                write!(f, "mmap of {:#x} bytes failed: {}", len, source)
            }
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegionError::MapFailed { source, .. } => Some(source),
            RegionError::Empty => None,
        }
    }
}

/// An owned anonymous mapping.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory owned exclusively by this value.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Readable, writable and executable memory of `len` bytes, placed at
    /// `hint` if the kernel allows it. The returned base may differ from the
    /// hint; callers must check it against their address limits.
    pub fn executable(len: usize, hint: u64) -> Result<Self, RegionError> {
        let region = Self::map(
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            hint,
        )?;
        if hint != ANY_ADDRESS && region.base_address() != hint {
            warn!(
                hint = format_args!("{:#x}", hint),
                base = format_args!("{:#x}", region.base_address()),
                "executable region not placed at requested address"
            );
        }
        Ok(region)
    }

    /// Lazily committed read/write memory of `len` bytes for use as guest RAM.
    pub fn guest_memory(len: usize) -> Result<Self, RegionError> {
        let region = Self::map(
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            0,
        )?;
        #[cfg(target_os = "linux")]
        for advice in [libc::MADV_MERGEABLE, libc::MADV_NOHUGEPAGE] {
            // SAFETY: the range is exactly the mapping created above.
            let rc = unsafe { libc::madvise(region.ptr.as_ptr().cast(), len, advice) };
            if rc != 0 {
                debug!(advice, error = %io::Error::last_os_error(), "madvise ignored");
            }
        }
        Ok(region)
    }

    fn map(len: usize, prot: libc::c_int, flags: libc::c_int, hint: u64) -> Result<Self, RegionError> {
        if len == 0 {
            return Err(RegionError::Empty);
        }
        // SAFETY: anonymous mapping with no fixed placement; the kernel picks
        // a free range (preferring `hint`) and nothing else aliases it.
        let raw = unsafe { libc::mmap(hint as *mut libc::c_void, len, prot, flags, -1, 0) };
        if raw == libc::MAP_FAILED {
            return Err(RegionError::MapFailed {
                len,
                source: io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| RegionError::MapFailed {
            len,
            source: io::Error::other("mmap returned null"),
        })?;
        debug!(
            base = format_args!("{:#x}", ptr.as_ptr() as u64),
            len = format_args!("{:#x}", len),
            "region mapped"
        );
        Ok(MappedRegion { ptr, len })
    }

    /// Process address of byte 0.
    pub fn base_address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+len is a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the range returned by mmap.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &format_args!("{:#x}", self.base_address()))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

/// Null hint, for callers that do not care where the region lands.
pub const ANY_ADDRESS: u64 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_memory_starts_zeroed_and_is_writable() {
        let mut region = MappedRegion::guest_memory(1 << 20).unwrap();
        assert_eq!(region.len(), 1 << 20);
        assert!(region.as_slice().iter().all(|&b| b == 0));
        region.as_mut_slice()[12345] = 0x5A;
        assert_eq!(region.as_slice()[12345], 0x5A);
    }

    #[test]
    fn executable_region_is_page_aligned() {
        let region = MappedRegion::executable(1 << 16, ANY_ADDRESS).unwrap();
        assert_ne!(region.base_address(), 0);
        assert_eq!(region.base_address() % 4096, 0);
    }

    #[test]
    fn empty_region_is_rejected() {
        assert!(matches!(
            MappedRegion::guest_memory(0),
            Err(RegionError::Empty)
        ));
    }
}
