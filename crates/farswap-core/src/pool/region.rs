//! Anonymous memory backing one chunk.

use crate::{Error, Result};
use nix::libc;
use std::ptr::NonNull;

/// A private anonymous mapping of one chunk.
///
/// The mapping is created with `MAP_NORESERVE`, so pages are only committed
/// when the remote client touches them; dropping the region unmaps it and
/// returns the memory to the host.
#[derive(Debug)]
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is owned exclusively by this value and is only ever
// accessed remotely through its registration; no Rust references alias it.
unsafe impl Send for MemoryRegion {}
// SAFETY: see above; &MemoryRegion only exposes the address and length.
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Map `len` bytes of anonymous memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Region`] if `len` is zero or `mmap` fails.
    pub fn allocate(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Region("cannot map a zero-length region".to_string()));
        }
        // SAFETY: anonymous mapping with no fixed address; the result is
        // checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Region(format!(
                "mmap of {len} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Region("mmap returned null".to_string()))?;
        Ok(Self { ptr, len })
    }

    /// Base address of the mapping.
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-length regions cannot be created.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a live mapping created in `allocate`.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if rc != 0 {
            tracing::error!(
                addr = self.addr(),
                len = self.len,
                error = %std::io::Error::last_os_error(),
                "munmap failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_drop() {
        let region = MemoryRegion::allocate(64 * 1024).unwrap();
        assert_eq!(region.len(), 64 * 1024);
        assert!(!region.is_empty());
        assert_ne!(region.addr(), 0);
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(MemoryRegion::allocate(0), Err(Error::Region(_))));
    }

    #[test]
    fn test_regions_do_not_overlap() {
        let a = MemoryRegion::allocate(4096).unwrap();
        let b = MemoryRegion::allocate(4096).unwrap();
        let (lo, hi) = if a.addr() < b.addr() { (&a, &b) } else { (&b, &a) };
        assert!(lo.addr() + lo.len() as u64 <= hi.addr());
    }
}
