//! Host virtual mappings backing guest RAM.
//!
//! Every RAM range gets its own anonymous `MAP_SHARED` mapping. Ownership of a
//! mapping is tied to [`HostMapping`], whose `Drop` unmaps it, so a failed
//! multi-range allocation is rolled back simply by dropping what was built.

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Anything that occupies a host virtual address range.
pub trait HostRegion {
    fn host_addr(&self) -> u64;
    fn len(&self) -> usize;
}

/// Source of host mappings for guest RAM ranges.
///
/// The production implementation is [`AnonymousMapper`]; tests substitute
/// mappers that fail on demand or count releases.
pub trait RegionMapper {
    type Region: HostRegion;

    /// Map `len` bytes of zero-filled, read-write, shared memory.
    fn map(&self, len: usize) -> io::Result<Self::Region>;
}

/// An owned anonymous mapping, unmapped on drop.
#[derive(Debug)]
pub struct HostMapping {
    addr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is plain memory with no thread affinity. Concurrent
// access to its contents is mediated by vm-memory's volatile accessors.
unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

impl HostMapping {
    /// Map shared, zero-filled, read-write anonymous memory.
    pub fn anonymous_shared(len: usize) -> io::Result<Self> {
        Self::map(
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED | MapFlags::MAP_NORESERVE,
        )
    }

    /// Reserve `len` bytes of address space with a read-only private mapping.
    ///
    /// Used as a placeholder to pick a free virtual range before the backing
    /// is moved into it.
    pub fn reserve(len: usize) -> io::Result<Self> {
        Self::map(len, ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE)
    }

    fn map(len: usize, prot: ProtFlags, flags: MapFlags) -> io::Result<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-length mapping"))?;
        // SAFETY: anonymous mapping at a kernel-chosen address; no existing
        // memory is affected.
        let addr = unsafe { mmap_anonymous(None, length, prot, flags) }?;
        Ok(Self { addr, len })
    }

    /// Take ownership of a mapping established outside this process's
    /// control (for example by the kernel moving a backing object).
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must be a live mapping that nothing else will
    /// unmap.
    pub unsafe fn adopt(addr: u64, len: usize) -> Option<Self> {
        NonNull::new(addr as *mut c_void).map(|addr| Self { addr, len })
    }

    /// Give up ownership without unmapping. Used when the backing has been
    /// moved to a different address and the old range is already gone.
    pub fn release(self) -> u64 {
        let addr = self.host_addr();
        std::mem::forget(self);
        addr
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr().cast()
    }
}

impl HostRegion for HostMapping {
    fn host_addr(&self) -> u64 {
        self.addr.as_ptr() as u64
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        // SAFETY: we own the mapping and nothing references it past drop.
        if let Err(e) = unsafe { munmap(self.addr, self.len) } {
            log::warn!("munmap({:#x}, {:#x}) failed: {}", self.host_addr(), self.len, e);
        }
    }
}

/// Maps each RAM range with [`HostMapping::anonymous_shared`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousMapper;

impl RegionMapper for AnonymousMapper {
    type Region = HostMapping;

    fn map(&self, len: usize) -> io::Result<HostMapping> {
        HostMapping::anonymous_shared(len)
    }
}

/// Move the pages of an existing mapping to `new_addr`, replacing whatever
/// is mapped there.
///
/// # Safety
///
/// `old_addr..old_addr + len` must be a mapping owned by the caller, and
/// `new_addr..new_addr + len` must be a range the caller may clobber.
pub unsafe fn move_mapping(old_addr: u64, new_addr: u64, len: usize) -> io::Result<()> {
    // SAFETY: upheld by the caller.
    let ret = unsafe {
        libc::mremap(
            old_addr as *mut c_void,
            len,
            len,
            libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
            new_addr as *mut c_void,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_mapping_is_zeroed_and_writable() {
        let m = HostMapping::anonymous_shared(8192).unwrap();
        assert_eq!(m.len(), 8192);
        // SAFETY: within the mapping we own.
        unsafe {
            assert_eq!(*m.as_ptr().add(4096), 0);
            *m.as_ptr().add(4096) = 0x5a;
            assert_eq!(*m.as_ptr().add(4096), 0x5a);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(HostMapping::anonymous_shared(0).is_err());
    }

    #[test]
    fn test_move_mapping_preserves_contents() {
        let src = HostMapping::anonymous_shared(4096).unwrap();
        // SAFETY: within the mapping we own.
        unsafe { *src.as_ptr() = 0xa5 };
        let dst = HostMapping::reserve(4096).unwrap();

        let new_addr = dst.release();
        // SAFETY: src is ours; new_addr was just reserved by us.
        unsafe { move_mapping(src.host_addr(), new_addr, 4096).unwrap() };
        src.release();

        // SAFETY: the backing now lives at new_addr.
        let moved = unsafe { HostMapping::adopt(new_addr, 4096) }.unwrap();
        // SAFETY: within the adopted mapping.
        assert_eq!(unsafe { *moved.as_ptr() }, 0xa5);
    }
}
