//! Guest physical memory.
//!
//! Guest RAM is described by an ordered list of [`MemoryRange`]s. RAM ranges
//! are backed by one independent anonymous shared mapping each; MMIO ranges
//! have no backing at all and keep a host address of zero.
//!
//! ```text
//! Guest Physical                     Host Virtual
//! ┌──────────────────┐ RAM    ┌──────────────────┐
//! │ 0x0000_0000      │ ─────► │ mapping #0       │
//! ├──────────────────┤ MMIO   └──────────────────┘
//! │ 0x000a_0000      │ (none)
//! ├──────────────────┤ RAM    ┌──────────────────┐
//! │ 0x0010_0000      │ ─────► │ mapping #2       │
//! └──────────────────┘        └──────────────────┘
//! ```
//!
//! Allocation is all-or-nothing: if any range fails to map, the ranges that
//! were already mapped are released before the error is returned.
//!
//! Reads and writes go through a `vm_memory::GuestMemoryMmap` view built over
//! the raw mappings, the same accessor layer the KVM backend registers with
//! the kernel.

mod mapping;

pub use mapping::{move_mapping, AnonymousMapper, HostMapping, HostRegion, RegionMapper};

use crate::hypervisor::{Hypervisor, HypervisorError, VmId};
use log::{debug, error, info};
use std::io;
use thiserror::Error;
use vm_memory::{
    Bytes, GuestAddress, GuestMemoryMmap, GuestRegionMmap, MmapRegion,
};

/// Guest page size. Migration streams memory in chunks of this size.
pub const PAGE_SIZE: u64 = 4096;

/// What backs a guest physical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Ram,
    Mmio,
}

/// One contiguous range of guest physical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// Guest physical base address.
    pub gpa: u64,
    /// Length in bytes.
    pub size: u64,
    pub kind: MemoryType,
    /// Host virtual address of the backing mapping, zero when unmapped.
    pub host_addr: u64,
}

impl MemoryRange {
    pub const fn ram(gpa: u64, size: u64) -> Self {
        Self {
            gpa,
            size,
            kind: MemoryType::Ram,
            host_addr: 0,
        }
    }

    pub const fn mmio(gpa: u64, size: u64) -> Self {
        Self {
            gpa,
            size,
            kind: MemoryType::Mmio,
            host_addr: 0,
        }
    }

    pub fn is_ram(&self) -> bool {
        self.kind == MemoryType::Ram
    }

    /// One past the last guest physical address of the range.
    pub fn end(&self) -> u64 {
        self.gpa.saturating_add(self.size)
    }
}

/// Errors raised while allocating or accessing guest memory.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// A RAM range could not be mapped. Earlier ranges have been released.
    #[error("Out of memory mapping range {index} ({size:#x} bytes, data limit {}): {source}",
        limit.map_or_else(|| "unlimited".to_string(), |l| format!("{l:#x}")))]
    OutOfMemory {
        index: usize,
        size: u64,
        /// Soft `RLIMIT_DATA` of the process, if bounded.
        limit: Option<u64>,
        #[source]
        source: io::Error,
    },

    /// Building the vm-memory accessor view failed.
    #[error("Failed to build guest memory view: {0}")]
    View(String),

    /// Guest physical access outside any RAM range.
    #[error("Guest memory access at {addr:#x} ({len} bytes) failed: {reason}")]
    Access {
        addr: u64,
        len: usize,
        reason: String,
    },

    /// Reserving the new host address range for a remap failed.
    #[error("Failed to reserve {size:#x} bytes for remap: {source}")]
    Reserve {
        size: u64,
        #[source]
        source: io::Error,
    },

    /// The hypervisor refused to move the backing to the new addresses.
    #[error("Failed to share guest memory: {0}")]
    Share(#[source] HypervisorError),
}

/// Soft data-segment limit of this process, `None` when unlimited.
fn data_limit() -> Option<u64> {
    use nix::sys::resource::{getrlimit, Resource};

    match getrlimit(Resource::RLIMIT_DATA) {
        Ok((soft, _)) if soft != libc::RLIM_INFINITY => Some(soft),
        _ => None,
    }
}

/// Map every RAM range of `ranges` with `mapper`, filling in host addresses.
///
/// Returns one slot per range, `None` for MMIO ranges. On failure every
/// mapping made by this call is dropped and all host addresses are reset to
/// zero.
pub fn allocate_ranges<M: RegionMapper>(
    mapper: &M,
    ranges: &mut [MemoryRange],
) -> Result<Vec<Option<M::Region>>, MemoryError> {
    let mut regions: Vec<Option<M::Region>> = Vec::with_capacity(ranges.len());

    for index in 0..ranges.len() {
        let range = ranges[index];
        if !range.is_ram() {
            ranges[index].host_addr = 0;
            regions.push(None);
            continue;
        }

        match mapper.map(range.size as usize) {
            Ok(region) => {
                ranges[index].host_addr = region.host_addr();
                regions.push(Some(region));
            }
            Err(source) => {
                let released = regions.iter().flatten().count();
                drop(regions);
                for r in ranges.iter_mut() {
                    r.host_addr = 0;
                }
                let limit = data_limit();
                error!(
                    "could not allocate guest memory range {} ({:#x} bytes), released {} mapping(s)",
                    index, range.size, released
                );
                return Err(MemoryError::OutOfMemory {
                    index,
                    size: range.size,
                    limit,
                    source,
                });
            }
        }
    }

    Ok(regions)
}

/// The guest's physical memory.
pub struct GuestMemory {
    /// Accessor view over `mappings`. Declared first so it is dropped before
    /// the mappings it points into.
    view: GuestMemoryMmap,
    ranges: Vec<MemoryRange>,
    mappings: Vec<Option<HostMapping>>,
}

impl GuestMemory {
    /// Allocate backing for every RAM range in `ranges`.
    pub fn allocate(ranges: &[MemoryRange]) -> Result<Self, MemoryError> {
        let mut ranges = ranges.to_vec();
        let mappings = allocate_ranges(&AnonymousMapper, &mut ranges)?;
        let view = build_view(&ranges)?;

        info!(
            "allocated {} MiB of guest RAM in {} range(s)",
            ranges.iter().filter(|r| r.is_ram()).map(|r| r.size).sum::<u64>() >> 20,
            mappings.iter().flatten().count()
        );

        Ok(Self {
            view,
            ranges,
            mappings,
        })
    }

    /// The range list with current host addresses.
    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges
    }

    /// Total bytes of RAM.
    pub fn ram_size(&self) -> u64 {
        self.ranges.iter().filter(|r| r.is_ram()).map(|r| r.size).sum()
    }

    /// Write bytes at a guest physical address.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.view
            .write_slice(data, GuestAddress(addr))
            .map_err(|e| MemoryError::Access {
                addr,
                len: data.len(),
                reason: e.to_string(),
            })
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Read bytes from a guest physical address.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.view
            .read_slice(data, GuestAddress(addr))
            .map_err(|e| MemoryError::Access {
                addr,
                len: data.len(),
                reason: e.to_string(),
            })
    }

    /// Move every RAM range to a fresh host virtual address.
    ///
    /// A placeholder is reserved for each RAM range to pick a free address,
    /// the placeholders are unmapped, and the hypervisor is asked to
    /// re-establish the backing at the new addresses. MMIO ranges keep a host
    /// address of zero. On failure the memory is left where it was.
    pub fn remap(&mut self, hypervisor: &dyn Hypervisor, vm: VmId) -> Result<(), MemoryError> {
        let mut placeholders = Vec::new();
        let mut new_ranges = self.ranges.clone();

        for range in new_ranges.iter_mut() {
            if !range.is_ram() {
                range.host_addr = 0;
                continue;
            }
            let placeholder =
                HostMapping::reserve(range.size as usize).map_err(|source| MemoryError::Reserve {
                    size: range.size,
                    source,
                })?;
            range.host_addr = placeholder.host_addr();
            placeholders.push(placeholder);
        }

        // Unmap the placeholders so the kernel can place the backing there.
        drop(placeholders);

        hypervisor
            .share_memory(vm, &new_ranges)
            .map_err(MemoryError::Share)?;

        let view = build_view(&new_ranges)?;
        let old_view = std::mem::replace(&mut self.view, view);
        drop(old_view);

        for (slot, range) in self.mappings.iter_mut().zip(&new_ranges) {
            if let Some(old) = slot.take() {
                // The backing moved; the old address range no longer exists.
                old.release();
                // SAFETY: share_memory placed the backing at this address and
                // nothing else owns it.
                *slot = unsafe { HostMapping::adopt(range.host_addr, range.size as usize) };
            }
        }
        self.ranges = new_ranges;

        debug!("remapped {} RAM range(s)", self.mappings.iter().flatten().count());
        Ok(())
    }
}

/// Build a non-owning vm-memory view over already-mapped RAM ranges.
fn build_view(ranges: &[MemoryRange]) -> Result<GuestMemoryMmap, MemoryError> {
    let mut regions = Vec::new();
    for range in ranges.iter().filter(|r| r.is_ram()) {
        // SAFETY: host_addr..host_addr + size is a live mapping owned by the
        // GuestMemory that also owns this view, and the view is dropped first.
        let mapping: MmapRegion = unsafe {
            MmapRegion::build_raw(
                range.host_addr as *mut u8,
                range.size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            )
        }
        .map_err(|e| MemoryError::View(e.to_string()))?;
        let region = GuestRegionMmap::new(mapping, GuestAddress(range.gpa))
            .map_err(|e| MemoryError::View(e.to_string()))?;
        regions.push(region);
    }
    GuestMemoryMmap::from_regions(regions).map_err(|e| MemoryError::View(e.to_string()))
}
