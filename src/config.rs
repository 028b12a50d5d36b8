//! VM creation parameters.

use crate::memory::{MemoryRange, PAGE_SIZE};
use std::path::PathBuf;
use thiserror::Error;

/// Maximum vCPUs per VM.
pub const MAX_VCPUS: usize = 64;

/// Maximum guest memory ranges (RAM and MMIO).
pub const MAX_MEM_RANGES: usize = 16;

pub const MAX_DISKS: usize = 4;

pub const MAX_NICS: usize = 4;

/// Top of conventional memory (640 KiB).
const LOW_RAM_END: u64 = 0xa_0000;

/// Start of extended memory (1 MiB).
const HIGH_RAM_START: u64 = 0x10_0000;

/// 32-bit MMIO hole below 4 GiB.
const MMIO_HOLE_START: u64 = 0xc000_0000;
const MMIO_HOLE_END: u64 = 0x1_0000_0000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid vCPU count {0} (1-{MAX_VCPUS})")]
    Cpus(u32),

    #[error("Invalid memory range count {0} (1-{MAX_MEM_RANGES})")]
    Ranges(usize),

    #[error("Too many disks: {0} (max {MAX_DISKS})")]
    Disks(usize),

    #[error("Too many NICs: {0} (max {MAX_NICS})")]
    Nics(usize),

    #[error("No RAM configured")]
    NoRam,

    #[error("Memory range {index} ({gpa:#x}+{size:#x}) is not page aligned")]
    Unaligned { index: usize, gpa: u64, size: u64 },

    #[error("Memory range {0} overlaps or precedes the range before it")]
    Overlap(usize),

    #[error("Guest memory too small: {0} MiB")]
    MemoryTooSmall(u64),

    #[error("Guest memory too large: {0} MiB")]
    MemoryTooLarge(u64),

    #[error("Neither a kernel nor a migration stream to start from")]
    NoKernel,

    #[error("Encrypted guest requested but no PSP device is available")]
    NoPsp,
}

/// Everything needed to create and start one VM.
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    pub name: String,
    pub ncpus: u32,
    /// Guest physical layout, in ascending address order.
    pub memory: Vec<MemoryRange>,
    /// Linux bzImage to boot. Unused for a received VM.
    pub kernel: Option<PathBuf>,
    pub cmdline: String,
    pub disks: Vec<PathBuf>,
    pub nics: usize,
    /// Run the guest with encrypted memory.
    pub sev: bool,
}

impl VmConfig {
    /// Check the configuration against the hypervisor limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ncpus == 0 || self.ncpus as usize > MAX_VCPUS {
            return Err(ConfigError::Cpus(self.ncpus));
        }
        if self.memory.is_empty() || self.memory.len() > MAX_MEM_RANGES {
            return Err(ConfigError::Ranges(self.memory.len()));
        }
        if self.disks.len() > MAX_DISKS {
            return Err(ConfigError::Disks(self.disks.len()));
        }
        if self.nics > MAX_NICS {
            return Err(ConfigError::Nics(self.nics));
        }
        if !self.memory.iter().any(|r| r.is_ram()) {
            return Err(ConfigError::NoRam);
        }

        let mut prev_end = 0;
        for (index, r) in self.memory.iter().enumerate() {
            if r.size == 0 || r.gpa % PAGE_SIZE != 0 || r.size % PAGE_SIZE != 0 {
                return Err(ConfigError::Unaligned {
                    index,
                    gpa: r.gpa,
                    size: r.size,
                });
            }
            if index > 0 && r.gpa < prev_end {
                return Err(ConfigError::Overlap(index));
            }
            prev_end = r.end();
        }
        Ok(())
    }
}

/// [`memory_map`] for a size given in MiB.
pub fn memory_map_mib(mib: u64) -> Result<Vec<MemoryRange>, ConfigError> {
    let bytes = mib
        .checked_mul(1 << 20)
        .ok_or(ConfigError::MemoryTooLarge(mib))?;
    memory_map(bytes)
}

/// Build the default PC memory layout for `bytes` of RAM.
///
/// ```text
/// 0x0000_0000 - 0x0009_ffff   RAM (conventional)
/// 0x000a_0000 - 0x000f_ffff   MMIO (legacy ISA hole)
/// 0x0010_0000 - ...           RAM, up to the 32-bit MMIO hole
/// 0xc000_0000 - 0xffff_ffff   MMIO (device window)
/// 0x1_0000_0000 - ...         RAM (remainder)
/// ```
pub fn memory_map(bytes: u64) -> Result<Vec<MemoryRange>, ConfigError> {
    let bytes = bytes & !(PAGE_SIZE - 1);
    if bytes <= HIGH_RAM_START {
        return Err(ConfigError::MemoryTooSmall(bytes >> 20));
    }

    let mut ranges = vec![
        MemoryRange::ram(0, LOW_RAM_END),
        MemoryRange::mmio(LOW_RAM_END, HIGH_RAM_START - LOW_RAM_END),
    ];

    let left = bytes - LOW_RAM_END;
    let below_hole = left.min(MMIO_HOLE_START - HIGH_RAM_START);
    ranges.push(MemoryRange::ram(HIGH_RAM_START, below_hole));
    ranges.push(MemoryRange::mmio(
        MMIO_HOLE_START,
        MMIO_HOLE_END - MMIO_HOLE_START,
    ));

    let above = left - below_hole;
    if above > 0 {
        ranges.push(MemoryRange::ram(MMIO_HOLE_END, above));
    }
    Ok(ranges)
}
