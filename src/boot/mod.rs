//! Boot image loading for x86_64 Linux guests.
//!
//! A freshly created (not received) VM needs something in guest memory to run
//! and an initial register state for its vCPUs. That is the job of a
//! [`BootLoader`]. The only loader implemented is [`LinuxLoader`], which
//! follows the Linux 64-bit boot protocol so the kernel can be started
//! directly without firmware:
//! <https://www.kernel.org/doc/html/latest/x86/boot.html>
//!
//! 1. **Kernel loading**: the protected-mode part of the bzImage is copied to
//!    the 1MB mark (0x100000).
//! 2. **Boot parameters**: the zero page gets the setup header, the command
//!    line pointer and an E820 map derived from the VM's memory ranges.
//! 3. **CPU state**: identity page tables, a GDT with the boot code/data
//!    segments, long mode enabled; execution begins at
//!    `kernel_load_address + 0x200` with RSI pointing at the zero page.
//!
//! # Memory Layout
//!
//! ```text
//! 0x0000_0500 - 0x0000_0520  GDT
//! 0x0000_0520 - 0x0000_0540  IDT (empty, the kernel sets its own)
//! 0x0000_7000 - 0x0000_8000  boot_params (zero page)
//! 0x0000_8000 - 0x0000_9000  Stack (grows downward from 0x8ff0)
//! 0x0000_9000 - 0x0000_c000  PML4, PDPTE, PDE
//! 0x0002_0000 - 0x0002_0800  Kernel command line
//! 0x0010_0000 - kernel_end   Kernel code
//! ```
//!
//! Boot protocol 2.06 or newer is required. The initial page tables
//! identity-map the first 1GB; the kernel builds its own later.

mod bzimage;
mod paging;
mod params;

use crate::hypervisor::VcpuRegisterState;
use crate::memory::{GuestMemory, MemoryError};
use log::info;
use std::path::PathBuf;
use thiserror::Error;

/// Guest physical addresses used during boot.
pub mod layout {
    /// GDT location.
    pub const GDT_START: u64 = 0x500;

    /// IDT location. Only a placeholder.
    pub const IDT_START: u64 = 0x520;

    /// boot_params structure location (the "zero page").
    pub const BOOT_PARAMS_START: u64 = 0x7000;

    /// Initial stack pointer of the boot CPU.
    pub const BOOT_STACK_POINTER: u64 = 0x8ff0;

    /// Kernel command line location; must be below 4GB.
    pub const CMDLINE_START: u64 = 0x2_0000;

    /// Maximum kernel command line size in bytes, including the terminator.
    pub const CMDLINE_MAX_SIZE: usize = 2048;

    /// Protected-mode kernel load address (1MB mark).
    pub const HIMEM_START: u64 = 0x10_0000;
}

/// Errors that can occur during boot setup.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("Failed to write boot data to guest memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("Failed to read kernel: {0}")]
    ReadKernel(#[source] std::io::Error),

    #[error("Invalid kernel image: {0}")]
    InvalidKernel(String),

    #[error("Command line too long: {len} bytes (max {max})")]
    CmdlineTooLong { len: usize, max: usize },

    #[error("Too many memory ranges for the E820 map: {0}")]
    TooManyRanges(usize),
}

/// Places a bootable image in guest memory.
pub trait BootLoader {
    /// Load the image and return the initial register state shared by every
    /// vCPU.
    fn load(&self, memory: &GuestMemory) -> Result<VcpuRegisterState, BootError>;
}

/// Direct Linux bzImage boot.
#[derive(Debug, Clone)]
pub struct LinuxLoader {
    pub kernel: PathBuf,
    pub cmdline: String,
}

impl LinuxLoader {
    pub fn new(kernel: impl Into<PathBuf>, cmdline: impl Into<String>) -> Self {
        Self {
            kernel: kernel.into(),
            cmdline: cmdline.into(),
        }
    }
}

impl BootLoader for LinuxLoader {
    fn load(&self, memory: &GuestMemory) -> Result<VcpuRegisterState, BootError> {
        let image = std::fs::read(&self.kernel).map_err(BootError::ReadKernel)?;
        let kernel = bzimage::load_kernel(memory, &image)?;
        params::setup_boot_params(memory, &self.cmdline, &kernel)?;
        paging::setup_page_tables(memory)?;
        paging::setup_gdt_idt(memory)?;

        let regs = paging::boot_registers();
        info!(
            "loaded {} at {:#x}, entry {:#x}",
            self.kernel.display(),
            layout::HIMEM_START,
            regs.gprs.rip
        );
        Ok(regs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::MemoryRange;

    /// A minimal image that passes header validation: one setup sector and
    /// `code` as the protected-mode kernel.
    pub(crate) fn fake_bzimage(code: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 2 * 512];
        image[0x1f1] = 1;
        image[0x202..0x206].copy_from_slice(&0x5372_6448u32.to_le_bytes());
        image[0x206..0x208].copy_from_slice(&0x020fu16.to_le_bytes());
        image.extend_from_slice(code);
        image
    }

    #[test]
    fn test_linux_loader() {
        let path = std::env::temp_dir().join(format!("carbon-vm-bzimage-{}", std::process::id()));
        std::fs::write(&path, fake_bzimage(&[0xf4; 16])).unwrap();

        let memory = GuestMemory::allocate(&[
            MemoryRange::ram(0, 0xa_0000),
            MemoryRange::mmio(0xa_0000, 0x6_0000),
            MemoryRange::ram(0x10_0000, 0x40_0000),
        ])
        .unwrap();
        let loader = LinuxLoader::new(&path, "console=ttyS0");
        let regs = loader.load(&memory).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(regs.gprs.rip, layout::HIMEM_START + 0x200);
        assert_eq!(regs.gprs.rsi, layout::BOOT_PARAMS_START);

        let mut code = [0u8; 16];
        memory.read(layout::HIMEM_START, &mut code).unwrap();
        assert_eq!(code, [0xf4; 16]);

        let mut cmdline = [0u8; 14];
        memory.read(layout::CMDLINE_START, &mut cmdline).unwrap();
        assert_eq!(&cmdline, b"console=ttyS0\0");
    }

    #[test]
    fn test_missing_kernel() {
        let memory = GuestMemory::allocate(&[MemoryRange::ram(0, 0x20_0000)]).unwrap();
        let loader = LinuxLoader::new("/nonexistent/bzImage", "");
        assert!(matches!(loader.load(&memory), Err(BootError::ReadKernel(_))));
    }
}
