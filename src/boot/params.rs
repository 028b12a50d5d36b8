//! Zero page (`struct boot_params`) construction.
//!
//! The page starts out as the bzImage setup header copied to 0x1f1. On top
//! of that go the loader type, `CAN_USE_HEAP | LOADED_HIGH`, the command line
//! pointer and an E820 table built from the VM's memory ranges: RAM ranges
//! are usable, MMIO ranges reserved.
//!
//! Field offsets: <https://www.kernel.org/doc/html/latest/x86/zero-page.html>

use super::bzimage::LoadedKernel;
use super::layout;
use super::BootError;
use crate::memory::{GuestMemory, MemoryRange};
use log::debug;

/// Size of the boot_params structure (one 4KB page).
const BOOT_PARAMS_SIZE: usize = 4096;

/// Capacity of the E820 table in boot_params.
const E820_MAX_ENTRIES: usize = 128;

/// E820 memory region types.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E820Type {
    /// Usable RAM.
    Ram = 1,

    /// Reserved - used by firmware or hardware, do not touch.
    Reserved = 2,
}

/// Byte offsets within the boot_params structure.
///
/// See: <https://www.kernel.org/doc/html/latest/x86/zero-page.html>
mod offsets {
    /// Number of E820 memory map entries (1 byte).
    pub const E820_ENTRIES: usize = 0x1e8;

    /// Start of setup header within boot_params.
    pub const SETUP_HEADER: usize = 0x1f1;

    /// type_of_loader field (1 byte).
    pub const TYPE_OF_LOADER: usize = 0x210;

    /// loadflags field (1 byte).
    pub const LOADFLAGS: usize = 0x211;

    /// cmd_line_ptr field (4 bytes).
    pub const CMD_LINE_PTR: usize = 0x228;

    /// Start of E820 memory map array (128 entries × 20 bytes each).
    pub const E820_MAP: usize = 0x2d0;
}

/// Set up the boot_params structure at BOOT_PARAMS_START.
///
/// 1. **Setup header**: copied from the bzImage
/// 2. **Command line**: pointer to our command line string
/// 3. **Memory map**: E820 entries built from the guest memory ranges
pub fn setup_boot_params(
    memory: &GuestMemory,
    cmdline: &str,
    loaded_kernel: &LoadedKernel,
) -> Result<(), BootError> {
    let mut params = [0u8; BOOT_PARAMS_SIZE];

    // The setup header sits at 0x1f1 in both the bzImage and boot_params.
    let header_len = loaded_kernel
        .setup_header
        .len()
        .min(BOOT_PARAMS_SIZE - offsets::SETUP_HEADER);
    params[offsets::SETUP_HEADER..offsets::SETUP_HEADER + header_len]
        .copy_from_slice(&loaded_kernel.setup_header[..header_len]);

    // type_of_loader = 0xFF means undefined loader
    params[offsets::TYPE_OF_LOADER] = 0xff;

    // Bit 0 (LOADED_HIGH): Kernel is at 0x100000
    // Bit 7 (CAN_USE_HEAP): heap_end_ptr field is valid
    params[offsets::LOADFLAGS] |= 0x01 | 0x80;

    let cmd_line_ptr = (layout::CMDLINE_START as u32).to_le_bytes();
    params[offsets::CMD_LINE_PTR..offsets::CMD_LINE_PTR + 4].copy_from_slice(&cmd_line_ptr);

    let e820 = e820_entries(memory.ranges())?;
    params[offsets::E820_ENTRIES] = e820.len() as u8;
    for (i, (base, size, type_)) in e820.iter().enumerate() {
        let at = offsets::E820_MAP + i * 20;
        params[at..at + 8].copy_from_slice(&base.to_le_bytes());
        params[at + 8..at + 16].copy_from_slice(&size.to_le_bytes());
        params[at + 16..at + 20].copy_from_slice(&(*type_ as u32).to_le_bytes());
    }

    memory.write(layout::BOOT_PARAMS_START, &params)?;
    setup_cmdline(memory, cmdline)?;

    debug!(
        "boot_params at {:#x}, cmdline at {:#x}, {} e820 entries",
        layout::BOOT_PARAMS_START,
        layout::CMDLINE_START,
        e820.len()
    );
    Ok(())
}

/// Write the NUL-terminated kernel command line to guest memory.
fn setup_cmdline(memory: &GuestMemory, cmdline: &str) -> Result<(), BootError> {
    if cmdline.len() >= layout::CMDLINE_MAX_SIZE {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: layout::CMDLINE_MAX_SIZE - 1,
        });
    }

    memory.write(layout::CMDLINE_START, cmdline.as_bytes())?;
    memory.write_u8(layout::CMDLINE_START + cmdline.len() as u64, 0)?;
    debug!("command line: {}", cmdline);
    Ok(())
}

/// One E820 entry per memory range.
fn e820_entries(ranges: &[MemoryRange]) -> Result<Vec<(u64, u64, E820Type)>, BootError> {
    if ranges.len() > E820_MAX_ENTRIES {
        return Err(BootError::TooManyRanges(ranges.len()));
    }
    Ok(ranges
        .iter()
        .map(|r| {
            let type_ = if r.is_ram() {
                E820Type::Ram
            } else {
                E820Type::Reserved
            };
            (r.gpa, r.size, type_)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> GuestMemory {
        GuestMemory::allocate(&[
            MemoryRange::ram(0, 0xa_0000),
            MemoryRange::mmio(0xa_0000, 0x6_0000),
            MemoryRange::ram(0x10_0000, 0x10_0000),
        ])
        .unwrap()
    }

    fn loaded() -> LoadedKernel {
        LoadedKernel {
            setup_header: vec![0; 0x80],
        }
    }

    #[test]
    fn test_e820_follows_ranges() {
        let mem = memory();
        setup_boot_params(&mem, "quiet", &loaded()).unwrap();

        let mut count = [0u8; 1];
        mem.read(layout::BOOT_PARAMS_START + offsets::E820_ENTRIES as u64, &mut count)
            .unwrap();
        assert_eq!(count[0], 3);

        let mut entry = [0u8; 20];
        mem.read(
            layout::BOOT_PARAMS_START + offsets::E820_MAP as u64 + 20,
            &mut entry,
        )
        .unwrap();
        assert_eq!(u64::from_le_bytes(entry[0..8].try_into().unwrap()), 0xa_0000);
        assert_eq!(u64::from_le_bytes(entry[8..16].try_into().unwrap()), 0x6_0000);
        assert_eq!(u32::from_le_bytes(entry[16..20].try_into().unwrap()), 2);
    }

    #[test]
    fn test_loader_fields() {
        let mem = memory();
        setup_boot_params(&mem, "", &loaded()).unwrap();

        let mut buf = [0u8; 4];
        mem.read(layout::BOOT_PARAMS_START + offsets::CMD_LINE_PTR as u64, &mut buf)
            .unwrap();
        assert_eq!(u32::from_le_bytes(buf), layout::CMDLINE_START as u32);

        mem.read(layout::BOOT_PARAMS_START + offsets::TYPE_OF_LOADER as u64, &mut buf[..2])
            .unwrap();
        assert_eq!(buf[..2], [0xff, 0x81]);
    }

    #[test]
    fn test_cmdline_too_long() {
        let long = "x".repeat(layout::CMDLINE_MAX_SIZE);
        assert!(matches!(
            setup_boot_params(&memory(), &long, &loaded()),
            Err(BootError::CmdlineTooLong { .. })
        ));
    }
}
