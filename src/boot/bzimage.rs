//! bzImage parsing.
//!
//! Only the setup header matters for a direct 64-bit boot. `setup_sects`
//! (0x1f1) gives the size of the real-mode part; whatever follows it is
//! the protected-mode kernel and goes to 1MB unchanged. The header must
//! carry the `HdrS` magic at 0x202 and protocol 2.06 or later at 0x206.
//! The raw header is kept so the zero page can start from it.

use super::layout;
use super::BootError;
use crate::memory::GuestMemory;
use log::debug;

/// Linux boot protocol magic number "HdrS" (ASCII: 0x48, 0x64, 0x72, 0x53).
const BOOT_MAGIC: u32 = 0x5372_6448;

/// Minimum supported boot protocol version (2.06 for 64-bit boot).
const MIN_BOOT_VERSION: u16 = 0x0206;

/// Offset of the setup header within the bzImage.
const SETUP_HEADER_OFFSET: usize = 0x1f1;

/// Result of loading a bzImage kernel.
pub struct LoadedKernel {
    /// Raw setup header bytes to copy to boot_params.
    pub setup_header: Vec<u8>,
}

/// Load a Linux bzImage kernel into guest memory.
///
/// Validates the setup header, copies the protected-mode kernel to the 1MB
/// mark (0x100000) and returns the setup header for the zero page.
///
/// For 64-bit boot, the entry point is `kernel_load + 0x200`.
pub fn load_kernel(memory: &GuestMemory, image: &[u8]) -> Result<LoadedKernel, BootError> {
    if image.len() < 0x250 {
        return Err(BootError::InvalidKernel(
            "Image too small to contain setup header".into(),
        ));
    }

    // Verify magic number "HdrS" at offset 0x202
    let magic = u32::from_le_bytes([image[0x202], image[0x203], image[0x204], image[0x205]]);
    if magic != BOOT_MAGIC {
        return Err(BootError::InvalidKernel(format!(
            "Invalid boot magic: expected {:#x}, got {:#x}",
            BOOT_MAGIC, magic
        )));
    }

    let version = u16::from_le_bytes([image[0x206], image[0x207]]);
    if version < MIN_BOOT_VERSION {
        return Err(BootError::InvalidKernel(format!(
            "Unsupported boot protocol version: {:#x} (minimum {:#x} for 64-bit boot)",
            version, MIN_BOOT_VERSION
        )));
    }

    // setup_sects of 0 means 4 on old kernels
    let setup_sects = match image[0x1f1] {
        0 => 4,
        n => n,
    };
    debug!(
        "bzImage: {} bytes, protocol {:#x}, {} setup sectors, loadflags {:#x}",
        image.len(),
        version,
        setup_sects,
        image[0x211]
    );

    let setup_size = (setup_sects as usize + 1) * 512;
    if setup_size >= image.len() {
        return Err(BootError::InvalidKernel(
            "Setup size exceeds kernel image size".into(),
        ));
    }

    let kernel_code = &image[setup_size..];
    memory.write(layout::HIMEM_START, kernel_code)?;
    debug!(
        "loaded {} bytes of kernel code at {:#x}",
        kernel_code.len(),
        layout::HIMEM_START
    );

    // Setup header (0x1f1 to ~0x270) for boot_params
    let header_end = (SETUP_HEADER_OFFSET + 0x80).min(image.len());
    let setup_header = image[SETUP_HEADER_OFFSET..header_end].to_vec();

    Ok(LoadedKernel { setup_header })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::tests::fake_bzimage;
    use crate::memory::MemoryRange;

    fn memory() -> GuestMemory {
        GuestMemory::allocate(&[MemoryRange::ram(0, 0x20_0000)]).unwrap()
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut image = fake_bzimage(&[0; 16]);
        image[0x202] = 0;
        assert!(matches!(
            load_kernel(&memory(), &image),
            Err(BootError::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_rejects_old_protocol() {
        let mut image = fake_bzimage(&[0; 16]);
        image[0x206..0x208].copy_from_slice(&0x0205u16.to_le_bytes());
        assert!(matches!(
            load_kernel(&memory(), &image),
            Err(BootError::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_image() {
        assert!(matches!(
            load_kernel(&memory(), &[0u8; 0x100]),
            Err(BootError::InvalidKernel(_))
        ));

        // Header claims more setup sectors than the image has.
        let mut image = fake_bzimage(&[]);
        image[0x1f1] = 8;
        assert!(matches!(
            load_kernel(&memory(), &image),
            Err(BootError::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_setup_header_extracted() {
        let image = fake_bzimage(&[0x90; 8]);
        let kernel = load_kernel(&memory(), &image).unwrap();
        assert_eq!(kernel.setup_header.len(), 0x80);
        assert_eq!(kernel.setup_header[0], 1);
    }
}
