//! MMIO (Memory-Mapped I/O) bus.
//!
//! Routes guest accesses to unbacked physical addresses to the device that
//! owns the address range.
//!
//! # Memory Layout
//!
//! ```text
//! 0xd000_0000 - 0xd000_0FFF  vmm control device (4KB)
//! ```
//!
//! The bus state saved into a migration stream is the state of every device
//! in registration order; a receiving process must register the same devices
//! in the same order before restoring it.

use std::io::{self, Read, Write};

/// Base address of the MMIO device window.
pub const MMIO_DEVICE_BASE: u64 = 0xd000_0000;

/// Size of each device's MMIO region (4KB).
pub const MMIO_DEVICE_SIZE: u64 = 0x1000;

/// Trait for devices that respond to MMIO access.
///
/// The offset is relative to the device's base address.
pub trait MmioDevice: Send {
    /// Handle an MMIO read at the given offset.
    fn read(&mut self, offset: u64, data: &mut [u8]);

    /// Handle an MMIO write at the given offset.
    fn write(&mut self, offset: u64, data: &[u8]);

    /// Serialize the device state.
    fn save(&self, w: &mut dyn Write) -> io::Result<()>;

    /// Load state written by [`MmioDevice::save`].
    fn restore(&mut self, r: &mut dyn Read) -> io::Result<()>;
}

/// A registered device on the MMIO bus.
struct MmioDeviceEntry {
    base: u64,
    size: u64,
    device: Box<dyn MmioDevice>,
}

/// MMIO bus that routes accesses to registered devices.
#[derive(Default)]
pub struct MmioBus {
    /// Registered devices in registration order.
    devices: Vec<MmioDeviceEntry>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device on the bus.
    pub fn register(&mut self, base: u64, size: u64, device: Box<dyn MmioDevice>) {
        self.devices.push(MmioDeviceEntry { base, size, device });
    }

    fn find_device(&mut self, addr: u64) -> Option<(&mut (dyn MmioDevice + 'static), u64)> {
        self.devices
            .iter_mut()
            .find(|e| addr >= e.base && addr - e.base < e.size)
            .map(|e| (e.device.as_mut(), addr - e.base))
    }

    /// Handle an MMIO read from the guest.
    ///
    /// Returns `false` if no device owns the address; the data is then all
    /// ones.
    pub fn read(&mut self, addr: u64, data: &mut [u8]) -> bool {
        if let Some((device, offset)) = self.find_device(addr) {
            device.read(offset, data);
            true
        } else {
            data.fill(0xff);
            false
        }
    }

    /// Handle an MMIO write from the guest.
    ///
    /// Returns `false` if no device owns the address; the write is dropped.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> bool {
        if let Some((device, offset)) = self.find_device(addr) {
            device.write(offset, data);
            true
        } else {
            false
        }
    }

    pub fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        self.devices.iter().try_for_each(|e| e.device.save(w))
    }

    pub fn restore(&mut self, r: &mut dyn Read) -> io::Result<()> {
        self.devices
            .iter_mut()
            .try_for_each(|e| e.device.restore(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

    struct MockDevice {
        value: u32,
    }

    impl MmioDevice for MockDevice {
        fn read(&mut self, offset: u64, data: &mut [u8]) {
            if offset == 0 && data.len() >= 4 {
                data[..4].copy_from_slice(&self.value.to_le_bytes());
            }
        }

        fn write(&mut self, offset: u64, data: &[u8]) {
            if offset == 0 && data.len() >= 4 {
                self.value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            }
        }

        fn save(&self, w: &mut dyn Write) -> io::Result<()> {
            w.write_u32::<LittleEndian>(self.value)
        }

        fn restore(&mut self, r: &mut dyn Read) -> io::Result<()> {
            self.value = r.read_u32::<LittleEndian>()?;
            Ok(())
        }
    }

    #[test]
    fn test_mmio_bus() {
        let mut bus = MmioBus::new();
        bus.register(0x1000, 0x100, Box::new(MockDevice { value: 0x12345678 }));

        let mut data = [0u8; 4];
        assert!(bus.read(0x1000, &mut data));
        assert_eq!(u32::from_le_bytes(data), 0x12345678);

        assert!(bus.write(0x1000, &0xDEADBEEFu32.to_le_bytes()));
        bus.read(0x1000, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0xDEADBEEF);

        // Read from unmapped region returns 0xff
        assert!(!bus.read(0x2000, &mut data));
        assert_eq!(data, [0xff; 4]);
    }

    #[test]
    fn test_bus_state_in_registration_order() {
        let mut bus = MmioBus::new();
        bus.register(0x2000, 0x100, Box::new(MockDevice { value: 2 }));
        bus.register(0x1000, 0x100, Box::new(MockDevice { value: 1 }));

        let mut buf = Vec::new();
        bus.save(&mut buf).unwrap();
        assert_eq!(buf, [2, 0, 0, 0, 1, 0, 0, 0]);

        let mut other = MmioBus::new();
        other.register(0x2000, 0x100, Box::new(MockDevice { value: 0 }));
        other.register(0x1000, 0x100, Box::new(MockDevice { value: 0 }));
        other.restore(&mut buf.as_slice()).unwrap();

        let mut data = [0u8; 4];
        other.read(0x1000, &mut data);
        assert_eq!(u32::from_le_bytes(data), 1);
    }
}
