//! Device emulation for the VM process.
//!
//! [`Devices`] owns every emulated device and is what the vCPU threads call
//! into when the guest touches I/O space:
//!
//! - port I/O: 8250 UART (COM1), CMOS RTC, dual 8259 PIC
//! - MMIO: the vmm control device on the [`MmioBus`]
//!
//! It also implements the vCPU-facing traits: exit handling, the interrupt
//! source (the PIC, wired to vCPU 0) and the pause hook (freezing the RTC).

mod cmos;
mod mmio;
mod pic;
pub mod pipe;
mod serial;
mod vmmci;

pub use cmos::{Cmos, CMOS_PORT_DATA, CMOS_PORT_INDEX};
pub use mmio::{MmioBus, MmioDevice, MMIO_DEVICE_BASE, MMIO_DEVICE_SIZE};
pub use pic::Pic;
pub use serial::{Serial, SERIAL_COM1_BASE, SERIAL_COM1_END, SERIAL_COM1_IRQ};
pub use vmmci::{VmmCommand, VmmControl, VmmControlError, VMM_CONTROL_IRQ};

use crate::hypervisor::{IoData, VcpuRunParams, VmExit};
use crate::migration::DeviceState;
use crate::sync::{lock, SyncError};
use crate::vcpu::{ExitHandler, InterruptSource, VcpuError};
use crate::vm::runtime::{PauseHook, RuntimeError, VmRuntime};
use log::{error, info, trace, warn, LevelFilter};
use pipe::PipeSender;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Size of the opaque device state blob in a migration stream.
pub const DEVICE_STATE_LEN: usize = Serial::SNAPSHOT_LEN + Cmos::SNAPSHOT_LEN + Pic::SNAPSHOT_LEN;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Control(#[from] VmmControlError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Failed to raise interrupt: {0}")]
    Interrupt(#[from] RuntimeError),
}

/// Port-I/O devices, behind one lock.
struct Chipset {
    serial: Serial,
    cmos: Cmos,
    pic: Pic,
}

pub struct Devices {
    chipset: Mutex<Chipset>,
    bus: Mutex<MmioBus>,
    vmmci: VmmControl,
    /// Host MAC address of each NIC, once the parent has resolved it.
    macs: Mutex<Vec<Option<[u8; 6]>>>,
    verbosity: AtomicUsize,
}

impl Devices {
    pub fn new(console: Box<dyn Write + Send>, pipe: PipeSender, nics: usize) -> Self {
        let vmmci = VmmControl::new(pipe);
        let mut bus = MmioBus::new();
        bus.register(MMIO_DEVICE_BASE, MMIO_DEVICE_SIZE, Box::new(vmmci.clone()));

        Self {
            chipset: Mutex::new(Chipset {
                serial: Serial::new(console),
                cmos: Cmos::new(),
                pic: Pic::new(),
            }),
            bus: Mutex::new(bus),
            vmmci,
            macs: Mutex::new(vec![None; nics]),
            verbosity: AtomicUsize::new(log::max_level() as usize),
        }
    }

    fn chipset(&self) -> Result<std::sync::MutexGuard<'_, Chipset>, SyncError> {
        lock(&self.chipset, "chipset")
    }

    fn tracing(&self) -> bool {
        self.verbosity.load(Ordering::Relaxed) >= LevelFilter::Trace as usize
    }

    /// Apply a new log verbosity to device emulation.
    pub fn set_verbosity(&self, level: LevelFilter) {
        self.verbosity.store(level as usize, Ordering::Relaxed);
    }

    /// Record the host MAC address resolved for a NIC.
    pub fn set_host_mac(&self, nic: u32, mac: [u8; 6]) -> Result<(), SyncError> {
        let mut macs = lock(&self.macs, "nic table")?;
        match macs.get_mut(nic as usize) {
            Some(slot) => {
                info!(
                    "nic{}: host address {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                    nic, mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
                );
                *slot = Some(mac);
            }
            None => warn!("address response for unknown nic {}", nic),
        }
        Ok(())
    }

    pub fn host_mac(&self, nic: u32) -> Result<Option<[u8; 6]>, SyncError> {
        Ok(lock(&self.macs, "nic table")?
            .get(nic as usize)
            .copied()
            .flatten())
    }

    /// Raise an IRQ line and wake vCPU 0 if that makes an interrupt
    /// deliverable.
    pub fn assert_irq(&self, runtime: &VmRuntime, irq: u8) -> Result<(), DeviceError> {
        let vector = {
            let mut chipset = self.chipset()?;
            chipset.pic.assert_irq(irq);
            chipset.pic.peek_vector()
        };
        if let Some(vector) = vector {
            runtime.interrupt_vcpu(0, vector)?;
        }
        Ok(())
    }

    /// Ask the guest to shut down or reboot through the control device.
    ///
    /// Fails with [`VmmControlError::NotReady`] if the guest has no driver
    /// for it.
    pub fn request(&self, runtime: &VmRuntime, cmd: VmmCommand) -> Result<(), DeviceError> {
        self.vmmci.ctl(cmd)?;
        self.assert_irq(runtime, VMM_CONTROL_IRQ)
    }

    fn io_in(&self, runtime: &VmRuntime, port: u16, data: &mut IoData) -> Result<(), DeviceError> {
        let (value, irq) = {
            let mut c = self.chipset()?;
            let before = c.serial.interrupt();
            let value = if Serial::handles(port) {
                c.serial.read(port - SERIAL_COM1_BASE)
            } else if port == CMOS_PORT_INDEX || port == CMOS_PORT_DATA {
                c.cmos.read(port)
            } else if Pic::handles(port) {
                c.pic.read(port)
            } else {
                0xff
            };
            (value, !before && c.serial.interrupt())
        };
        data.fill(value);
        if self.tracing() {
            trace!("io in  {:#06x} -> {:#04x} ({} bytes)", port, value, data.len());
        }
        if irq {
            self.assert_irq(runtime, SERIAL_COM1_IRQ)?;
        }
        Ok(())
    }

    fn io_out(&self, runtime: &VmRuntime, port: u16, data: &IoData) -> Result<(), DeviceError> {
        if self.tracing() {
            trace!("io out {:#06x} <- {:?}", port, data.as_slice());
        }
        let irq = {
            let mut c = self.chipset()?;
            let before = c.serial.interrupt();
            for &byte in data.as_slice() {
                if Serial::handles(port) {
                    c.serial.write(port - SERIAL_COM1_BASE, byte);
                } else if port == CMOS_PORT_INDEX || port == CMOS_PORT_DATA {
                    c.cmos.write(port, byte);
                } else if Pic::handles(port) {
                    c.pic.write(port, byte);
                }
            }
            !before && c.serial.interrupt()
        };
        if irq {
            self.assert_irq(runtime, SERIAL_COM1_IRQ)?;
        }
        Ok(())
    }

    /// Serialize the port-I/O devices.
    pub fn save_devices(&self, w: &mut dyn Write) -> io::Result<()> {
        let c = self.chipset().map_err(io::Error::other)?;
        c.serial.save(w)?;
        c.cmos.save(w)?;
        c.pic.save(w)
    }

    pub fn restore_devices(&self, r: &mut dyn Read) -> io::Result<()> {
        let mut c = self.chipset().map_err(io::Error::other)?;
        c.serial.restore(r)?;
        c.cmos.restore(r)?;
        c.pic.restore(r)
    }

    /// Serialize every MMIO bus device in registration order.
    pub fn save_bus(&self, w: &mut dyn Write) -> io::Result<()> {
        lock(&self.bus, "mmio bus")
            .map_err(io::Error::other)?
            .save(w)
    }

    pub fn restore_bus(&self, r: &mut dyn Read) -> io::Result<()> {
        lock(&self.bus, "mmio bus")
            .map_err(io::Error::other)?
            .restore(r)
    }
}

impl DeviceState for Devices {
    fn save_devices(&self, w: &mut dyn Write) -> io::Result<()> {
        Devices::save_devices(self, w)
    }

    fn restore_devices(&self, r: &mut dyn Read) -> io::Result<()> {
        Devices::restore_devices(self, r)
    }

    fn save_bus(&self, w: &mut dyn Write) -> io::Result<()> {
        Devices::save_bus(self, w)
    }

    fn restore_bus(&self, r: &mut dyn Read) -> io::Result<()> {
        Devices::restore_bus(self, r)
    }
}

impl From<DeviceError> for VcpuError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Sync(e) => VcpuError::Sync(e),
            DeviceError::Interrupt(e) => e.into(),
            e => VcpuError::Device(e.to_string()),
        }
    }
}

impl ExitHandler for Devices {
    fn handle_exit(
        &self,
        runtime: &VmRuntime,
        params: &mut VcpuRunParams,
    ) -> Result<(), VcpuError> {
        let vcpu = params.vcpu_id;
        match &mut params.exit {
            VmExit::IoIn { port, data } => self.io_in(runtime, *port, data)?,
            VmExit::IoOut { port, data } => self.io_out(runtime, *port, data)?,
            VmExit::MmioRead { addr, data } => {
                let mapped = lock(&self.bus, "mmio bus")?.read(*addr, data.as_mut_slice());
                if !mapped && self.tracing() {
                    trace!("mmio read of unmapped {:#x}", addr);
                }
            }
            VmExit::MmioWrite { addr, data } => {
                let mapped = lock(&self.bus, "mmio bus")?.write(*addr, data.as_slice());
                if !mapped && self.tracing() {
                    trace!("mmio write to unmapped {:#x}", addr);
                }
            }
            VmExit::Hlt => {
                if !self.pending(vcpu) {
                    runtime.halt_vcpu(vcpu)?;
                }
            }
            VmExit::Shutdown => return Err(VcpuError::TripleFault),
            VmExit::FailEntry(reason) => return Err(VcpuError::FailEntry(*reason)),
            VmExit::InternalError => return Err(VcpuError::InternalError),
            VmExit::SystemEvent(event) => {
                info!("vcpu{}: system event {}, stopping VM", vcpu, event);
                runtime.terminate()?;
            }
            VmExit::Unknown(reason) => return Err(VcpuError::UnhandledExit(reason.to_string())),
            VmExit::None | VmExit::Terminated => {}
        }
        Ok(())
    }
}

impl InterruptSource for Devices {
    fn pending(&self, vcpu: u32) -> bool {
        if vcpu != 0 {
            return false;
        }
        match self.chipset() {
            Ok(c) => c.pic.pending(),
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    fn acknowledge(&self, vcpu: u32) -> Option<u8> {
        if vcpu != 0 {
            return None;
        }
        match self.chipset() {
            Ok(mut c) => c.pic.acknowledge(),
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }
}

impl PauseHook for Devices {
    fn pause(&self) {
        match self.chipset() {
            Ok(mut c) => c.cmos.freeze(),
            Err(e) => error!("pause: {}", e),
        }
    }

    fn unpause(&self) {
        match self.chipset() {
            Ok(mut c) => c.cmos.thaw(),
            Err(e) => error!("unpause: {}", e),
        }
    }
}
