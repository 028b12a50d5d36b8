//! VMM control device.
//!
//! A small MMIO device through which the host asks the guest to shut down or
//! reboot cleanly. A guest driver announces itself by writing CONFIG; until
//! then the host cannot deliver requests and has to stop the VM itself.
//!
//! ```text
//! offset  access  register
//! 0x00    R       STATUS   bit 0: driver ready
//! 0x04    R       COMMAND  pending command (0 = none)
//! 0x08    W       ACK      guest acknowledges COMMAND
//! 0x0c    RW      CONFIG   1 = driver ready
//! ```
//!
//! When the guest acknowledges a command, the device tells the event thread
//! over the device pipe.

use super::mmio::MmioDevice;
use super::pipe::{PipeMessage, PipeSender};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// IRQ raised when a command is posted.
pub const VMM_CONTROL_IRQ: u8 = 5;

const REG_STATUS: u64 = 0x00;
const REG_COMMAND: u64 = 0x04;
const REG_ACK: u64 = 0x08;
const REG_CONFIG: u64 = 0x0c;

const STATUS_READY: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VmmCommand {
    Shutdown = 1,
    Reboot = 2,
}

impl VmmCommand {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Shutdown),
            2 => Some(Self::Reboot),
            _ => None,
        }
    }

    fn acknowledged(self) -> PipeMessage {
        match self {
            Self::Shutdown => PipeMessage::GuestShutdown,
            Self::Reboot => PipeMessage::GuestReboot,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VmmControlError {
    #[error("Guest control driver is not ready")]
    NotReady,

    #[error("Guest control state lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
struct Registers {
    ready: bool,
    pending: Option<VmmCommand>,
}

/// The device. Clones share state: one clone lives on the MMIO bus, another
/// is used by the host side to post commands.
#[derive(Clone)]
pub struct VmmControl {
    regs: Arc<Mutex<Registers>>,
    pipe: PipeSender,
}

impl VmmControl {
    pub const SNAPSHOT_LEN: usize = 8;

    pub fn new(pipe: PipeSender) -> Self {
        Self {
            regs: Arc::new(Mutex::new(Registers::default())),
            pipe,
        }
    }

    /// Post a command for the guest. The caller raises the IRQ.
    pub fn ctl(&self, cmd: VmmCommand) -> Result<(), VmmControlError> {
        let mut regs = self.regs.lock().map_err(|_| VmmControlError::Poisoned)?;
        if !regs.ready {
            return Err(VmmControlError::NotReady);
        }
        debug!("vmmci: posting {:?}", cmd);
        regs.pending = Some(cmd);
        Ok(())
    }

    fn with_regs<T>(&self, f: impl FnOnce(&mut Registers) -> T) -> Option<T> {
        match self.regs.lock() {
            Ok(mut regs) => Some(f(&mut regs)),
            Err(_) => {
                warn!("vmmci: state lock poisoned");
                None
            }
        }
    }
}

fn put_u32(data: &mut [u8], value: u32) {
    let bytes = value.to_le_bytes();
    let n = data.len().min(4);
    data[..n].copy_from_slice(&bytes[..n]);
}

fn get_u32(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let n = data.len().min(4);
    bytes[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(bytes)
}

impl MmioDevice for VmmControl {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        let value = self
            .with_regs(|regs| match offset {
                REG_STATUS => {
                    if regs.ready {
                        STATUS_READY
                    } else {
                        0
                    }
                }
                REG_COMMAND => regs.pending.map_or(0, |c| c as u32),
                REG_CONFIG => regs.ready as u32,
                _ => 0,
            })
            .unwrap_or(0);
        put_u32(data, value);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let value = get_u32(data);
        let acked = self.with_regs(|regs| match offset {
            REG_CONFIG => {
                regs.ready = value & 1 != 0;
                info!("vmmci: guest driver {}", if regs.ready { "ready" } else { "gone" });
                None
            }
            REG_ACK => match (regs.pending, VmmCommand::from_u32(value)) {
                (Some(p), Some(c)) if p == c => regs.pending.take(),
                _ => {
                    warn!("vmmci: unexpected ack {:#x}", value);
                    None
                }
            },
            _ => None,
        });

        if let Some(Some(cmd)) = acked {
            info!("vmmci: guest acknowledged {:?}", cmd);
            if let Err(e) = self.pipe.send(cmd.acknowledged()) {
                warn!("vmmci: {}", e);
            }
        }
    }

    fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        let (ready, pending) = self
            .with_regs(|regs| (regs.ready, regs.pending))
            .ok_or_else(|| io::Error::other("vmmci state lock poisoned"))?;
        w.write_u32::<LittleEndian>(ready as u32)?;
        w.write_u32::<LittleEndian>(pending.map_or(0, |c| c as u32))
    }

    fn restore(&mut self, r: &mut dyn Read) -> io::Result<()> {
        let ready = r.read_u32::<LittleEndian>()? != 0;
        let pending = VmmCommand::from_u32(r.read_u32::<LittleEndian>()?);
        self.with_regs(|regs| {
            regs.ready = ready;
            regs.pending = pending;
        })
        .ok_or_else(|| io::Error::other("vmmci state lock poisoned"))
    }
}
