//! Platform Security Processor (PSP) device interface.
//!
//! The PSP owns the encryption keys of SEV guests. The VM process only ever
//! asks it to start a launch, encrypt-and-measure guest memory, bind vCPU
//! address-space ids to the guest's key, and tear the guest down again.
//!
//! [`PspDevice`] talks to the PSP character device with ioctls; tests use an
//! in-memory [`SecurityProcessor`].

use bitflags::bitflags;
use log::warn;
use nix::{ioctl_none, ioctl_read, ioctl_readwrite, ioctl_write_ptr};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use thiserror::Error;

bitflags! {
    /// Guest policy passed to launch start.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GuestPolicy: u32 {
        /// Debugging of the guest is disallowed.
        const NODBG = 1 << 0;
        /// Sharing keys with other guests is disallowed.
        const NOKS = 1 << 1;
        /// SEV-ES is required.
        const ES = 1 << 2;
        /// Sending the guest to another platform is disallowed.
        const NOSEND = 1 << 3;
        /// Sending the guest outside the domain is disallowed.
        const DOMAIN = 1 << 4;
        /// Sending the guest to a non-SEV platform is disallowed.
        const SEV = 1 << 5;
    }
}

impl GuestPolicy {
    /// Policy used for every guest launched by this process.
    pub fn launch_default() -> Self {
        Self::NODBG | Self::NOKS | Self::NOSEND | Self::DOMAIN | Self::SEV
    }
}

#[derive(Error, Debug)]
pub enum PspError {
    #[error("Failed to open PSP device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("PSP {op} failed: {source}")]
    Command {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformStatus {
    pub api_major: u8,
    pub api_minor: u8,
    pub state: u8,
    pub guest_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestStatus {
    pub policy: u32,
    pub asid: u32,
    pub state: u8,
}

/// Launch measurement and the nonce it was taken with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Measurement {
    pub measure: [u8; 32],
    pub nonce: [u8; 16],
}

/// The nine platform operations used during a guest's life.
pub trait SecurityProcessor: Send {
    fn platform_status(&self) -> Result<PlatformStatus, PspError>;

    /// Flush the data fabric of all cores. Required before activation.
    fn df_flush(&self) -> Result<(), PspError>;

    fn guest_status(&self, handle: u32) -> Result<GuestStatus, PspError>;

    /// Begin a launch; returns the guest handle.
    fn launch_start(&self, policy: GuestPolicy) -> Result<u32, PspError>;

    /// Encrypt and measure `len` bytes at host address `addr`.
    fn launch_update(&self, handle: u32, addr: u64, len: u64) -> Result<(), PspError>;

    fn launch_measure(&self, handle: u32) -> Result<Measurement, PspError>;

    fn launch_finish(&self, handle: u32) -> Result<(), PspError>;

    /// Bind an address-space id to the guest's crypto context.
    fn activate(&self, handle: u32, asid: u32) -> Result<(), PspError>;

    /// Deactivate and decommission the guest, releasing its keys.
    fn guest_shutdown(&self, handle: u32) -> Result<(), PspError>;
}

#[repr(C)]
#[derive(Debug, Default)]
struct RawPlatformStatus {
    api_major: u8,
    api_minor: u8,
    state: u8,
    owner: u8,
    cfges_build: u32,
    guest_count: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct RawGuestStatus {
    handle: u32,
    policy: u32,
    asid: u32,
    state: u8,
}

#[repr(C)]
#[derive(Debug, Default)]
struct RawLaunchStart {
    handle: u32,
    policy: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct RawLaunchUpdateData {
    handle: u32,
    paddr: u64,
    length: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct RawLaunchMeasure {
    handle: u32,
    measure_len: u32,
    measure: [u8; 32],
    measure_nonce: [u8; 16],
}

#[repr(C)]
#[derive(Debug, Default)]
struct RawHandle {
    handle: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct RawActivate {
    handle: u32,
    asid: u32,
}

ioctl_read!(psp_get_pstatus, b'P', 0, RawPlatformStatus);
ioctl_none!(psp_df_flush, b'P', 1);
ioctl_readwrite!(psp_get_gstatus, b'P', 3, RawGuestStatus);
ioctl_readwrite!(psp_launch_start, b'P', 4, RawLaunchStart);
ioctl_write_ptr!(psp_launch_update_data, b'P', 5, RawLaunchUpdateData);
ioctl_readwrite!(psp_launch_measure, b'P', 6, RawLaunchMeasure);
ioctl_write_ptr!(psp_launch_finish, b'P', 7, RawHandle);
ioctl_write_ptr!(psp_activate, b'P', 9, RawActivate);
ioctl_write_ptr!(psp_guest_shutdown, b'P', 11, RawHandle);

/// The PSP character device.
#[derive(Debug)]
pub struct PspDevice {
    file: File,
}

impl PspDevice {
    pub fn open(path: &Path) -> Result<Self, PspError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| PspError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self { file })
    }

    fn check(op: &'static str, result: nix::Result<libc::c_int>) -> Result<(), PspError> {
        result.map(|_| ()).map_err(|errno| {
            warn!("psp {}: {}", op, errno);
            PspError::Command {
                op,
                source: errno.into(),
            }
        })
    }
}

impl SecurityProcessor for PspDevice {
    fn platform_status(&self) -> Result<PlatformStatus, PspError> {
        let mut raw = RawPlatformStatus::default();
        // SAFETY: the argument is a correctly sized struct we own.
        Self::check("get platform status", unsafe {
            psp_get_pstatus(self.file.as_raw_fd(), &mut raw)
        })?;
        Ok(PlatformStatus {
            api_major: raw.api_major,
            api_minor: raw.api_minor,
            state: raw.state,
            guest_count: raw.guest_count,
        })
    }

    fn df_flush(&self) -> Result<(), PspError> {
        // SAFETY: no argument.
        Self::check("df flush", unsafe { psp_df_flush(self.file.as_raw_fd()) })
    }

    fn guest_status(&self, handle: u32) -> Result<GuestStatus, PspError> {
        let mut raw = RawGuestStatus {
            handle,
            ..Default::default()
        };
        // SAFETY: the argument is a correctly sized struct we own.
        Self::check("get guest status", unsafe {
            psp_get_gstatus(self.file.as_raw_fd(), &mut raw)
        })?;
        Ok(GuestStatus {
            policy: raw.policy,
            asid: raw.asid,
            state: raw.state,
        })
    }

    fn launch_start(&self, policy: GuestPolicy) -> Result<u32, PspError> {
        let mut raw = RawLaunchStart {
            handle: 0,
            policy: policy.bits(),
        };
        // SAFETY: the argument is a correctly sized struct we own.
        Self::check("launch start", unsafe {
            psp_launch_start(self.file.as_raw_fd(), &mut raw)
        })?;
        Ok(raw.handle)
    }

    fn launch_update(&self, handle: u32, addr: u64, len: u64) -> Result<(), PspError> {
        // The driver translates the virtual address to a physical one.
        let raw = RawLaunchUpdateData {
            handle,
            paddr: addr,
            length: len,
        };
        // SAFETY: the argument is a correctly sized struct we own.
        Self::check("launch update data", unsafe {
            psp_launch_update_data(self.file.as_raw_fd(), &raw)
        })
    }

    fn launch_measure(&self, handle: u32) -> Result<Measurement, PspError> {
        let mut raw = RawLaunchMeasure {
            handle,
            measure_len: 32,
            ..Default::default()
        };
        // SAFETY: the argument is a correctly sized struct we own.
        Self::check("launch measure", unsafe {
            psp_launch_measure(self.file.as_raw_fd(), &mut raw)
        })?;
        Ok(Measurement {
            measure: raw.measure,
            nonce: raw.measure_nonce,
        })
    }

    fn launch_finish(&self, handle: u32) -> Result<(), PspError> {
        // SAFETY: the argument is a correctly sized struct we own.
        Self::check("launch finish", unsafe {
            psp_launch_finish(self.file.as_raw_fd(), &RawHandle { handle })
        })
    }

    fn activate(&self, handle: u32, asid: u32) -> Result<(), PspError> {
        // SAFETY: the argument is a correctly sized struct we own.
        Self::check("activate", unsafe {
            psp_activate(self.file.as_raw_fd(), &RawActivate { handle, asid })
        })
    }

    fn guest_shutdown(&self, handle: u32) -> Result<(), PspError> {
        // SAFETY: the argument is a correctly sized struct we own.
        Self::check("guest shutdown", unsafe {
            psp_guest_shutdown(self.file.as_raw_fd(), &RawHandle { handle })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_policy_bits() {
        let p = GuestPolicy::launch_default();
        assert_eq!(p.bits(), 0b11_1011);
        assert!(!p.contains(GuestPolicy::ES));
    }

    #[test]
    fn test_open_missing_device() {
        let err = PspDevice::open(Path::new("/nonexistent/psp")).unwrap_err();
        assert!(matches!(err, PspError::Open { .. }));
    }
}
