//! Confidential-compute (AMD SEV) launch flow.
//!
//! [`ConfidentialCompute`] drives the platform security processor through a
//! guest's life:
//!
//! ```text
//! Uninitialized ──launch_start──► Started ──launch_finish──► Active
//!                                  │  df_flush + activate (per vCPU)
//!                                  │  launch_update (per RAM range)
//!                                  │  launch_measure
//!                                                             │
//!                              Closed ◄──guest_shutdown── ShuttingDown
//! ```
//!
//! Every vCPU is bound to the guest's key while the launch is still open, then
//! guest memory is encrypted in place and measured, then the launch is
//! finished. An operation attempted in the wrong state means the lifecycle
//! was driven out of order and is reported as [`SevError::OutOfOrder`]; none
//! of the steps are retried.
//!
//! When the VM is not a confidential guest the adapter is disabled and every
//! operation is a no-op.

mod psp;

pub use psp::{
    GuestPolicy, GuestStatus, Measurement, PlatformStatus, PspDevice, PspError,
    SecurityProcessor,
};

use crate::memory::GuestMemory;
use log::{debug, info, warn};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SevError {
    #[error("SEV {op} called in state {state}")]
    OutOfOrder {
        op: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Psp(#[from] PspError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Disabled,
    Uninitialized,
    Started { handle: u32 },
    Active { handle: u32 },
    ShuttingDown { handle: u32 },
    Closed,
}

impl LaunchState {
    fn name(&self) -> &'static str {
        match self {
            LaunchState::Disabled => "disabled",
            LaunchState::Uninitialized => "uninitialized",
            LaunchState::Started { .. } => "started",
            LaunchState::Active { .. } => "active",
            LaunchState::ShuttingDown { .. } => "shutting down",
            LaunchState::Closed => "closed",
        }
    }
}

pub struct ConfidentialCompute {
    psp: Option<Box<dyn SecurityProcessor>>,
    state: LaunchState,
}

impl ConfidentialCompute {
    /// An adapter for a guest that is not encrypted.
    pub fn disabled() -> Self {
        Self {
            psp: None,
            state: LaunchState::Disabled,
        }
    }

    pub fn new(psp: Box<dyn SecurityProcessor>) -> Self {
        Self {
            psp: Some(psp),
            state: LaunchState::Uninitialized,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.psp.is_some()
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    fn out_of_order(&self, op: &'static str) -> SevError {
        SevError::OutOfOrder {
            op,
            state: self.state.name(),
        }
    }

    /// Start the launch with the default guest policy.
    pub fn init(&mut self) -> Result<(), SevError> {
        let Some(psp) = self.psp.as_deref() else {
            return Ok(());
        };
        if self.state != LaunchState::Uninitialized {
            return Err(self.out_of_order("launch start"));
        }

        let status = psp.platform_status()?;
        debug!(
            "psp: api {}.{}, state {}, {} guest(s)",
            status.api_major, status.api_minor, status.state, status.guest_count
        );

        let handle = psp.launch_start(GuestPolicy::launch_default())?;
        info!("sev: launch started, handle {}", handle);
        self.state = LaunchState::Started { handle };
        Ok(())
    }

    /// Bind a vCPU's address-space id to the guest's crypto context.
    pub fn activate_vcpu(&mut self, vcpu: u32, asid: u32) -> Result<(), SevError> {
        let Some(psp) = self.psp.as_deref() else {
            return Ok(());
        };
        let LaunchState::Started { handle } = self.state else {
            return Err(self.out_of_order("activate"));
        };

        // The data fabric has to be flushed before any activation.
        psp.df_flush()?;
        psp.activate(handle, asid)?;
        debug!("sev: vcpu{} activated with asid {}", vcpu, asid);
        Ok(())
    }

    /// Encrypt and measure guest RAM in place, then finish the launch.
    ///
    /// Once the launch is finished further calls do nothing.
    pub fn encrypt_memory(&mut self, memory: &GuestMemory) -> Result<(), SevError> {
        let Some(psp) = self.psp.as_deref() else {
            return Ok(());
        };
        let handle = match self.state {
            LaunchState::Started { handle } => handle,
            LaunchState::Active { .. } => return Ok(()),
            _ => return Err(self.out_of_order("launch update")),
        };

        for range in memory.ranges().iter().filter(|r| r.is_ram()) {
            debug!(
                "sev: encrypting gpa {:#x}..{:#x}",
                range.gpa,
                range.end()
            );
            psp.launch_update(handle, range.host_addr, range.size)?;
        }

        // Nothing to verify against: no integrity key was negotiated with a
        // guest owner. The values are logged for audit.
        let m = psp.launch_measure(handle)?;
        info!(
            "sev: measurement {} nonce {}",
            hex(&m.measure),
            hex(&m.nonce)
        );

        psp.launch_finish(handle)?;
        self.state = LaunchState::Active { handle };

        let status = psp.guest_status(handle)?;
        debug!(
            "sev: guest policy {:#x} asid {} state {}",
            status.policy, status.asid, status.state
        );
        Ok(())
    }

    /// Release the guest's keys.
    ///
    /// A launch that never finished is shut down too, so no partially
    /// activated guest is left behind.
    pub fn shutdown(&mut self) -> Result<(), SevError> {
        let Some(psp) = self.psp.as_deref() else {
            return Ok(());
        };
        let handle = match self.state {
            LaunchState::Started { handle } | LaunchState::Active { handle } => handle,
            LaunchState::ShuttingDown { handle } => handle,
            _ => return Ok(()),
        };

        self.state = LaunchState::ShuttingDown { handle };
        psp.guest_shutdown(handle)?;
        self.state = LaunchState::Closed;
        info!("sev: guest {} shut down", handle);
        Ok(())
    }
}

/// Any launch still holding keys when the adapter goes away is shut down,
/// whichever way the VM start ended.
impl Drop for ConfidentialCompute {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("sev: could not shut down guest: {}", e);
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}
