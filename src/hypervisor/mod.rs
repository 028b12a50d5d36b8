//! The boundary to the in-kernel hypervisor.
//!
//! Everything the VM process asks of the kernel goes through the
//! [`Hypervisor`] trait: creating the VM, resetting and running vCPUs,
//! moving register and VM-parameter state in and out, injecting interrupts,
//! terminating the VM and re-sharing guest memory.
//!
//! ```text
//!   VM process                          kernel
//! ┌──────────────┐   create/reset     ┌──────────────────┐
//! │ lifecycle    │ ─────────────────► │                  │
//! │ vcpu threads │ ── run ──────────► │   hypervisor     │
//! │ migration    │ ── read/write ───► │   (KVM)          │
//! │ event thread │ ── inject/term ──► │                  │
//! └──────────────┘                    └──────────────────┘
//! ```
//!
//! `run` is the only long blocking call. It returns when the guest needs
//! user-level handling (I/O, MMIO, HLT, ...), when the call is interrupted by
//! an injection kick ([`VmExit::None`]), or once the VM has been terminated
//! ([`VmExit::Terminated`]).
//!
//! Exits that need a response (port and MMIO reads) are completed by the
//! exit handler filling the data in [`VcpuRunParams::exit`]; the backend hands
//! that data to the guest on the next `run`.

#[cfg(target_os = "linux")]
pub mod kvm;
#[cfg(test)]
pub mod mock;
mod state;

pub use state::{
    seg_attr, ControlRegisters, DebugRegisters, DescriptorTable, Gprs, ModelSpecificRegisters,
    RegisterMask, Segment, SegmentRegisters, VcpuRegisterState, VmParamMask, VmParamState,
};

use crate::memory::MemoryRange;
use std::io;
use thiserror::Error;

/// Kernel-assigned VM identifier. Zero is never a valid id.
pub type VmId = u32;

/// Coarse classification of every hypervisor failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The VM or vCPU id does not exist.
    InvalidId,
    /// A kernel resource limit was hit.
    ResourceLimit,
    /// The caller lacks permission.
    Denied,
    /// Anything else.
    IoFailure,
}

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Failed to open the hypervisor device.
    #[error("Failed to open hypervisor device: {0}")]
    Open(#[source] io::Error),

    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] io::Error),

    #[error("Failed to create vCPU {vcpu}: {source}")]
    CreateVcpu {
        vcpu: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to register memory slot {slot}: {source}")]
    MemorySlot {
        slot: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to reset vCPU {vcpu}: {source}")]
    ResetVcpu {
        vcpu: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read registers of vCPU {vcpu}: {source}")]
    ReadRegisters {
        vcpu: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write registers of vCPU {vcpu}: {source}")]
    WriteRegisters {
        vcpu: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read VM parameters of vCPU {vcpu}: {source}")]
    ReadVmParams {
        vcpu: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write VM parameters of vCPU {vcpu}: {source}")]
    WriteVmParams {
        vcpu: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to run vCPU {vcpu}: {source}")]
    Run {
        vcpu: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to inject interrupt into vCPU {vcpu}: {source}")]
    InjectInterrupt {
        vcpu: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to terminate VM: {0}")]
    Terminate(#[source] io::Error),

    #[error("Failed to share guest memory: {0}")]
    ShareMemory(#[source] io::Error),

    #[error("Unknown VM id {0}")]
    UnknownVm(VmId),

    #[error("Unknown vCPU {0}")]
    UnknownVcpu(u32),

    /// Only one VM may exist per process.
    #[error("A VM already exists in this process")]
    AlreadyCreated,

    #[error("vCPU {0} state lock poisoned")]
    Poisoned(u32),
}

impl HypervisorError {
    fn io_source(&self) -> Option<&io::Error> {
        match self {
            Self::Open(e) | Self::CreateVm(e) | Self::Terminate(e) | Self::ShareMemory(e) => Some(e),
            Self::CreateVcpu { source, .. }
            | Self::MemorySlot { source, .. }
            | Self::ResetVcpu { source, .. }
            | Self::ReadRegisters { source, .. }
            | Self::WriteRegisters { source, .. }
            | Self::ReadVmParams { source, .. }
            | Self::WriteVmParams { source, .. }
            | Self::Run { source, .. }
            | Self::InjectInterrupt { source, .. } => Some(source),
            Self::UnknownVm(_) | Self::UnknownVcpu(_) | Self::AlreadyCreated | Self::Poisoned(_) => {
                None
            }
        }
    }

    /// The OS error number behind the failure, if any.
    pub fn errno(&self) -> Option<i32> {
        self.io_source().and_then(io::Error::raw_os_error)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownVm(_) | Self::UnknownVcpu(_) => ErrorKind::InvalidId,
            Self::AlreadyCreated => ErrorKind::ResourceLimit,
            Self::Poisoned(_) => ErrorKind::IoFailure,
            _ => match self.io_source().and_then(io::Error::raw_os_error) {
                Some(libc::ENOENT | libc::ESRCH | libc::EBADF) => ErrorKind::InvalidId,
                Some(libc::ENOMEM | libc::ENOSPC | libc::EAGAIN | libc::EMFILE | libc::ENFILE) => {
                    ErrorKind::ResourceLimit
                }
                Some(libc::EPERM | libc::EACCES) => ErrorKind::Denied,
                _ => ErrorKind::IoFailure,
            },
        }
    }
}

/// Parameters for creating a VM in the kernel.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub name: String,
    pub ncpus: u32,
    /// Memory layout with host addresses of every RAM range filled in.
    pub memory: Vec<MemoryRange>,
    /// Request an encrypted-memory guest.
    pub sev: bool,
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmCreated {
    pub id: VmId,
    /// Per-vCPU address space identifiers used for encrypted-memory
    /// activation.
    pub asids: Vec<u32>,
}

/// Maximum bytes moved by a single port I/O or MMIO access.
pub const MAX_ACCESS_SIZE: usize = 8;

/// Fixed-size access data buffer to avoid heap allocation.
///
/// Port I/O moves 1, 2 or 4 bytes; MMIO up to 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoData {
    data: [u8; MAX_ACCESS_SIZE],
    len: u8,
}

impl IoData {
    #[inline]
    pub fn new(len: usize) -> Self {
        Self {
            data: [0; MAX_ACCESS_SIZE],
            len: len.min(MAX_ACCESS_SIZE) as u8,
        }
    }

    #[inline]
    pub fn from_slice(slice: &[u8]) -> Self {
        let len = slice.len().min(MAX_ACCESS_SIZE);
        let mut data = [0u8; MAX_ACCESS_SIZE];
        data[..len].copy_from_slice(&slice[..len]);
        Self {
            data,
            len: len as u8,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Fill every valid byte with `value`.
    #[inline]
    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }

    /// The valid bytes as a little-endian integer.
    pub fn value(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..self.len()].copy_from_slice(self.as_slice());
        u64::from_le_bytes(bytes)
    }
}

impl Default for IoData {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Why `run` returned, with the data needed to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmExit {
    /// Nothing to handle (interrupted by a kick, or not run yet).
    #[default]
    None,
    /// The VM was terminated; the vCPU must stop.
    Terminated,
    /// Guest IN instruction. The handler fills `data`.
    IoIn { port: u16, data: IoData },
    /// Guest OUT instruction.
    IoOut { port: u16, data: IoData },
    /// Guest read of an unbacked address. The handler fills `data`.
    MmioRead { addr: u64, data: IoData },
    MmioWrite { addr: u64, data: IoData },
    /// Guest executed HLT.
    Hlt,
    /// Triple fault.
    Shutdown,
    InternalError,
    /// Hardware refused VM entry.
    FailEntry(u64),
    SystemEvent(u32),
    Unknown(&'static str),
}

/// Interrupt to deliver on the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectType {
    #[default]
    None,
    /// External interrupt with the given vector.
    Intr(u8),
}

/// Per-vCPU run parameters, owned by that vCPU's thread.
#[derive(Debug, Clone, Default)]
pub struct VcpuRunParams {
    pub vm_id: VmId,
    pub vcpu_id: u32,
    /// Interrupt to inject on entry.
    pub inject: InjectType,
    /// More interrupts are pending; ask for an exit once injectable.
    pub intr_pending: bool,
    /// Set by the backend: the guest can take an interrupt now.
    pub irq_ready: bool,
    /// Last exit, filled by `run`.
    pub exit: VmExit,
}

impl VcpuRunParams {
    pub fn new(vm_id: VmId, vcpu_id: u32) -> Self {
        Self {
            vm_id,
            vcpu_id,
            ..Default::default()
        }
    }
}

/// Operations of the in-kernel hypervisor.
///
/// Failure of `create` or `reset_vcpu` is fatal to VM startup; failure of a
/// per-vCPU operation is fatal to that vCPU only.
pub trait Hypervisor: Send + Sync {
    fn create(&self, params: &CreateParams) -> Result<VmCreated, HypervisorError>;

    /// Reset a vCPU and load `regs` into it.
    fn reset_vcpu(
        &self,
        vm: VmId,
        vcpu: u32,
        regs: &VcpuRegisterState,
    ) -> Result<(), HypervisorError>;

    /// Read the groups in `mask`; other groups are returned zeroed.
    fn read_registers(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: RegisterMask,
    ) -> Result<VcpuRegisterState, HypervisorError>;

    fn write_registers(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: RegisterMask,
        regs: &VcpuRegisterState,
    ) -> Result<(), HypervisorError>;

    fn read_vm_params(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: VmParamMask,
    ) -> Result<VmParamState, HypervisorError>;

    fn write_vm_params(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: VmParamMask,
        params: &VmParamState,
    ) -> Result<(), HypervisorError>;

    /// Enter the guest and block until it exits.
    fn run(&self, params: &mut VcpuRunParams) -> Result<(), HypervisorError>;

    /// Ask a running vCPU to come back out of `run` so a pending interrupt
    /// can be injected. A no-op for a vCPU that is not in `run`.
    fn inject_interrupt(&self, vm: VmId, vcpu: u32, vector: u8) -> Result<(), HypervisorError>;

    /// Terminate the VM. Every subsequent or in-flight `run` returns
    /// [`VmExit::Terminated`].
    fn terminate(&self, vm: VmId) -> Result<(), HypervisorError>;

    /// Re-establish the backing of every RAM range at the host addresses in
    /// `ranges`.
    fn share_memory(&self, vm: VmId, ranges: &[MemoryRange]) -> Result<(), HypervisorError>;
}
