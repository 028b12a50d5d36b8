//! Linux KVM implementation of [`Hypervisor`].
//!
//! The VM process talks to KVM through ioctls on three kinds of descriptor:
//!
//! - `/dev/kvm` - system-level operations (capabilities, create VM)
//! - VM file descriptor - memory slots, vCPU creation
//! - vCPU file descriptor - run, registers, MSRs, interrupt injection
//!
//! ```text
//! User Space (VM process)             Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │ KvmHypervisor│    ioctl()        │   KVM Module     │
//! │  KvmVm ──────┼──────────────────►│  VM state        │
//! │  KvmVcpu ────┼──────────────────►│  vCPU state      │
//! └──────────────┘                   └──────────────────┘
//! ```
//!
//! KVM has no numeric VM ids, so ids are handed out by this process,
//! starting at 1. Only one VM may be created per process.

mod vcpu;
mod vm;

use super::{
    CreateParams, Hypervisor, HypervisorError, RegisterMask, VcpuRegisterState, VcpuRunParams,
    VmCreated, VmId, VmParamMask, VmParamState,
};
use crate::memory::MemoryRange;
use kvm_ioctls::Kvm;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use vm::KvmVm;

static NEXT_VM_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) fn os_error(e: kvm_ioctls::Error) -> io::Error {
    io::Error::from_raw_os_error(e.errno())
}

pub struct KvmHypervisor {
    kvm: Kvm,
    vm: OnceLock<KvmVm>,
}

impl KvmHypervisor {
    /// Open `/dev/kvm` and install the vCPU kick handler.
    pub fn new() -> Result<Self, HypervisorError> {
        let kvm = Kvm::new().map_err(|e| HypervisorError::Open(os_error(e)))?;
        vcpu::register_kick_handler()?;
        Ok(Self {
            kvm,
            vm: OnceLock::new(),
        })
    }

    fn vm(&self, id: VmId) -> Result<&KvmVm, HypervisorError> {
        match self.vm.get() {
            Some(vm) if vm.id() == id => Ok(vm),
            _ => Err(HypervisorError::UnknownVm(id)),
        }
    }
}

impl Hypervisor for KvmHypervisor {
    fn create(&self, params: &CreateParams) -> Result<VmCreated, HypervisorError> {
        if self.vm.get().is_some() {
            return Err(HypervisorError::AlreadyCreated);
        }
        let id = NEXT_VM_ID.fetch_add(1, Ordering::Relaxed);
        let vm = KvmVm::new(&self.kvm, id, params)?;
        self.vm
            .set(vm)
            .map_err(|_| HypervisorError::AlreadyCreated)?;

        // Guest encryption contexts are owned by the platform security
        // processor; KVM itself hands out no per-vCPU ASIDs.
        Ok(VmCreated {
            id,
            asids: vec![0; params.ncpus as usize],
        })
    }

    fn reset_vcpu(
        &self,
        vm: VmId,
        vcpu: u32,
        regs: &VcpuRegisterState,
    ) -> Result<(), HypervisorError> {
        self.vm(vm)?.vcpu(vcpu)?.reset(regs)
    }

    fn read_registers(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: RegisterMask,
    ) -> Result<VcpuRegisterState, HypervisorError> {
        self.vm(vm)?.vcpu(vcpu)?.read_registers(mask)
    }

    fn write_registers(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: RegisterMask,
        regs: &VcpuRegisterState,
    ) -> Result<(), HypervisorError> {
        self.vm(vm)?.vcpu(vcpu)?.write_registers(mask, regs)
    }

    fn read_vm_params(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: VmParamMask,
    ) -> Result<VmParamState, HypervisorError> {
        self.vm(vm)?.vcpu(vcpu)?.read_vm_params(mask)
    }

    fn write_vm_params(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: VmParamMask,
        params: &VmParamState,
    ) -> Result<(), HypervisorError> {
        self.vm(vm)?.vcpu(vcpu)?.write_vm_params(mask, params)
    }

    fn run(&self, params: &mut VcpuRunParams) -> Result<(), HypervisorError> {
        let vm = self.vm(params.vm_id)?;
        vm.vcpu(params.vcpu_id)?.run(params, vm.terminated())
    }

    fn inject_interrupt(&self, vm: VmId, vcpu: u32, _vector: u8) -> Result<(), HypervisorError> {
        // The vector itself is delivered with KVM_INTERRUPT by the vCPU's own
        // thread once the interrupt window is open.
        self.vm(vm)?.vcpu(vcpu)?.kick()
    }

    fn terminate(&self, vm: VmId) -> Result<(), HypervisorError> {
        self.vm(vm)?.terminate()
    }

    fn share_memory(&self, vm: VmId, ranges: &[MemoryRange]) -> Result<(), HypervisorError> {
        self.vm(vm)?.share_memory(ranges)
    }
}
