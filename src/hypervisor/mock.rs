//! In-memory hypervisor for unit tests.
//!
//! Each vCPU has a script of exits returned by successive `run` calls; when
//! the script is empty `run` reports a HLT. Every `run` call records the
//! injection descriptor it was given, so tests can assert exactly what was
//! delivered to the guest.

use super::{
    CreateParams, Hypervisor, HypervisorError, InjectType, RegisterMask, VcpuRegisterState,
    VcpuRunParams, VmCreated, VmExit, VmId, VmParamMask, VmParamState,
};
use crate::memory::{move_mapping, MemoryRange};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockVcpu {
    regs: VcpuRegisterState,
    params: VmParamState,
    script: VecDeque<VmExit>,
    runs: Vec<InjectType>,
    resets: u32,
}

#[derive(Debug, Default)]
struct MockVm {
    id: VmId,
    vcpus: Vec<MockVcpu>,
    memory: Vec<MemoryRange>,
}

pub struct MockHypervisor {
    next_id: AtomicU32,
    vm: Mutex<Option<MockVm>>,
    changed: Condvar,
    terminated: AtomicBool,
    fail_create: AtomicBool,
    fail_terminate: AtomicBool,
    /// Exits queued for the VM the next `create` builds.
    initial_exits: Mutex<Vec<(u32, VmExit)>>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            vm: Mutex::new(None),
            changed: Condvar::new(),
            terminated: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
            initial_exits: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `create` fail with `EPERM`.
    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Make `terminate` fail with `EIO`.
    pub fn fail_terminate(&self) {
        self.fail_terminate.store(true, Ordering::SeqCst);
    }

    /// Shortcut for tests that only need a VM to exist.
    pub fn create_for_test(&self, ncpus: u32, memory: &[MemoryRange]) -> VmId {
        self.create(&CreateParams {
            name: "test".into(),
            ncpus,
            memory: memory.to_vec(),
            sev: false,
        })
        .unwrap()
        .id
    }

    /// Queue exits for a vCPU of a VM that does not exist yet.
    pub fn script_on_create(&self, vcpu: u32, exits: impl IntoIterator<Item = VmExit>) {
        let mut initial = self.initial_exits.lock().unwrap();
        initial.extend(exits.into_iter().map(|e| (vcpu, e)));
    }

    /// Queue exits for a vCPU's upcoming `run` calls.
    pub fn push_exits(&self, vcpu: u32, exits: impl IntoIterator<Item = VmExit>) {
        let mut vm = self.vm.lock().unwrap();
        let vm = vm.as_mut().unwrap();
        vm.vcpus[vcpu as usize].script.extend(exits);
    }

    /// Injection descriptors of every `run` call so far.
    pub fn runs(&self, vcpu: u32) -> Vec<InjectType> {
        let vm = self.vm.lock().unwrap();
        vm.as_ref().unwrap().vcpus[vcpu as usize].runs.clone()
    }

    pub fn resets(&self, vcpu: u32) -> u32 {
        let vm = self.vm.lock().unwrap();
        vm.as_ref().unwrap().vcpus[vcpu as usize].resets
    }

    pub fn set_registers(&self, vcpu: u32, regs: VcpuRegisterState) {
        let mut vm = self.vm.lock().unwrap();
        vm.as_mut().unwrap().vcpus[vcpu as usize].regs = regs;
    }

    pub fn registers(&self, vcpu: u32) -> VcpuRegisterState {
        let vm = self.vm.lock().unwrap();
        vm.as_ref().unwrap().vcpus[vcpu as usize].regs
    }

    pub fn set_vm_params(&self, vcpu: u32, params: VmParamState) {
        let mut vm = self.vm.lock().unwrap();
        vm.as_mut().unwrap().vcpus[vcpu as usize].params = params;
    }

    pub fn vm_params(&self, vcpu: u32) -> VmParamState {
        let vm = self.vm.lock().unwrap();
        vm.as_ref().unwrap().vcpus[vcpu as usize].params
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Block until the vCPU has made at least `count` run calls.
    pub fn wait_for_runs(&self, vcpu: u32, count: usize, timeout: Duration) -> bool {
        let vm = self.vm.lock().unwrap();
        let (_vm, result) = self
            .changed
            .wait_timeout_while(vm, timeout, |vm| {
                vm.as_ref().unwrap().vcpus[vcpu as usize].runs.len() < count
            })
            .unwrap();
        !result.timed_out()
    }

    fn with_vcpu<T>(
        &self,
        vm_id: VmId,
        vcpu: u32,
        f: impl FnOnce(&mut MockVcpu) -> T,
    ) -> Result<T, HypervisorError> {
        let mut vm = self.vm.lock().map_err(|_| HypervisorError::Poisoned(vcpu))?;
        let vm = vm.as_mut().ok_or(HypervisorError::UnknownVm(vm_id))?;
        if vm.id != vm_id {
            return Err(HypervisorError::UnknownVm(vm_id));
        }
        let v = vm
            .vcpus
            .get_mut(vcpu as usize)
            .ok_or(HypervisorError::UnknownVcpu(vcpu))?;
        Ok(f(v))
    }
}

impl Hypervisor for MockHypervisor {
    fn create(&self, params: &CreateParams) -> Result<VmCreated, HypervisorError> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(HypervisorError::CreateVm(io::Error::from_raw_os_error(
                libc::EPERM,
            )));
        }
        let mut vm = self.vm.lock().map_err(|_| HypervisorError::Poisoned(0))?;
        if vm.is_some() {
            return Err(HypervisorError::AlreadyCreated);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut vcpus: Vec<MockVcpu> = (0..params.ncpus).map(|_| MockVcpu::default()).collect();
        let initial = self
            .initial_exits
            .lock()
            .map_err(|_| HypervisorError::Poisoned(0))?;
        for (vcpu, exit) in initial.iter() {
            if let Some(v) = vcpus.get_mut(*vcpu as usize) {
                v.script.push_back(*exit);
            }
        }
        *vm = Some(MockVm {
            id,
            vcpus,
            memory: params.memory.clone(),
        });
        Ok(VmCreated {
            id,
            asids: (1..=params.ncpus).collect(),
        })
    }

    fn reset_vcpu(
        &self,
        vm: VmId,
        vcpu: u32,
        regs: &VcpuRegisterState,
    ) -> Result<(), HypervisorError> {
        self.with_vcpu(vm, vcpu, |v| {
            v.regs = *regs;
            v.resets += 1;
        })
    }

    fn read_registers(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: RegisterMask,
    ) -> Result<VcpuRegisterState, HypervisorError> {
        self.with_vcpu(vm, vcpu, |v| {
            let mut out = VcpuRegisterState::default();
            out.merge(mask, &v.regs);
            out
        })
    }

    fn write_registers(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: RegisterMask,
        regs: &VcpuRegisterState,
    ) -> Result<(), HypervisorError> {
        self.with_vcpu(vm, vcpu, |v| v.regs.merge(mask, regs))
    }

    fn read_vm_params(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: VmParamMask,
    ) -> Result<VmParamState, HypervisorError> {
        self.with_vcpu(vm, vcpu, |v| {
            let mut out = VmParamState::default();
            out.merge(mask, &v.params);
            out
        })
    }

    fn write_vm_params(
        &self,
        vm: VmId,
        vcpu: u32,
        mask: VmParamMask,
        params: &VmParamState,
    ) -> Result<(), HypervisorError> {
        self.with_vcpu(vm, vcpu, |v| v.params.merge(mask, params))
    }

    fn run(&self, params: &mut VcpuRunParams) -> Result<(), HypervisorError> {
        let terminated = self.terminated.load(Ordering::SeqCst);
        let exit = self.with_vcpu(params.vm_id, params.vcpu_id, |v| {
            v.runs.push(params.inject);
            if terminated {
                VmExit::Terminated
            } else {
                v.script.pop_front().unwrap_or(VmExit::Hlt)
            }
        })?;
        self.changed.notify_all();
        params.exit = exit;
        params.irq_ready = true;
        Ok(())
    }

    fn inject_interrupt(&self, vm: VmId, vcpu: u32, _vector: u8) -> Result<(), HypervisorError> {
        self.with_vcpu(vm, vcpu, |_| ())
    }

    fn terminate(&self, vm: VmId) -> Result<(), HypervisorError> {
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(HypervisorError::Terminate(io::Error::from_raw_os_error(
                libc::EIO,
            )));
        }
        let guard = self.vm.lock().map_err(|_| HypervisorError::Poisoned(0))?;
        match guard.as_ref() {
            Some(v) if v.id == vm => {}
            _ => return Err(HypervisorError::UnknownVm(vm)),
        }
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn share_memory(&self, vm: VmId, ranges: &[MemoryRange]) -> Result<(), HypervisorError> {
        let mut guard = self.vm.lock().map_err(|_| HypervisorError::Poisoned(0))?;
        let state = guard.as_mut().ok_or(HypervisorError::UnknownVm(vm))?;
        for (old, new) in state.memory.iter_mut().zip(ranges) {
            if !old.is_ram() {
                continue;
            }
            // SAFETY: the old range is the allocation registered at create,
            // and the caller released the placeholder at the new address.
            unsafe { move_mapping(old.host_addr, new.host_addr, old.size as usize) }
                .map_err(HypervisorError::ShareMemory)?;
            old.host_addr = new.host_addr;
        }
        Ok(())
    }
}
