//! KVM virtual machine: memory slots, vCPUs and termination.
//!
//! # Memory Slots
//!
//! Each RAM range becomes one KVM memory slot mapping its guest physical
//! range to the host mapping allocated for it. MMIO ranges get no slot, so
//! guest accesses to them exit to user space.
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ slot 0 (RAM) │ ────► │ mapping #0   │
//! ├──────────────┤       └──────────────┘
//! │ MMIO (none)  │
//! ├──────────────┤       ┌──────────────┐
//! │ slot 1 (RAM) │ ────► │ mapping #2   │
//! └──────────────┘       └──────────────┘
//! ```
//!
//! # Interrupts
//!
//! No in-kernel irqchip or PIT is created: the interrupt controller is
//! emulated by the VM process and interrupts are injected with
//! `KVM_INTERRUPT`.

use super::os_error;
use super::vcpu::KvmVcpu;
use crate::hypervisor::{CreateParams, HypervisorError, VmId};
use crate::memory::{move_mapping, MemoryRange};
use kvm_bindings::{kvm_cpuid_entry2, kvm_userspace_memory_region, CpuId, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::Kvm;
use log::{debug, info};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct MemorySlot {
    slot: u32,
    gpa: u64,
    size: u64,
    host_addr: u64,
}

pub struct KvmVm {
    id: VmId,
    fd: kvm_ioctls::VmFd,
    vcpus: Vec<KvmVcpu>,
    slots: Mutex<Vec<MemorySlot>>,
    terminated: AtomicBool,
}

impl KvmVm {
    /// Create the VM, register guest RAM and create every vCPU.
    pub fn new(kvm: &Kvm, id: VmId, params: &CreateParams) -> Result<Self, HypervisorError> {
        let create_err = |e| HypervisorError::CreateVm(os_error(e));

        let supported_cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(create_err)?;
        let fd = kvm.create_vm().map_err(create_err)?;

        // Intel VT-x needs a TSS address in an unused part of the 32-bit
        // hole. It does not have to be backed by memory.
        fd.set_tss_address(0xfffb_d000).map_err(create_err)?;

        let mut vm = Self {
            id,
            fd,
            vcpus: Vec::with_capacity(params.ncpus as usize),
            slots: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        };

        vm.register_memory(&params.memory)?;
        for index in 0..params.ncpus {
            let vcpu = vm.create_vcpu(index, &supported_cpuid)?;
            vm.vcpus.push(vcpu);
        }

        info!(
            "created KVM VM {} ({}) with {} vCPU(s)",
            id, params.name, params.ncpus
        );
        Ok(vm)
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn vcpu(&self, index: u32) -> Result<&KvmVcpu, HypervisorError> {
        self.vcpus
            .get(index as usize)
            .ok_or(HypervisorError::UnknownVcpu(index))
    }

    pub fn vcpus(&self) -> &[KvmVcpu] {
        &self.vcpus
    }

    pub fn terminated(&self) -> &AtomicBool {
        &self.terminated
    }

    /// Mark the VM terminated and pull every vCPU out of `KVM_RUN`.
    pub fn terminate(&self) -> Result<(), HypervisorError> {
        self.terminated.store(true, Ordering::Release);
        for vcpu in &self.vcpus {
            vcpu.kick()?;
        }
        Ok(())
    }

    /// # Safety
    ///
    /// The host range must stay mapped for as long as the slot exists.
    unsafe fn set_slot(&self, slot: &MemorySlot, size: u64) -> Result<(), HypervisorError> {
        let region = kvm_userspace_memory_region {
            slot: slot.slot,
            guest_phys_addr: slot.gpa,
            memory_size: size,
            userspace_addr: slot.host_addr,
            flags: 0,
        };
        // SAFETY: upheld by the caller.
        unsafe { self.fd.set_user_memory_region(region) }.map_err(|e| {
            HypervisorError::MemorySlot {
                slot: slot.slot,
                source: os_error(e),
            }
        })
    }

    fn register_memory(&mut self, ranges: &[MemoryRange]) -> Result<(), HypervisorError> {
        let mut slots = Vec::new();
        for range in ranges.iter().filter(|r| r.is_ram()) {
            let slot = MemorySlot {
                slot: slots.len() as u32,
                gpa: range.gpa,
                size: range.size,
                host_addr: range.host_addr,
            };
            // SAFETY: the mapping is owned by GuestMemory, which outlives the
            // VM in the VM process.
            unsafe { self.set_slot(&slot, slot.size) }?;
            debug!(
                "slot {}: gpa {:#x}..{:#x} -> {:#x}",
                slot.slot,
                slot.gpa,
                slot.gpa + slot.size,
                slot.host_addr
            );
            slots.push(slot);
        }
        *self.slots.get_mut().map_err(|_| HypervisorError::Poisoned(0))? = slots;
        Ok(())
    }

    /// Move the backing of every slot to the host address given for the
    /// matching RAM range and re-register the slot there.
    pub fn share_memory(&self, ranges: &[MemoryRange]) -> Result<(), HypervisorError> {
        let mut slots = self.slots.lock().map_err(|_| HypervisorError::Poisoned(0))?;
        let ram: Vec<&MemoryRange> = ranges.iter().filter(|r| r.is_ram()).collect();
        if ram.len() != slots.len() {
            return Err(HypervisorError::ShareMemory(io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }

        for (slot, range) in slots.iter_mut().zip(ram) {
            if range.gpa != slot.gpa || range.size != slot.size {
                return Err(HypervisorError::ShareMemory(io::Error::from_raw_os_error(
                    libc::EINVAL,
                )));
            }
            // A slot's host address can only change by deleting and
            // re-creating it.
            // SAFETY: a zero-sized region deletes the slot.
            unsafe { self.set_slot(slot, 0) }?;
            // SAFETY: the slot's mapping is ours and the new range was
            // released by the caller for this purpose.
            unsafe { move_mapping(slot.host_addr, range.host_addr, slot.size as usize) }
                .map_err(HypervisorError::ShareMemory)?;
            slot.host_addr = range.host_addr;
            // SAFETY: the backing now lives at the new address.
            unsafe { self.set_slot(slot, slot.size) }?;
        }
        Ok(())
    }

    fn create_vcpu(&self, index: u32, supported: &CpuId) -> Result<KvmVcpu, HypervisorError> {
        let vcpu_err = |e| HypervisorError::CreateVcpu {
            vcpu: index,
            source: os_error(e),
        };
        let vcpu = self.fd.create_vcpu(u64::from(index)).map_err(vcpu_err)?;

        // TSC frequency lets the guest skip PIT calibration.
        let tsc_khz = vcpu.get_tsc_khz().unwrap_or(0);
        let cpuid = build_cpuid(supported, index, tsc_khz).map_err(|source| {
            HypervisorError::CreateVcpu {
                vcpu: index,
                source,
            }
        })?;
        vcpu.set_cpuid2(&cpuid).map_err(vcpu_err)?;

        debug!(
            "vcpu{}: {} CPUID entries, TSC {} kHz",
            index,
            cpuid.as_slice().len(),
            tsc_khz
        );
        Ok(KvmVcpu::new(index, vcpu))
    }
}

/// Build the CPUID table for one vCPU.
///
/// Sets the hypervisor bit and the initial APIC id, and adds the KVM
/// paravirt leaves:
/// - 0x40000000: KVM signature ("KVMKVMKVM")
/// - 0x40000001: KVM features (kvm-clock, ...)
/// - 0x40000010: TSC frequency in kHz (when known)
fn build_cpuid(supported: &CpuId, index: u32, tsc_khz: u32) -> io::Result<CpuId> {
    let mut entries: Vec<kvm_cpuid_entry2> = supported.as_slice().to_vec();

    for entry in &mut entries {
        if entry.function == 1 {
            entry.ecx |= 1 << 31; // X86_FEATURE_HYPERVISOR
            entry.ebx = (entry.ebx & 0x00ff_ffff) | (index << 24);
        }
    }

    entries.retain(|e| e.function < 0x4000_0000 || e.function > 0x4000_00ff);

    entries.push(kvm_cpuid_entry2 {
        function: 0x4000_0000,
        eax: 0x4000_0010, // Max KVM leaf supported
        ebx: 0x4b4d_564b, // "KVMK"
        ecx: 0x564b_4d56, // "VMKV"
        edx: 0x0000_004d, // "M\0\0\0"
        ..Default::default()
    });

    const KVM_FEATURE_CLOCKSOURCE: u32 = 1 << 0;
    const KVM_FEATURE_NOP_IO_DELAY: u32 = 1 << 1;
    const KVM_FEATURE_CLOCKSOURCE2: u32 = 1 << 3;
    const KVM_FEATURE_CLOCKSOURCE_STABLE_BIT: u32 = 1 << 24;

    entries.push(kvm_cpuid_entry2 {
        function: 0x4000_0001,
        eax: KVM_FEATURE_CLOCKSOURCE
            | KVM_FEATURE_NOP_IO_DELAY
            | KVM_FEATURE_CLOCKSOURCE2
            | KVM_FEATURE_CLOCKSOURCE_STABLE_BIT,
        ..Default::default()
    });

    if tsc_khz > 0 {
        entries.push(kvm_cpuid_entry2 {
            function: 0x4000_0010,
            eax: tsc_khz,
            ..Default::default()
        });
    }

    CpuId::from_entries(&entries).map_err(|_| io::Error::from_raw_os_error(libc::E2BIG))
}
