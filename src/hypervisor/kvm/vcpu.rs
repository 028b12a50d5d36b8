//! KVM vCPU: register conversion, interrupt injection and the run call.
//!
//! The VM process emulates the interrupt controller in user space, so
//! interrupts reach the guest through `KVM_INTERRUPT`, and KVM is asked for an
//! interrupt-window exit while further interrupts are pending.
//!
//! A vCPU blocked in `KVM_RUN` is brought back out by sending its thread a
//! real-time signal (a "kick"); `KVM_RUN` then fails with `EINTR`, which is
//! reported as [`VmExit::None`] (or [`VmExit::Terminated`] after terminate).
//! A kick also sets `immediate_exit` in the run page first, so a thread that
//! is about to enter `KVM_RUN` when the kick lands returns at once instead of
//! waiting for the guest to exit on its own.

use super::os_error;
use crate::hypervisor::{
    seg_attr, ControlRegisters, DebugRegisters, DescriptorTable, Gprs, HypervisorError,
    InjectType, IoData, RegisterMask, Segment, VcpuRegisterState, VcpuRunParams, VmExit,
    VmParamMask, VmParamState,
};
use kvm_bindings::{
    kvm_debugregs, kvm_dtable, kvm_fpu, kvm_interrupt, kvm_msr_entry, kvm_regs, kvm_segment,
    kvm_sregs, Msrs, KVMIO,
};
use kvm_ioctls::VcpuExit as KvmVcpuExit;
use log::{debug, trace};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Mutex;
use vmm_sys_util::ioctl::ioctl_with_ref;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

ioctl_iow_nr!(KVM_INTERRUPT, KVMIO, 0x86, kvm_interrupt);

/// Model-Specific Register (MSR) indices.
mod msr {
    pub const IA32_SYSENTER_CS: u32 = 0x174;
    pub const IA32_SYSENTER_ESP: u32 = 0x175;
    pub const IA32_SYSENTER_EIP: u32 = 0x176;

    /// STAR - Segment selectors for SYSCALL/SYSRET.
    pub const STAR: u32 = 0xc000_0081;

    /// LSTAR - Long mode SYSCALL target RIP.
    pub const LSTAR: u32 = 0xc000_0082;

    /// CSTAR - Compatibility mode SYSCALL target RIP.
    pub const CSTAR: u32 = 0xc000_0083;

    /// SYSCALL_MASK - RFLAGS mask for SYSCALL.
    pub const SYSCALL_MASK: u32 = 0xc000_0084;

    /// KERNEL_GS_BASE - Swap target for SWAPGS instruction.
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;

    pub const IA32_TSC: u32 = 0x10;
    pub const IA32_MISC_ENABLE: u32 = 0x1a0;
    pub const MTRR_DEF_TYPE: u32 = 0x2ff;

    /// kvm-clock wall clock page (guest physical address).
    pub const KVM_WALL_CLOCK_NEW: u32 = 0x4b56_4d00;

    /// kvm-clock per-vCPU system time page (guest physical address | enable).
    pub const KVM_SYSTEM_TIME_NEW: u32 = 0x4b56_4d01;

    /// Bit 0 of MISC_ENABLE: Fast string operations.
    pub const MISC_ENABLE_FAST_STRING: u64 = 1;
}

/// The kick signal carries no work; interrupting `KVM_RUN` is the point.
extern "C" fn handle_kick(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {}

/// Install the kick handler. Must run before any vCPU thread is started.
pub fn register_kick_handler() -> Result<(), HypervisorError> {
    register_signal_handler(SIGRTMIN(), handle_kick)
        .map_err(|e| HypervisorError::Open(os_error(e)))
}

fn msr_entry(index: u32, data: u64) -> kvm_msr_entry {
    kvm_msr_entry {
        index,
        data,
        ..Default::default()
    }
}

fn segment_to_kvm(s: &Segment) -> kvm_segment {
    let a = s.attributes;
    kvm_segment {
        base: s.base,
        limit: s.limit,
        selector: s.selector,
        type_: (a & seg_attr::TYPE_MASK) as u8,
        present: (a & seg_attr::P != 0) as u8,
        dpl: ((a & seg_attr::DPL_MASK) >> seg_attr::DPL_SHIFT) as u8,
        db: (a & seg_attr::DB != 0) as u8,
        s: (a & seg_attr::S != 0) as u8,
        l: (a & seg_attr::L != 0) as u8,
        g: (a & seg_attr::G != 0) as u8,
        avl: (a & seg_attr::AVL != 0) as u8,
        unusable: (a & seg_attr::UNUSABLE != 0) as u8,
        padding: 0,
    }
}

fn segment_from_kvm(s: &kvm_segment) -> Segment {
    let bit = |v: u8, flag: u32| if v != 0 { flag } else { 0 };
    Segment {
        selector: s.selector,
        limit: s.limit,
        base: s.base,
        attributes: (u32::from(s.type_) & seg_attr::TYPE_MASK)
            | bit(s.s, seg_attr::S)
            | ((u32::from(s.dpl) << seg_attr::DPL_SHIFT) & seg_attr::DPL_MASK)
            | bit(s.present, seg_attr::P)
            | bit(s.avl, seg_attr::AVL)
            | bit(s.l, seg_attr::L)
            | bit(s.db, seg_attr::DB)
            | bit(s.g, seg_attr::G)
            | bit(s.unusable, seg_attr::UNUSABLE),
    }
}

fn table_to_kvm(t: &DescriptorTable) -> kvm_dtable {
    kvm_dtable {
        base: t.base,
        limit: t.limit,
        padding: [0; 3],
    }
}

fn table_from_kvm(t: &kvm_dtable) -> DescriptorTable {
    DescriptorTable {
        base: t.base,
        limit: t.limit,
    }
}

fn gprs_to_kvm(g: &Gprs) -> kvm_regs {
    kvm_regs {
        rax: g.rax,
        rbx: g.rbx,
        rcx: g.rcx,
        rdx: g.rdx,
        rsi: g.rsi,
        rdi: g.rdi,
        rsp: g.rsp,
        rbp: g.rbp,
        r8: g.r8,
        r9: g.r9,
        r10: g.r10,
        r11: g.r11,
        r12: g.r12,
        r13: g.r13,
        r14: g.r14,
        r15: g.r15,
        rip: g.rip,
        rflags: g.rflags,
    }
}

fn gprs_from_kvm(r: &kvm_regs) -> Gprs {
    Gprs {
        rax: r.rax,
        rbx: r.rbx,
        rcx: r.rcx,
        rdx: r.rdx,
        rsi: r.rsi,
        rdi: r.rdi,
        rsp: r.rsp,
        rbp: r.rbp,
        r8: r.r8,
        r9: r.r9,
        r10: r.r10,
        r11: r.r11,
        r12: r.r12,
        r13: r.r13,
        r14: r.r14,
        r15: r.r15,
        rip: r.rip,
        rflags: r.rflags,
    }
}

/// Translate a KVM exit into an owned [`VmExit`].
fn translate_exit(exit: KvmVcpuExit<'_>) -> VmExit {
    match exit {
        KvmVcpuExit::IoIn(port, data) => VmExit::IoIn {
            port,
            data: IoData::new(data.len()),
        },
        KvmVcpuExit::IoOut(port, data) => VmExit::IoOut {
            port,
            data: IoData::from_slice(data),
        },
        KvmVcpuExit::MmioRead(addr, data) => VmExit::MmioRead {
            addr,
            data: IoData::new(data.len()),
        },
        KvmVcpuExit::MmioWrite(addr, data) => VmExit::MmioWrite {
            addr,
            data: IoData::from_slice(data),
        },
        KvmVcpuExit::Hlt => VmExit::Hlt,
        KvmVcpuExit::Shutdown => VmExit::Shutdown,
        KvmVcpuExit::InternalError => VmExit::InternalError,
        KvmVcpuExit::SystemEvent(event, _) => VmExit::SystemEvent(event),
        KvmVcpuExit::FailEntry(reason, _) => VmExit::FailEntry(reason),
        // The loop recomputes injection after every exit.
        KvmVcpuExit::IrqWindowOpen | KvmVcpuExit::Intr => VmExit::None,
        KvmVcpuExit::Hypercall(_) => VmExit::Unknown("Hypercall"),
        KvmVcpuExit::Debug(_) => VmExit::Unknown("Debug"),
        KvmVcpuExit::Exception => VmExit::Unknown("Exception"),
        KvmVcpuExit::Nmi => VmExit::Unknown("Nmi"),
        _ => VmExit::Unknown("Other"),
    }
}

/// A KVM vCPU shared between its run thread and the controller.
pub struct KvmVcpu {
    index: u32,
    fd: Mutex<kvm_ioctls::VcpuFd>,
    /// The vCPU's `kvm_run` page, written by kickers without taking `fd`.
    kvm_run: AtomicPtr<kvm_bindings::kvm_run>,
    /// Thread currently inside `KVM_RUN`, if any.
    running: Mutex<Option<libc::pthread_t>>,
}

impl KvmVcpu {
    pub fn new(index: u32, mut fd: kvm_ioctls::VcpuFd) -> Self {
        let kvm_run: *mut kvm_bindings::kvm_run = fd.get_kvm_run();
        Self {
            index,
            fd: Mutex::new(fd),
            kvm_run: AtomicPtr::new(kvm_run),
            running: Mutex::new(None),
        }
    }

    fn fd(&self) -> Result<std::sync::MutexGuard<'_, kvm_ioctls::VcpuFd>, HypervisorError> {
        self.fd.lock().map_err(|_| HypervisorError::Poisoned(self.index))
    }

    /// Reset to power-on MSR and FPU defaults, then load `regs`.
    pub fn reset(&self, regs: &VcpuRegisterState) -> Result<(), HypervisorError> {
        let reset_err = |source| HypervisorError::ResetVcpu {
            vcpu: self.index,
            source,
        };
        {
            let fd = self.fd()?;
            let entries = [
                msr_entry(msr::IA32_SYSENTER_CS, 0),
                msr_entry(msr::IA32_SYSENTER_ESP, 0),
                msr_entry(msr::IA32_SYSENTER_EIP, 0),
                msr_entry(msr::IA32_TSC, 0),
                msr_entry(msr::MTRR_DEF_TYPE, (1 << 11) | 6),
            ];
            let msrs = Msrs::from_entries(&entries)
                .map_err(|_| reset_err(io::Error::from_raw_os_error(libc::EINVAL)))?;
            fd.set_msrs(&msrs).map_err(|e| reset_err(os_error(e)))?;

            let fpu = kvm_fpu {
                fcw: 0x37f,    // x87: all exceptions masked, double precision
                mxcsr: 0x1f80, // SSE: all exceptions masked, round to nearest
                ..Default::default()
            };
            fd.set_fpu(&fpu).map_err(|e| reset_err(os_error(e)))?;
        }
        self.write_registers(RegisterMask::ALL, regs)
            .map_err(|e| match e {
                HypervisorError::WriteRegisters { vcpu, source } => {
                    HypervisorError::ResetVcpu { vcpu, source }
                }
                other => other,
            })
    }

    pub fn read_registers(&self, mask: RegisterMask) -> Result<VcpuRegisterState, HypervisorError> {
        let read_err = |e: kvm_ioctls::Error| HypervisorError::ReadRegisters {
            vcpu: self.index,
            source: os_error(e),
        };
        let fd = self.fd()?;
        let mut state = VcpuRegisterState::default();

        if mask.contains(RegisterMask::GPRS) {
            state.gprs = gprs_from_kvm(&fd.get_regs().map_err(read_err)?);
        }

        if mask.intersects(RegisterMask::SREGS | RegisterMask::CRS | RegisterMask::MSRS) {
            let sregs = fd.get_sregs().map_err(read_err)?;
            if mask.contains(RegisterMask::SREGS) {
                let seg = &mut state.segments;
                seg.cs = segment_from_kvm(&sregs.cs);
                seg.ds = segment_from_kvm(&sregs.ds);
                seg.es = segment_from_kvm(&sregs.es);
                seg.fs = segment_from_kvm(&sregs.fs);
                seg.gs = segment_from_kvm(&sregs.gs);
                seg.ss = segment_from_kvm(&sregs.ss);
                seg.ldtr = segment_from_kvm(&sregs.ldt);
                seg.tr = segment_from_kvm(&sregs.tr);
                state.gdtr = table_from_kvm(&sregs.gdt);
                state.idtr = table_from_kvm(&sregs.idt);
            }
            if mask.contains(RegisterMask::CRS) {
                state.crs = ControlRegisters {
                    cr0: sregs.cr0,
                    cr2: sregs.cr2,
                    cr3: sregs.cr3,
                    cr4: sregs.cr4,
                    cr8: sregs.cr8,
                };
            }
            if mask.contains(RegisterMask::MSRS) {
                state.msrs.efer = sregs.efer;
                state.msrs.apic_base = sregs.apic_base;
            }
        }

        if mask.contains(RegisterMask::MSRS) {
            let mut msrs = Msrs::from_entries(&[
                msr_entry(msr::STAR, 0),
                msr_entry(msr::LSTAR, 0),
                msr_entry(msr::CSTAR, 0),
                msr_entry(msr::SYSCALL_MASK, 0),
                msr_entry(msr::KERNEL_GS_BASE, 0),
                msr_entry(msr::IA32_MISC_ENABLE, 0),
            ])
            .map_err(|_| HypervisorError::ReadRegisters {
                vcpu: self.index,
                source: io::Error::from_raw_os_error(libc::EINVAL),
            })?;
            fd.get_msrs(&mut msrs).map_err(read_err)?;
            for entry in msrs.as_slice() {
                let m = &mut state.msrs;
                match entry.index {
                    msr::STAR => m.star = entry.data,
                    msr::LSTAR => m.lstar = entry.data,
                    msr::CSTAR => m.cstar = entry.data,
                    msr::SYSCALL_MASK => m.sfmask = entry.data,
                    msr::KERNEL_GS_BASE => m.kernel_gs_base = entry.data,
                    msr::IA32_MISC_ENABLE => m.misc_enable = entry.data,
                    _ => {}
                }
            }
        }

        if mask.contains(RegisterMask::DRS) {
            let dr = fd.get_debug_regs().map_err(read_err)?;
            state.drs = DebugRegisters {
                dr0: dr.db[0],
                dr1: dr.db[1],
                dr2: dr.db[2],
                dr3: dr.db[3],
                dr6: dr.dr6,
                dr7: dr.dr7,
            };
        }

        Ok(state)
    }

    pub fn write_registers(
        &self,
        mask: RegisterMask,
        state: &VcpuRegisterState,
    ) -> Result<(), HypervisorError> {
        let write_err = |e: kvm_ioctls::Error| HypervisorError::WriteRegisters {
            vcpu: self.index,
            source: os_error(e),
        };
        let fd = self.fd()?;

        if mask.contains(RegisterMask::GPRS) {
            fd.set_regs(&gprs_to_kvm(&state.gprs)).map_err(write_err)?;
        }

        if mask.intersects(RegisterMask::SREGS | RegisterMask::CRS | RegisterMask::MSRS) {
            let mut sregs: kvm_sregs = fd.get_sregs().map_err(write_err)?;
            if mask.contains(RegisterMask::SREGS) {
                let seg = &state.segments;
                sregs.cs = segment_to_kvm(&seg.cs);
                sregs.ds = segment_to_kvm(&seg.ds);
                sregs.es = segment_to_kvm(&seg.es);
                sregs.fs = segment_to_kvm(&seg.fs);
                sregs.gs = segment_to_kvm(&seg.gs);
                sregs.ss = segment_to_kvm(&seg.ss);
                sregs.ldt = segment_to_kvm(&seg.ldtr);
                sregs.tr = segment_to_kvm(&seg.tr);
                sregs.gdt = table_to_kvm(&state.gdtr);
                sregs.idt = table_to_kvm(&state.idtr);
            }
            if mask.contains(RegisterMask::CRS) {
                sregs.cr0 = state.crs.cr0;
                sregs.cr2 = state.crs.cr2;
                sregs.cr3 = state.crs.cr3;
                sregs.cr4 = state.crs.cr4;
                sregs.cr8 = state.crs.cr8;
            }
            if mask.contains(RegisterMask::MSRS) {
                sregs.efer = state.msrs.efer;
                // Zero means "keep the kernel's reset value".
                if state.msrs.apic_base != 0 {
                    sregs.apic_base = state.msrs.apic_base;
                }
            }
            fd.set_sregs(&sregs).map_err(write_err)?;
        }

        if mask.contains(RegisterMask::MSRS) {
            let m = &state.msrs;
            let mut entries = vec![
                msr_entry(msr::STAR, m.star),
                msr_entry(msr::LSTAR, m.lstar),
                msr_entry(msr::CSTAR, m.cstar),
                msr_entry(msr::SYSCALL_MASK, m.sfmask),
                msr_entry(msr::KERNEL_GS_BASE, m.kernel_gs_base),
            ];
            let misc = if m.misc_enable == 0 {
                msr::MISC_ENABLE_FAST_STRING
            } else {
                m.misc_enable
            };
            entries.push(msr_entry(msr::IA32_MISC_ENABLE, misc));
            let msrs = Msrs::from_entries(&entries).map_err(|_| HypervisorError::WriteRegisters {
                vcpu: self.index,
                source: io::Error::from_raw_os_error(libc::EINVAL),
            })?;
            fd.set_msrs(&msrs).map_err(write_err)?;
        }

        if mask.contains(RegisterMask::DRS) {
            let d = &state.drs;
            let dr = kvm_debugregs {
                db: [d.dr0, d.dr1, d.dr2, d.dr3],
                dr6: d.dr6,
                dr7: d.dr7,
                ..Default::default()
            };
            fd.set_debug_regs(&dr).map_err(write_err)?;
        }

        Ok(())
    }

    pub fn read_vm_params(&self, mask: VmParamMask) -> Result<VmParamState, HypervisorError> {
        let read_err = |source| HypervisorError::ReadVmParams {
            vcpu: self.index,
            source,
        };
        let fd = self.fd()?;
        let mut msrs = Msrs::from_entries(&[
            msr_entry(msr::KVM_SYSTEM_TIME_NEW, 0),
            msr_entry(msr::KVM_WALL_CLOCK_NEW, 0),
            msr_entry(msr::IA32_TSC, 0),
        ])
        .map_err(|_| read_err(io::Error::from_raw_os_error(libc::EINVAL)))?;
        fd.get_msrs(&mut msrs).map_err(|e| read_err(os_error(e)))?;

        let mut all = VmParamState::default();
        for entry in msrs.as_slice() {
            match entry.index {
                msr::KVM_SYSTEM_TIME_NEW => all.pvclock_system_gpa = entry.data,
                msr::KVM_WALL_CLOCK_NEW => all.pvclock_wall_clock_gpa = entry.data,
                msr::IA32_TSC => all.tsc = entry.data,
                _ => {}
            }
        }
        let mut state = VmParamState::default();
        state.merge(mask, &all);
        Ok(state)
    }

    pub fn write_vm_params(
        &self,
        mask: VmParamMask,
        params: &VmParamState,
    ) -> Result<(), HypervisorError> {
        let write_err = |source| HypervisorError::WriteVmParams {
            vcpu: self.index,
            source,
        };
        let mut entries = Vec::new();
        if mask.contains(VmParamMask::PVCLOCK_SYSTEM_TIME) {
            entries.push(msr_entry(msr::KVM_SYSTEM_TIME_NEW, params.pvclock_system_gpa));
        }
        if mask.contains(VmParamMask::PVCLOCK_WALL_CLOCK) && params.pvclock_wall_clock_gpa != 0 {
            entries.push(msr_entry(msr::KVM_WALL_CLOCK_NEW, params.pvclock_wall_clock_gpa));
        }
        if mask.contains(VmParamMask::TSC) {
            entries.push(msr_entry(msr::IA32_TSC, params.tsc));
        }
        if entries.is_empty() {
            return Ok(());
        }
        let msrs = Msrs::from_entries(&entries)
            .map_err(|_| write_err(io::Error::from_raw_os_error(libc::EINVAL)))?;
        self.fd()?
            .set_msrs(&msrs)
            .map_err(|e| write_err(os_error(e)))?;
        Ok(())
    }

    /// Hand read data from the previous exit back to the guest.
    fn complete_exit(fd: &mut kvm_ioctls::VcpuFd, exit: &VmExit) {
        match exit {
            VmExit::IoIn { data, .. } => {
                let run = fd.get_kvm_run();
                // SAFETY: the last exit was KVM_EXIT_IO, so `io` is the live
                // union member and data_offset points inside the run mapping.
                unsafe {
                    let io = run.__bindgen_anon_1.io;
                    let len = (io.size as usize * io.count as usize).min(data.len());
                    let base = (run as *mut kvm_bindings::kvm_run).cast::<u8>();
                    std::ptr::copy_nonoverlapping(
                        data.as_slice().as_ptr(),
                        base.add(io.data_offset as usize),
                        len,
                    );
                }
            }
            VmExit::MmioRead { data, .. } => {
                let run = fd.get_kvm_run();
                // SAFETY: the last exit was KVM_EXIT_MMIO.
                unsafe {
                    let mmio = &mut run.__bindgen_anon_1.mmio;
                    let len = (mmio.len as usize).min(data.len());
                    mmio.data[..len].copy_from_slice(&data.as_slice()[..len]);
                }
            }
            _ => {}
        }
    }

    fn inject(&self, fd: &kvm_ioctls::VcpuFd, vector: u8) -> Result<(), HypervisorError> {
        let irq = kvm_interrupt {
            irq: u32::from(vector),
        };
        // SAFETY: KVM_INTERRUPT reads a kvm_interrupt we own for the call.
        let ret = unsafe { ioctl_with_ref(fd, KVM_INTERRUPT(), &irq) };
        if ret < 0 {
            return Err(HypervisorError::InjectInterrupt {
                vcpu: self.index,
                source: io::Error::last_os_error(),
            });
        }
        trace!("vcpu{}: injected vector {:#x}", self.index, vector);
        Ok(())
    }

    fn set_running(&self, thread: Option<libc::pthread_t>) -> Result<(), HypervisorError> {
        *self
            .running
            .lock()
            .map_err(|_| HypervisorError::Poisoned(self.index))? = thread;
        Ok(())
    }

    /// Interrupt `KVM_RUN` if this vCPU is inside it, and make the next
    /// entry return at once if it is not.
    pub fn kick(&self) -> Result<(), HypervisorError> {
        let run = self.kvm_run.load(Ordering::Acquire);
        // SAFETY: the run page is mapped for as long as the vCPU fd lives,
        // and `self` owns that fd. KVM reads the byte on entry.
        unsafe { std::ptr::addr_of_mut!((*run).immediate_exit).write_volatile(1) };

        // Taken after the write: a thread that publishes itself as running
        // later is guaranteed to see immediate_exit set.
        let running = self
            .running
            .lock()
            .map_err(|_| HypervisorError::Poisoned(self.index))?;
        if let Some(thread) = *running {
            // SAFETY: the thread is alive while it is recorded as running.
            let ret = unsafe { libc::pthread_kill(thread, SIGRTMIN()) };
            if ret != 0 {
                return Err(HypervisorError::InjectInterrupt {
                    vcpu: self.index,
                    source: io::Error::from_raw_os_error(ret),
                });
            }
        }
        Ok(())
    }

    pub fn run(
        &self,
        params: &mut VcpuRunParams,
        terminated: &AtomicBool,
    ) -> Result<(), HypervisorError> {
        let mut fd = self.fd()?;

        Self::complete_exit(&mut fd, &params.exit);
        if let InjectType::Intr(vector) = params.inject {
            self.inject(&fd, vector)?;
        }
        fd.get_kvm_run().request_interrupt_window = u8::from(params.intr_pending);

        if terminated.load(Ordering::Acquire) {
            params.exit = VmExit::Terminated;
            return Ok(());
        }

        // SAFETY: pthread_self has no preconditions.
        self.set_running(Some(unsafe { libc::pthread_self() }))?;
        let result = fd.run().map(translate_exit);
        fd.set_kvm_immediate_exit(0);
        self.set_running(None)?;

        params.irq_ready = fd.get_kvm_run().ready_for_interrupt_injection != 0;
        params.exit = match result {
            Ok(exit) => exit,
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                debug!("vcpu{}: run interrupted", self.index);
                VmExit::None
            }
            Err(e) => {
                return Err(HypervisorError::Run {
                    vcpu: self.index,
                    source: os_error(e),
                })
            }
        };
        if terminated.load(Ordering::Acquire) {
            params.exit = VmExit::Terminated;
        }
        Ok(())
    }
}
