//! Per-vCPU run loop.
//!
//! Each vCPU runs on its own thread:
//!
//! ```text
//!            ┌──────────── interrupt / unhalt ───────────┐
//!            ▼                                           │
//!   ┌──────────┐   run signal    ┌──────────┐   HLT   ┌──────────┐
//!   │ Runnable │ ◄────────────── │  Halted  │ ◄────── │ (guest)  │
//!   └──────────┘                 └──────────┘         └──────────┘
//!        │                            │ paused
//!        │ terminated / error         ▼
//!        ▼                       ┌──────────┐
//!   ┌──────────┐                 │  Paused  │ barrier, then unpause signal
//!   │  Exited  │                 └──────────┘
//!   └──────────┘
//! ```
//!
//! Exits that need user-space help are handed to an [`ExitHandler`]; pending
//! guest interrupts come from an [`InterruptSource`]. Both are implemented by
//! device emulation in the VM process and by small fakes in tests.

use crate::hypervisor::{HypervisorError, InjectType, VcpuRunParams, VmExit};
use crate::sync::SyncError;
use crate::vm::runtime::{RuntimeError, VmRuntime};
use log::{debug, error, trace};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VcpuError {
    #[error("Failed to run vCPU: {0}")]
    Run(#[from] HypervisorError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Guest triple fault")]
    TripleFault,

    #[error("Failed to enter guest (hardware reason {0:#x})")]
    FailEntry(u64),

    #[error("Hypervisor internal error")]
    InternalError,

    #[error("Unhandled exit: {0}")]
    UnhandledExit(String),

    #[error("Device emulation failed: {0}")]
    Device(String),
}

impl From<RuntimeError> for VcpuError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Sync(e) => VcpuError::Sync(e),
            RuntimeError::Hypervisor(e) => VcpuError::Run(e),
        }
    }
}

impl VcpuError {
    /// Errno-style exit status of the vCPU thread.
    pub fn status(&self) -> i32 {
        match self {
            VcpuError::Run(e) => e.errno().unwrap_or(libc::EIO),
            VcpuError::Sync(_) => libc::EDEADLK,
            _ => libc::EIO,
        }
    }
}

/// Handles the exits the hypervisor could not complete on its own.
///
/// For an I/O or MMIO read, the handler fills the data in `params.exit`; it
/// is handed back to the hypervisor on the next run.
pub trait ExitHandler: Send + Sync {
    fn handle_exit(&self, runtime: &VmRuntime, params: &mut VcpuRunParams)
        -> Result<(), VcpuError>;
}

/// Source of external interrupts for a vCPU.
pub trait InterruptSource: Send + Sync {
    fn pending(&self, vcpu: u32) -> bool;

    /// Acknowledge the highest-priority pending interrupt and return its
    /// vector.
    fn acknowledge(&self, vcpu: u32) -> Option<u8>;
}

pub struct VcpuRunLoop {
    runtime: Arc<VmRuntime>,
    params: VcpuRunParams,
    exits: Arc<dyn ExitHandler>,
    interrupts: Arc<dyn InterruptSource>,
}

impl VcpuRunLoop {
    pub fn new(
        runtime: Arc<VmRuntime>,
        vcpu: u32,
        exits: Arc<dyn ExitHandler>,
        interrupts: Arc<dyn InterruptSource>,
    ) -> Self {
        let params = VcpuRunParams::new(runtime.vm_id(), vcpu);
        Self {
            runtime,
            params,
            exits,
            interrupts,
        }
    }

    /// Run the vCPU until the VM terminates or an exit cannot be handled.
    ///
    /// The vCPU is always marked done on return, whatever the outcome.
    pub fn run(mut self) -> Result<(), VcpuError> {
        let id = self.params.vcpu_id;
        let result = self.run_loop();
        match &result {
            Ok(()) => debug!("vcpu{}: exited", id),
            Err(e) => error!("vcpu{}: {}", id, e),
        }
        if let Err(e) = self.runtime.mark_done(id) {
            error!("vcpu{}: failed to report completion: {}", id, e);
        }
        result
    }

    fn run_loop(&mut self) -> Result<(), VcpuError> {
        let id = self.params.vcpu_id;
        let runtime = Arc::clone(&self.runtime);
        let signals = runtime.signals(id);

        loop {
            let snap = runtime.snapshot(id)?;

            if snap.halted && snap.paused {
                if let Some(barrier) = snap.barrier {
                    barrier.wait();
                }
                trace!("vcpu{}: paused", id);
                runtime.wait_unpause(id, snap.epoch)?;
                continue;
            }

            if snap.halted {
                signals.run.wait()?;
                // Woken by a pause; meet the barrier first.
                if runtime.is_paused()? {
                    continue;
                }
            }

            let pending = self.interrupts.pending(id);
            self.params.inject = match self.params.irq_ready && pending {
                true => self
                    .interrupts
                    .acknowledge(id)
                    .map_or(InjectType::None, InjectType::Intr),
                false => InjectType::None,
            };
            self.params.intr_pending = self.interrupts.pending(id);

            runtime.hypervisor().run(&mut self.params)?;

            match self.params.exit {
                VmExit::Terminated => return Ok(()),
                VmExit::None => {}
                _ => self.exits.handle_exit(&runtime, &mut self.params)?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::MockHypervisor;
    use crate::memory::MemoryRange;
    use crate::vm::runtime::tests::CountingHook;
    use crate::vm::runtime::VmState;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    /// One interrupt line that delivers `vector` once raised.
    #[derive(Default)]
    struct Line {
        raised: Mutex<Option<u8>>,
    }

    impl InterruptSource for Line {
        fn pending(&self, vcpu: u32) -> bool {
            vcpu == 0 && self.raised.lock().unwrap().is_some()
        }

        fn acknowledge(&self, _vcpu: u32) -> Option<u8> {
            self.raised.lock().unwrap().take()
        }
    }

    /// HLT halts unless an interrupt is pending; SHUTDOWN is fatal.
    struct Exits {
        line: Arc<Line>,
    }

    impl ExitHandler for Exits {
        fn handle_exit(
            &self,
            runtime: &VmRuntime,
            params: &mut VcpuRunParams,
        ) -> Result<(), VcpuError> {
            match params.exit {
                VmExit::Hlt => {
                    if !self.line.pending(params.vcpu_id) {
                        runtime.halt_vcpu(params.vcpu_id)?;
                    }
                    Ok(())
                }
                VmExit::Shutdown => Err(VcpuError::TripleFault),
                _ => Ok(()),
            }
        }
    }

    fn setup(ncpus: u32) -> (Arc<VmRuntime>, Arc<MockHypervisor>, Arc<Line>) {
        let hv = Arc::new(MockHypervisor::new());
        let id = hv.create_for_test(ncpus, &[MemoryRange::ram(0, 0x10000)]);
        let rt = Arc::new(VmRuntime::new(
            id,
            ncpus,
            hv.clone(),
            Arc::new(CountingHook::default()),
            VmState::empty(),
        ));
        (rt, hv, Arc::new(Line::default()))
    }

    fn spawn(
        rt: &Arc<VmRuntime>,
        vcpu: u32,
        line: &Arc<Line>,
    ) -> thread::JoinHandle<Result<(), VcpuError>> {
        let run_loop = VcpuRunLoop::new(
            rt.clone(),
            vcpu,
            Arc::new(Exits { line: line.clone() }),
            line.clone(),
        );
        thread::spawn(move || run_loop.run())
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_interrupt_wakes_halted_vcpu_once() {
        let (rt, hv, line) = setup(1);
        let t = spawn(&rt, 0, &line);

        assert!(wait_until(|| rt.is_halted(0).unwrap()));
        assert_eq!(hv.runs(0), vec![InjectType::None]);

        *line.raised.lock().unwrap() = Some(0x30);
        rt.interrupt_vcpu(0, 0x30).unwrap();

        assert!(hv.wait_for_runs(0, 2, Duration::from_secs(5)));
        assert!(wait_until(|| rt.is_halted(0).unwrap()));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hv.runs(0), vec![InjectType::None, InjectType::Intr(0x30)]);

        rt.terminate().unwrap();
        t.join().unwrap().unwrap();
        let intrs = hv
            .runs(0)
            .into_iter()
            .filter(|i| *i == InjectType::Intr(0x30))
            .count();
        assert_eq!(intrs, 1);
        assert_eq!(rt.finished().unwrap().0, vec![0]);
    }

    #[test]
    fn test_pending_interrupt_skips_halt() {
        let (rt, hv, line) = setup(1);
        // Raised before the first HLT: the vCPU never halts and the vector
        // is injected on the next entry.
        *line.raised.lock().unwrap() = Some(0x21);
        let t = spawn(&rt, 0, &line);

        assert!(hv.wait_for_runs(0, 2, Duration::from_secs(5)));
        assert_eq!(&hv.runs(0)[..2], &[InjectType::None, InjectType::Intr(0x21)]);

        rt.terminate().unwrap();
        t.join().unwrap().unwrap();
    }

    #[test]
    fn test_exit_error_ends_thread_with_status() {
        let (rt, hv, line) = setup(1);
        hv.push_exits(0, [VmExit::Shutdown]);
        let t = spawn(&rt, 0, &line);

        let err = t.join().unwrap().unwrap_err();
        assert!(matches!(err, VcpuError::TripleFault));
        assert_eq!(err.status(), libc::EIO);
        assert_eq!(rt.finished().unwrap().0, vec![0]);
    }

    #[test]
    fn test_paused_vcpus_meet_barrier_and_resume() {
        let (rt, hv, line) = setup(2);
        let threads: Vec<_> = (0..2).map(|i| spawn(&rt, i, &line)).collect();
        assert!(wait_until(|| rt.is_halted(0).unwrap() && rt.is_halted(1).unwrap()));

        assert!(rt.pause().unwrap());
        let runs_paused = (hv.runs(0).len(), hv.runs(1).len());

        // An interrupt while paused must not run the guest.
        *line.raised.lock().unwrap() = Some(0x30);
        rt.interrupt_vcpu(0, 0x30).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hv.runs(0).len(), runs_paused.0);

        assert!(rt.unpause().unwrap());
        assert!(hv.wait_for_runs(0, runs_paused.0 + 1, Duration::from_secs(5)));
        assert!(hv.runs(0).contains(&InjectType::Intr(0x30)));

        rt.terminate().unwrap();
        for t in threads {
            t.join().unwrap().unwrap();
        }
        assert_eq!(rt.finished().unwrap().0, vec![0, 1]);
    }

    #[test]
    fn test_back_to_back_pause_unpause_does_not_hang() {
        let (rt, _hv, line) = setup(2);
        let threads: Vec<_> = (0..2).map(|i| spawn(&rt, i, &line)).collect();
        assert!(wait_until(|| rt.is_halted(0).unwrap() && rt.is_halted(1).unwrap()));

        let (tx, rx) = std::sync::mpsc::channel();
        let cycler = {
            let rt = rt.clone();
            thread::spawn(move || {
                for i in 0..2000u32 {
                    assert!(rt.pause().unwrap());
                    assert!(rt.unpause().unwrap());
                    if tx.send(i).is_err() {
                        return;
                    }
                }
            })
        };
        for i in 0..2000u32 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(i));
        }
        cycler.join().unwrap();

        rt.terminate().unwrap();
        for t in threads {
            t.join().unwrap().unwrap();
        }
    }
}
