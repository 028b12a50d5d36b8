//! Shared run-time context of a VM: flags, per-vCPU signals and pause/unpause.
//!
//! ```text
//!                    ┌─────────────────────────────┐
//!   controller ────► │ VmRuntime                   │ ◄──── vcpu-0 .. vcpu-N
//!   event thread ──► │  flags: Mutex<VmFlags>      │
//!                    │  vcpus[i]: run / unpause    │
//!                    │  completion                 │
//!                    └─────────────────────────────┘
//! ```
//!
//! The flags lock guards the VM state bits and the per-vCPU halted and done
//! arrays. It is only held to read or modify flags, never across a blocking
//! call.
//!
//! # Pause
//!
//! Pausing rendezvous on a barrier with every vCPU that is still alive. A
//! vCPU only reaches the barrier from its halted state, so a vCPU that keeps
//! running without ever executing HLT holds the pause until it does.
//!
//! Every pause starts a new epoch. A vCPU released from the barrier waits
//! until the VM is unpaused or a later pause has begun, re-checking the flags
//! after each wake, so an unpause wake that is still pending when the next
//! pause starts only sends the vCPU back to the new barrier.

use crate::hypervisor::{Hypervisor, HypervisorError, VmId};
use crate::sync::{lock, Notify, SyncError};
use bitflags::bitflags;
use log::{debug, info};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};
use thiserror::Error;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmState: u32 {
        /// The VM was restored from a migration stream.
        const RECEIVED = 1 << 0;
        const PAUSED = 1 << 1;
    }
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Hypervisor(HypervisorError),
}

/// Platform work done when the whole VM is paused or resumed.
pub trait PauseHook: Send + Sync {
    fn pause(&self);
    fn unpause(&self);
}

#[derive(Debug)]
struct VmFlags {
    state: VmState,
    halted: Vec<bool>,
    done: Vec<bool>,
    barrier: Option<Arc<Barrier>>,
    pause_epoch: u64,
    exiting: bool,
    event_done: bool,
}

/// What a vCPU needs to know at the top of its loop.
#[derive(Debug, Clone)]
pub struct VcpuSnapshot {
    pub halted: bool,
    pub paused: bool,
    pub barrier: Option<Arc<Barrier>>,
    /// Epoch of the pause in effect when the snapshot was taken.
    pub epoch: u64,
}

/// Wake-up signals owned by one vCPU.
#[derive(Debug)]
pub struct VcpuSignals {
    /// Wakes the vCPU from a halt.
    pub run: Notify,
    /// Releases the vCPU from a pause.
    pub unpause: Notify,
}

pub struct VmRuntime {
    vm_id: VmId,
    hypervisor: Arc<dyn Hypervisor>,
    hook: Arc<dyn PauseHook>,
    flags: Mutex<VmFlags>,
    vcpus: Vec<VcpuSignals>,
    completion: Notify,
}

impl VmRuntime {
    pub fn new(
        vm_id: VmId,
        ncpus: u32,
        hypervisor: Arc<dyn Hypervisor>,
        hook: Arc<dyn PauseHook>,
        state: VmState,
    ) -> Self {
        let n = ncpus as usize;
        Self {
            vm_id,
            hypervisor,
            hook,
            flags: Mutex::new(VmFlags {
                state,
                halted: vec![false; n],
                done: vec![false; n],
                barrier: None,
                pause_epoch: 0,
                exiting: false,
                event_done: false,
            }),
            vcpus: (0..n)
                .map(|_| VcpuSignals {
                    run: Notify::new("vcpu run"),
                    unpause: Notify::new("vcpu unpause"),
                })
                .collect(),
            completion: Notify::new("completion"),
        }
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    pub fn ncpus(&self) -> u32 {
        self.vcpus.len() as u32
    }

    pub fn hypervisor(&self) -> &dyn Hypervisor {
        self.hypervisor.as_ref()
    }

    pub fn signals(&self, vcpu: u32) -> &VcpuSignals {
        &self.vcpus[vcpu as usize]
    }

    fn flags(&self) -> Result<MutexGuard<'_, VmFlags>, SyncError> {
        lock(&self.flags, "vm flags")
    }

    pub fn state(&self) -> Result<VmState, SyncError> {
        Ok(self.flags()?.state)
    }

    pub fn is_paused(&self) -> Result<bool, SyncError> {
        Ok(self.state()?.contains(VmState::PAUSED))
    }

    pub fn is_exiting(&self) -> Result<bool, SyncError> {
        Ok(self.flags()?.exiting)
    }

    pub fn snapshot(&self, vcpu: u32) -> Result<VcpuSnapshot, SyncError> {
        let flags = self.flags()?;
        Ok(VcpuSnapshot {
            halted: flags.halted[vcpu as usize],
            paused: flags.state.contains(VmState::PAUSED),
            barrier: flags.barrier.clone(),
            epoch: flags.pause_epoch,
        })
    }

    /// Block a paused vCPU until the pause of `epoch` is over: the VM was
    /// unpaused, terminated or paused again.
    pub fn wait_unpause(&self, vcpu: u32, epoch: u64) -> Result<(), SyncError> {
        loop {
            {
                let flags = self.flags()?;
                if flags.exiting
                    || !flags.state.contains(VmState::PAUSED)
                    || flags.pause_epoch != epoch
                {
                    return Ok(());
                }
            }
            self.signals(vcpu).unpause.wait()?;
        }
    }

    pub fn is_halted(&self, vcpu: u32) -> Result<bool, SyncError> {
        Ok(self.flags()?.halted[vcpu as usize])
    }

    pub fn halt_vcpu(&self, vcpu: u32) -> Result<(), SyncError> {
        self.flags()?.halted[vcpu as usize] = true;
        Ok(())
    }

    pub fn unhalt_vcpu(&self, vcpu: u32) -> Result<(), SyncError> {
        self.flags()?.halted[vcpu as usize] = false;
        Ok(())
    }

    pub fn signal_run(&self, vcpu: u32) -> Result<(), SyncError> {
        self.signals(vcpu).run.notify()
    }

    /// Deliver an interrupt: have the hypervisor pull the vCPU out of the
    /// guest, then wake it if it is halted.
    pub fn interrupt_vcpu(&self, vcpu: u32, vector: u8) -> Result<(), RuntimeError> {
        self.hypervisor
            .inject_interrupt(self.vm_id, vcpu, vector)
            .map_err(RuntimeError::Hypervisor)?;
        self.unhalt_vcpu(vcpu)?;
        self.signal_run(vcpu)?;
        Ok(())
    }

    /// Record that a vCPU thread has finished and wake the controller.
    pub fn mark_done(&self, vcpu: u32) -> Result<(), SyncError> {
        let barrier = {
            let mut flags = self.flags()?;
            flags.done[vcpu as usize] = true;
            // A pause that counted this vCPU is still waiting for it.
            if flags.state.contains(VmState::PAUSED) {
                flags.barrier.clone()
            } else {
                None
            }
        };
        if let Some(barrier) = barrier {
            barrier.wait();
        }
        self.completion.notify()
    }

    pub fn mark_event_done(&self) -> Result<(), SyncError> {
        self.flags()?.event_done = true;
        self.completion.notify()
    }

    /// Indices of finished vCPUs, and whether the event thread has finished.
    pub fn finished(&self) -> Result<(Vec<u32>, bool), SyncError> {
        let flags = self.flags()?;
        let done = flags
            .done
            .iter()
            .enumerate()
            .filter(|(_, &d)| d)
            .map(|(i, _)| i as u32)
            .collect();
        Ok((done, flags.event_done))
    }

    pub fn wait_completion(&self) -> Result<(), SyncError> {
        self.completion.wait()
    }

    /// Stop the VM: terminate it in the hypervisor and release every vCPU
    /// from whatever it is waiting on so it can observe the termination.
    pub fn terminate(&self) -> Result<(), RuntimeError> {
        info!("vm {}: terminating", self.vm_id);
        let result = self.hypervisor.terminate(self.vm_id);
        {
            let mut flags = self.flags()?;
            flags.exiting = true;
            flags.state.remove(VmState::PAUSED);
            flags.halted.iter_mut().for_each(|h| *h = false);
        }
        for signals in &self.vcpus {
            signals.run.notify()?;
            signals.unpause.notify()?;
        }
        self.completion.notify()?;
        result.map_err(RuntimeError::Hypervisor)
    }

    /// Pause every vCPU.
    ///
    /// Returns `false` if the VM was already paused.
    pub fn pause(&self) -> Result<bool, SyncError> {
        let barrier = {
            let mut flags = self.flags()?;
            if flags.state.contains(VmState::PAUSED) || flags.exiting {
                return Ok(false);
            }
            let live = flags.done.iter().filter(|d| !**d).count();
            let barrier = Arc::new(Barrier::new(live + 1));
            flags.state.insert(VmState::PAUSED);
            flags.pause_epoch += 1;
            flags.barrier = Some(Arc::clone(&barrier));
            debug!("vm {}: pausing {} vcpu(s)", self.vm_id, live);
            barrier
        };

        // Halted vCPUs re-evaluate their state and meet us at the barrier.
        // One still inside wait_unpause sees the new epoch and comes back.
        for signals in &self.vcpus {
            signals.run.notify()?;
            signals.unpause.notify()?;
        }
        barrier.wait();
        self.flags()?.barrier = None;

        self.hook.pause();
        info!("vm {}: paused", self.vm_id);
        Ok(true)
    }

    /// Resume a paused VM.
    ///
    /// Returns `false` if the VM was not paused.
    pub fn unpause(&self) -> Result<bool, SyncError> {
        {
            let mut flags = self.flags()?;
            if !flags.state.contains(VmState::PAUSED) {
                return Ok(false);
            }
            flags.state.remove(VmState::PAUSED);
        }
        for signals in &self.vcpus {
            signals.unpause.notify()?;
        }
        self.hook.unpause();
        info!("vm {}: unpaused", self.vm_id);
        Ok(true)
    }

    /// Start a received VM in the paused state; [`VmRuntime::unpause`]
    /// resumes it once its state has been restored.
    pub fn set_paused(&self) -> Result<(), SyncError> {
        self.flags()?.state.insert(VmState::PAUSED);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hypervisor::mock::MockHypervisor;
    use crate::memory::MemoryRange;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    pub(crate) struct CountingHook {
        pub pauses: AtomicU32,
        pub unpauses: AtomicU32,
    }

    impl PauseHook for CountingHook {
        fn pause(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }
        fn unpause(&self) {
            self.unpauses.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runtime(ncpus: u32) -> (Arc<VmRuntime>, Arc<MockHypervisor>, Arc<CountingHook>) {
        let hv = Arc::new(MockHypervisor::new());
        let id = hv.create_for_test(ncpus, &[MemoryRange::ram(0, 0x10000)]);
        let hook = Arc::new(CountingHook::default());
        let rt = Arc::new(VmRuntime::new(
            id,
            ncpus,
            hv.clone(),
            hook.clone(),
            VmState::empty(),
        ));
        (rt, hv, hook)
    }

    /// Stand-in for a halted vCPU thread: waits the way the run loop does
    /// and counts how often it passed the barrier.
    fn parked_vcpu(rt: Arc<VmRuntime>, vcpu: u32, met: Arc<AtomicU32>) -> thread::JoinHandle<()> {
        rt.halt_vcpu(vcpu).unwrap();
        thread::spawn(move || loop {
            let snap = rt.snapshot(vcpu).unwrap();
            if rt.is_exiting().unwrap() {
                break;
            }
            if snap.halted && snap.paused {
                if let Some(b) = snap.barrier {
                    b.wait();
                    met.fetch_add(1, Ordering::SeqCst);
                }
                rt.wait_unpause(vcpu, snap.epoch).unwrap();
                continue;
            }
            rt.signals(vcpu).run.wait().unwrap();
        })
    }

    #[test]
    fn test_pause_unpause_restores_flag() {
        let (rt, _hv, hook) = runtime(2);
        let met = Arc::new(AtomicU32::new(0));
        let threads: Vec<_> = (0..2)
            .map(|i| parked_vcpu(rt.clone(), i, met.clone()))
            .collect();

        assert!(rt.pause().unwrap());
        assert!(rt.is_paused().unwrap());
        assert_eq!(met.load(Ordering::SeqCst), 2);
        assert_eq!(hook.pauses.load(Ordering::SeqCst), 1);

        assert!(rt.unpause().unwrap());
        assert!(!rt.is_paused().unwrap());
        assert_eq!(hook.unpauses.load(Ordering::SeqCst), 1);

        // Pausing again works with a fresh barrier.
        assert!(rt.pause().unwrap());
        assert_eq!(met.load(Ordering::SeqCst), 4);
        assert!(rt.unpause().unwrap());

        rt.terminate().unwrap();
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_pause_when_paused_is_noop() {
        let (rt, _hv, hook) = runtime(2);
        let met = Arc::new(AtomicU32::new(0));
        let threads: Vec<_> = (0..2)
            .map(|i| parked_vcpu(rt.clone(), i, met.clone()))
            .collect();

        assert!(rt.pause().unwrap());
        assert_eq!(met.load(Ordering::SeqCst), 2);
        let epoch = rt.snapshot(0).unwrap().epoch;

        // No new barrier, no new epoch, nobody passes a barrier again.
        assert!(!rt.pause().unwrap());
        assert!(rt.snapshot_barrier_is_none());
        assert_eq!(rt.snapshot(0).unwrap().epoch, epoch);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(met.load(Ordering::SeqCst), 2);
        assert_eq!(hook.pauses.load(Ordering::SeqCst), 1);
        assert!(rt.is_paused().unwrap());

        rt.terminate().unwrap();
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_wait_unpause_returns_on_new_epoch() {
        let (rt, _hv, _hook) = runtime(1);
        rt.set_paused().unwrap();
        let epoch = rt.snapshot(0).unwrap().epoch;

        // A leftover unpause wake alone does not release a paused vCPU.
        rt.signals(0).unpause.notify().unwrap();
        let waiter = {
            let rt = rt.clone();
            thread::spawn(move || rt.wait_unpause(0, epoch))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        {
            let mut flags = rt.flags.lock().unwrap();
            flags.pause_epoch += 1;
        }
        rt.signals(0).unpause.notify().unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_unpause_when_running_is_noop() {
        let (rt, _hv, hook) = runtime(1);
        assert!(!rt.unpause().unwrap());
        assert_eq!(hook.unpauses.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pause_skips_finished_vcpus() {
        let (rt, _hv, _hook) = runtime(2);
        rt.mark_done(1).unwrap();
        let met = Arc::new(AtomicU32::new(0));
        let t = parked_vcpu(rt.clone(), 0, met.clone());

        let start = Instant::now();
        assert!(rt.pause().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(met.load(Ordering::SeqCst), 1);

        rt.terminate().unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_terminate_clears_pause_and_halt() {
        let (rt, hv, _hook) = runtime(1);
        rt.halt_vcpu(0).unwrap();
        rt.set_paused().unwrap();
        rt.terminate().unwrap();
        assert!(hv.is_terminated());
        assert!(!rt.is_paused().unwrap());
        assert!(!rt.is_halted(0).unwrap());
        assert!(rt.is_exiting().unwrap());
    }

    #[test]
    fn test_interrupt_unhalts_and_signals() {
        let (rt, _hv, _hook) = runtime(1);
        rt.halt_vcpu(0).unwrap();
        rt.interrupt_vcpu(0, 0x20).unwrap();
        assert!(!rt.is_halted(0).unwrap());
        assert!(rt
            .signals(0)
            .run
            .wait_timeout(Duration::from_secs(1))
            .unwrap());
    }

    #[test]
    fn test_finished_reports_done_vcpus() {
        let (rt, _hv, _hook) = runtime(3);
        rt.mark_done(2).unwrap();
        rt.mark_event_done().unwrap();
        let (done, event) = rt.finished().unwrap();
        assert_eq!(done, vec![2]);
        assert!(event);
    }

    impl VmRuntime {
        fn snapshot_barrier_is_none(&self) -> bool {
            self.flags.lock().unwrap().barrier.is_none()
        }
    }
}
