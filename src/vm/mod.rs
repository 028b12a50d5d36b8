//! VM lifecycle: creation, launch and the controller loop.
//!
//! ```text
//!  validate ─► allocate memory ─► create in kernel ─► SEV launch start
//!      ─► report id to parent ─► boot image or restore ─► devices
//!      ─► reset vCPUs ─► SEV activate + encrypt ─► spawn vcpu-N + event
//!      ─► wait for completion ─► SEV shutdown
//! ```
//!
//! The controller thread (the caller of [`Vm::start`]) blocks on the
//! runtime's completion signal and joins vCPU threads as they finish. The
//! VM is done once every vCPU thread has been joined; the result is the
//! first vCPU failure, if any. An event thread that exits while vCPUs are
//! still running is fatal: the VM is terminated and the error returned.

mod event;
pub mod runtime;

pub use event::{EventError, EventLoop};

use crate::boot::{BootError, BootLoader};
use crate::config::{ConfigError, VmConfig};
use crate::control::{ControlChannel, ControlError, Reply};
use crate::devices::pipe::{device_pipe, PipeError, PipeReceiver};
use crate::devices::Devices;
use crate::hypervisor::{
    CreateParams, Hypervisor, HypervisorError, RegisterMask, VcpuRegisterState, VmParamState,
};
use crate::memory::{GuestMemory, MemoryError};
use crate::migration::{self, DumpHeader, MigrationError};
use crate::sev::{ConfidentialCompute, SevError};
use crate::sync::SyncError;
use crate::vcpu::{VcpuError, VcpuRunLoop};
use log::{debug, error, info, warn};
use runtime::{RuntimeError, VmRuntime, VmState};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

#[derive(Error, Debug)]
pub enum VmError {
    #[error("Invalid VM configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),

    #[error("Failed to allocate guest memory: {0}")]
    ResourceExhaustion(#[source] MemoryError),

    #[error("Hypervisor rejected the VM: {0}")]
    KernelDenied(#[source] HypervisorError),

    #[error("Confidential compute setup failed: {0}")]
    ConfidentialCompute(#[from] SevError),

    #[error(transparent)]
    Synchronization(#[from] SyncError),

    #[error("Migration failed: {0}")]
    Io(#[from] MigrationError),

    #[error("Control channel failed: {0}")]
    Protocol(#[from] ControlError),

    #[error("Failed to load boot image: {0}")]
    Boot(#[from] BootError),

    #[error("Failed to set up device pipe: {0}")]
    DevicePipe(#[from] PipeError),

    #[error("Failed to set up VM thread: {0}")]
    Thread(#[source] io::Error),

    #[error("Failed to open {what}: {source}")]
    Open {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("vCPU {index} failed: {source}")]
    Vcpu {
        index: u32,
        #[source]
        source: VcpuError,
    },

    #[error("vCPU {0} thread panicked")]
    VcpuPanicked(u32),

    #[error("Event thread exited unexpectedly: {0}")]
    EventThread(#[source] EventError),
}

impl From<RuntimeError> for VmError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Sync(e) => VmError::Synchronization(e),
            RuntimeError::Hypervisor(e) => VmError::KernelDenied(e),
        }
    }
}

impl VmError {
    /// Errno-style exit status of the VM process.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::ConfigInvalid(_) => libc::EINVAL,
            VmError::ResourceExhaustion(_) => libc::ENOMEM,
            VmError::KernelDenied(e) => e.errno().unwrap_or(libc::EIO),
            VmError::Synchronization(_) => libc::EDEADLK,
            VmError::Protocol(e) | VmError::EventThread(EventError::Control(e))
                if e.is_protocol() =>
            {
                libc::EPROTO
            }
            VmError::Thread(e) => e.raw_os_error().unwrap_or(libc::EAGAIN),
            VmError::Vcpu { source, .. } => source.status(),
            _ => libc::EIO,
        }
    }
}

/// Where the initial guest state comes from.
pub enum Boot<'a> {
    /// Load a boot image into fresh memory.
    Image(&'a dyn BootLoader),
    /// Restore a VM from a migration stream.
    Received(&'a mut dyn Read),
}

/// Initial vCPU state handed to [`run_vm`].
struct Launch {
    /// One register set per vCPU.
    regs: Vec<VcpuRegisterState>,
    /// VM parameters of a received VM.
    params: Option<Vec<VmParamState>>,
}

/// One VM process.
pub struct Vm {
    config: VmConfig,
    hypervisor: Arc<dyn Hypervisor>,
    control: ControlChannel,
    console: Box<dyn Write + Send>,
    cc: ConfidentialCompute,
}

impl Vm {
    pub fn new(
        config: VmConfig,
        hypervisor: Arc<dyn Hypervisor>,
        control: ControlChannel,
        console: Box<dyn Write + Send>,
        cc: ConfidentialCompute,
    ) -> Self {
        Self {
            config,
            hypervisor,
            control,
            console,
            cc,
        }
    }

    /// Create the VM, run it to completion and tear it down.
    ///
    /// For a received VM the CPU count and memory layout come from the
    /// migration header, not from the configuration.
    pub fn start(mut self, mut boot: Boot<'_>) -> Result<(), VmError> {
        if let Boot::Received(r) = &mut boot {
            let header = DumpHeader::read_from(r)?;
            debug!(
                "received header: {} vcpu(s), {} memory range(s)",
                header.ncpus,
                header.ranges.len()
            );
            self.config.ncpus = header.ncpus;
            self.config.memory = header.ranges;
        }
        let received = matches!(boot, Boot::Received(_));

        self.config.validate()?;
        if self.config.sev && !self.cc.is_enabled() {
            return Err(ConfigError::NoPsp.into());
        }
        let ncpus = self.config.ncpus;

        let mut memory =
            GuestMemory::allocate(&self.config.memory).map_err(VmError::ResourceExhaustion)?;

        let created = match self.hypervisor.create(&CreateParams {
            name: self.config.name.clone(),
            ncpus,
            memory: memory.ranges().to_vec(),
            sev: self.config.sev,
        }) {
            Ok(created) => created,
            Err(e) => {
                let result = e.errno().unwrap_or(libc::EIO);
                if let Err(e) = self.control.send(0, Reply::Created { vm_id: 0, result }) {
                    warn!("{}: {}", self.config.name, e);
                }
                return Err(VmError::KernelDenied(e));
            }
        };
        let vm_id = created.id;

        // A received VM is handed over from another process; give its RAM
        // fresh addresses in this one.
        if received {
            memory
                .remap(self.hypervisor.as_ref(), vm_id)
                .map_err(VmError::ResourceExhaustion)?;
        }

        self.cc.init()?;
        self.control.send(0, Reply::Created { vm_id, result: 0 })?;
        info!(
            "vm {} ({}): created with {} vcpu(s) and {} MiB",
            vm_id,
            self.config.name,
            ncpus,
            memory.ram_size() >> 20
        );

        let regs = match &mut boot {
            Boot::Received(r) => {
                let regs = migration::read_registers(r, ncpus)?;
                migration::restore_memory(r, &memory)?;
                regs
            }
            Boot::Image(loader) => vec![loader.load(&memory)?; ncpus as usize],
        };

        let (pipe_tx, pipe_rx) = device_pipe()?;
        let devices = Arc::new(Devices::new(self.console, pipe_tx, self.config.nics));
        let state = match received {
            true => VmState::RECEIVED | VmState::PAUSED,
            false => VmState::empty(),
        };
        let runtime = Arc::new(VmRuntime::new(
            vm_id,
            ncpus,
            Arc::clone(&self.hypervisor),
            devices.clone(),
            state,
        ));

        let params = match &mut boot {
            Boot::Received(r) => {
                migration::restore_devices(r, devices.as_ref())?;
                Some(migration::read_vm_params(r, ncpus)?)
            }
            Boot::Image(_) => None,
        };

        let memory = Arc::new(memory);
        let result = run_vm(
            &runtime,
            &devices,
            &memory,
            &mut self.cc,
            &created.asids,
            Launch { regs, params },
            self.control,
            pipe_rx,
        );

        if let Err(e) = self.cc.shutdown() {
            warn!("vm {}: could not shut down SEV guest: {}", vm_id, e);
        }
        match &result {
            Ok(()) => info!("vm {}: stopped", vm_id),
            Err(e) => error!("vm {}: {}", vm_id, e),
        }
        result
    }
}

/// Reset and launch every vCPU, then wait for the VM to finish.
#[allow(clippy::too_many_arguments)]
fn run_vm(
    runtime: &Arc<VmRuntime>,
    devices: &Arc<Devices>,
    memory: &Arc<GuestMemory>,
    cc: &mut ConfidentialCompute,
    asids: &[u32],
    launch: Launch,
    control: ControlChannel,
    pipe: PipeReceiver,
) -> Result<(), VmError> {
    let hv = runtime.hypervisor();
    let vm = runtime.vm_id();

    for (vcpu, regs) in (0u32..).zip(&launch.regs) {
        hv.reset_vcpu(vm, vcpu, regs)
            .map_err(VmError::KernelDenied)?;
        let asid = asids.get(vcpu as usize).copied().unwrap_or_default();
        cc.activate_vcpu(vcpu, asid)?;
    }
    cc.encrypt_memory(memory)?;

    // Resetting clobbers registers and the TSC; load the received state
    // once more.
    if let Some(params) = &launch.params {
        for (vcpu, regs) in (0u32..).zip(&launch.regs) {
            hv.write_registers(vm, vcpu, RegisterMask::ALL, regs)
                .map_err(VmError::KernelDenied)?;
        }
        migration::apply_vm_params(hv, vm, params)?;
        runtime.unpause()?;
    }

    let mut failure = None;
    let mut vcpus: Vec<Option<JoinHandle<Result<(), VcpuError>>>> = Vec::new();
    for vcpu in 0..runtime.ncpus() {
        let run_loop = VcpuRunLoop::new(runtime.clone(), vcpu, devices.clone(), devices.clone());
        match thread::Builder::new()
            .name(format!("vcpu-{}", vcpu))
            .spawn(move || run_loop.run())
        {
            Ok(handle) => vcpus.push(Some(handle)),
            Err(e) => {
                error!("vm {}: could not create vcpu{} thread: {}", vm, vcpu, e);
                failure = Some(VmError::Thread(e));
                break;
            }
        }
    }

    let stop = EventFd::new(EFD_NONBLOCK).map_err(VmError::Thread)?;
    let mut event_thread = None;
    if failure.is_none() {
        let event = EventLoop::new(
            control,
            pipe,
            stop.try_clone().map_err(VmError::Thread)?,
            runtime.clone(),
            devices.clone(),
            memory.clone(),
        );
        match thread::Builder::new()
            .name("event".into())
            .spawn(move || event.run())
        {
            Ok(handle) => event_thread = Some(handle),
            Err(e) => {
                error!("vm {}: could not create event thread: {}", vm, e);
                failure = Some(VmError::Thread(e));
            }
        }
    }
    if failure.is_some() {
        terminate(runtime);
    } else {
        debug!("vm {}: waiting on {} vcpu(s)", vm, vcpus.len());
    }

    loop {
        let (done, event_done) = runtime.finished()?;
        for vcpu in done {
            let Some(handle) = vcpus.get_mut(vcpu as usize).and_then(Option::take) else {
                continue;
            };
            let e = match handle.join() {
                Ok(Ok(())) => {
                    debug!("vm {}: vcpu{} joined", vm, vcpu);
                    continue;
                }
                Ok(Err(source)) => VmError::Vcpu { index: vcpu, source },
                Err(_) => VmError::VcpuPanicked(vcpu),
            };
            warn!("vm {}: vcpu{} exited abnormally", vm, vcpu);
            failure.get_or_insert(e);
        }
        if vcpus.iter().all(Option::is_none) {
            break;
        }

        if event_done {
            if let Some(handle) = event_thread.take() {
                warn!("vm {}: event thread exited unexpectedly", vm);
                if let Err(e) = handle.join().unwrap_or(Err(EventError::Panicked)) {
                    failure.get_or_insert(VmError::EventThread(e));
                }
                terminate(runtime);
            }
        }

        runtime.wait_completion()?;
    }

    if let Some(handle) = event_thread {
        if let Err(e) = stop.write(1) {
            warn!("vm {}: failed to stop event thread: {}", vm, e);
        }
        if let Err(e) = handle.join().unwrap_or(Err(EventError::Panicked)) {
            failure.get_or_insert(VmError::EventThread(e));
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn terminate(runtime: &VmRuntime) {
    if let Err(e) = runtime.terminate() {
        warn!("vm {}: terminate failed: {}", runtime.vm_id(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::tests::{tempfile, Parent, PAUSE, SHUTDOWN, UNPAUSE, VERBOSE};
    use crate::hypervisor::mock::MockHypervisor;
    use crate::hypervisor::{Gprs, VmExit};
    use crate::memory::MemoryRange;
    use crate::sev::tests::FakePsp;
    use crate::sev::SevError;
    use std::io::{Seek, SeekFrom};
    use std::sync::mpsc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Boot loader that leaves memory alone and starts at a fixed address.
    struct FlatLoader;

    impl BootLoader for FlatLoader {
        fn load(&self, memory: &GuestMemory) -> Result<VcpuRegisterState, BootError> {
            memory.write(0x1000, &[0xf4])?;
            Ok(VcpuRegisterState {
                gprs: Gprs {
                    rip: 0x1000,
                    rflags: 2,
                    ..Default::default()
                },
                ..Default::default()
            })
        }
    }

    /// Boot loader for an image that cannot be loaded.
    struct BrokenLoader;

    impl BootLoader for BrokenLoader {
        fn load(&self, _memory: &GuestMemory) -> Result<VcpuRegisterState, BootError> {
            Err(BootError::InvalidKernel("truncated".into()))
        }
    }

    fn config(ncpus: u32) -> VmConfig {
        VmConfig {
            name: "test".into(),
            ncpus,
            memory: vec![MemoryRange::ram(0, 64 << 20)],
            ..Default::default()
        }
    }

    /// Run a VM on its own thread; the result arrives on the channel.
    fn spawn_vm(
        config: VmConfig,
        hv: Arc<MockHypervisor>,
    ) -> (Parent, mpsc::Receiver<Result<(), VmError>>) {
        let (parent, control) = Parent::pair();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let vm = Vm::new(
                config,
                hv,
                control,
                Box::new(io::sink()),
                ConfidentialCompute::disabled(),
            );
            let _ = tx.send(vm.start(Boot::Image(&FlatLoader)));
        });
        (parent, rx)
    }

    /// Run an encrypted single-vCPU VM whose launch goes through `psp`.
    fn spawn_sev_vm(
        hv: Arc<MockHypervisor>,
        psp: FakePsp,
        loader: impl BootLoader + Send + 'static,
    ) -> (Parent, mpsc::Receiver<Result<(), VmError>>) {
        let (parent, control) = Parent::pair();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut c = config(1);
            c.sev = true;
            let vm = Vm::new(
                c,
                hv,
                control,
                Box::new(io::sink()),
                ConfidentialCompute::new(Box::new(psp)),
            );
            let _ = tx.send(vm.start(Boot::Image(&loader)));
        });
        (parent, rx)
    }

    fn shutdowns(psp: &FakePsp) -> usize {
        psp.calls()
            .iter()
            .filter(|c| c.starts_with("guest_shutdown"))
            .count()
    }

    fn created(parent: &Parent) -> u32 {
        match parent.reply().1 {
            Reply::Created { vm_id, result: 0 } => vm_id,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_pause_unpause_then_shutdown() {
        let hv = Arc::new(MockHypervisor::new());
        let (parent, done) = spawn_vm(config(2), hv.clone());

        let vm_id = created(&parent);
        assert!(vm_id > 0);
        assert!(hv.wait_for_runs(0, 1, TIMEOUT));
        assert!(hv.wait_for_runs(1, 1, TIMEOUT));
        assert_eq!(hv.resets(0), 1);
        assert_eq!(hv.resets(1), 1);

        // The reply only comes back once both vCPUs met the barrier.
        parent.request(7, PAUSE, &[]);
        let (header, reply) = parent.reply();
        assert_eq!(header.peer_id, 7);
        assert_eq!(reply, Reply::Pause { vm_id, result: 0 });

        parent.request(7, UNPAUSE, &[]);
        assert_eq!(parent.reply().1, Reply::Unpause { vm_id, result: 0 });

        // Pausing works again after a resume.
        parent.request(7, PAUSE, &[]);
        assert_eq!(parent.reply().1, Reply::Pause { vm_id, result: 0 });
        parent.request(7, UNPAUSE, &[]);
        assert_eq!(parent.reply().1, Reply::Unpause { vm_id, result: 0 });

        // No guest driver: shutdown stops the VM right away.
        parent.request(7, SHUTDOWN, &[]);
        let result = done.recv_timeout(TIMEOUT).unwrap();
        assert!(result.is_ok());
        assert!(hv.is_terminated());
    }

    #[test]
    fn test_parent_hangup_stops_vm() {
        let hv = Arc::new(MockHypervisor::new());
        let (parent, done) = spawn_vm(config(1), hv.clone());
        created(&parent);
        parent.request(1, VERBOSE, &1i32.to_le_bytes());
        drop(parent);
        assert!(done.recv_timeout(TIMEOUT).unwrap().is_ok());
        assert!(hv.is_terminated());
    }

    #[test]
    fn test_create_failure_reports_zero_id() {
        let hv = Arc::new(MockHypervisor::new());
        hv.fail_create();
        let (parent, done) = spawn_vm(config(1), hv);

        assert_eq!(
            parent.reply().1,
            Reply::Created {
                vm_id: 0,
                result: libc::EPERM
            }
        );
        let err = done.recv_timeout(TIMEOUT).unwrap().unwrap_err();
        assert!(matches!(err, VmError::KernelDenied(_)));
        assert_eq!(err.exit_code(), libc::EPERM);
    }

    #[test]
    fn test_invalid_config_fails_before_create() {
        let hv = Arc::new(MockHypervisor::new());
        let (_parent, done) = spawn_vm(config(65), hv);
        let err = done.recv_timeout(TIMEOUT).unwrap().unwrap_err();
        assert!(matches!(err, VmError::ConfigInvalid(ConfigError::Cpus(65))));
        assert_eq!(err.exit_code(), libc::EINVAL);
    }

    #[test]
    fn test_sev_without_psp_is_rejected() {
        let hv = Arc::new(MockHypervisor::new());
        let mut c = config(1);
        c.sev = true;
        let (_parent, done) = spawn_vm(c, hv);
        let err = done.recv_timeout(TIMEOUT).unwrap().unwrap_err();
        assert!(matches!(err, VmError::ConfigInvalid(ConfigError::NoPsp)));
    }

    #[test]
    fn test_sev_launch_runs_and_shuts_down_once() {
        let hv = Arc::new(MockHypervisor::new());
        let psp = FakePsp::default();
        let (parent, done) = spawn_sev_vm(hv.clone(), psp.clone(), FlatLoader);
        created(&parent);
        assert!(hv.wait_for_runs(0, 1, TIMEOUT));

        parent.request(1, SHUTDOWN, &[]);
        assert!(done.recv_timeout(TIMEOUT).unwrap().is_ok());

        let calls = psp.calls();
        assert!(calls.contains(&"activate 7 1".to_string()));
        assert!(calls.contains(&"launch_finish 7".to_string()));
        assert_eq!(shutdowns(&psp), 1);
    }

    #[test]
    fn test_sev_encrypt_failure_aborts_and_shuts_down() {
        let hv = Arc::new(MockHypervisor::new());
        let psp = FakePsp {
            fail: Some("launch_update"),
            ..Default::default()
        };
        let (parent, done) = spawn_sev_vm(hv.clone(), psp.clone(), FlatLoader);
        created(&parent);

        let err = done.recv_timeout(TIMEOUT).unwrap().unwrap_err();
        assert!(matches!(err, VmError::ConfidentialCompute(SevError::Psp(_))));
        assert_eq!(err.exit_code(), libc::EIO);
        assert!(!psp.calls().contains(&"launch_finish 7".to_string()));
        assert_eq!(shutdowns(&psp), 1);
        assert!(hv.runs(0).is_empty());
    }

    #[test]
    fn test_boot_failure_after_launch_start_shuts_down() {
        let hv = Arc::new(MockHypervisor::new());
        let psp = FakePsp::default();
        let (parent, done) = spawn_sev_vm(hv, psp.clone(), BrokenLoader);
        created(&parent);

        let err = done.recv_timeout(TIMEOUT).unwrap().unwrap_err();
        assert!(matches!(err, VmError::Boot(BootError::InvalidKernel(_))));
        assert_eq!(psp.calls().last().unwrap(), "guest_shutdown 7");
        assert_eq!(shutdowns(&psp), 1);
    }

    #[test]
    fn test_vcpu_failure_is_exit_status() {
        let hv = Arc::new(MockHypervisor::new());
        hv.script_on_create(0, [VmExit::Shutdown]);
        let (parent, done) = spawn_vm(config(1), hv.clone());
        created(&parent);

        let err = done.recv_timeout(TIMEOUT).unwrap().unwrap_err();
        assert!(matches!(
            err,
            VmError::Vcpu {
                index: 0,
                source: VcpuError::TripleFault
            }
        ));
        assert_eq!(err.exit_code(), libc::EIO);
    }

    #[test]
    fn test_protocol_violation_is_fatal() {
        let hv = Arc::new(MockHypervisor::new());
        let (parent, done) = spawn_vm(config(2), hv.clone());
        created(&parent);
        parent.request(1, 0xdead, &[]);

        let err = done.recv_timeout(TIMEOUT).unwrap().unwrap_err();
        assert!(matches!(
            err,
            VmError::EventThread(EventError::Control(ControlError::UnknownKind(0xdead)))
        ));
        assert_eq!(err.exit_code(), libc::EPROTO);
        assert!(hv.is_terminated());
    }

    #[test]
    fn test_send_and_receive() {
        let hv = Arc::new(MockHypervisor::new());
        let (parent, done) = spawn_vm(config(2), hv.clone());
        let vm_id = created(&parent);
        assert!(hv.wait_for_runs(1, 1, TIMEOUT));

        let mut target = tempfile();
        parent.send_vm(3, &target);
        assert_eq!(parent.reply().1, Reply::SendVm { vm_id, result: 0 });
        assert!(done.recv_timeout(TIMEOUT).unwrap().is_ok());
        assert!(hv.is_terminated());
        let sent = [hv.registers(0), hv.registers(1)];

        target.seek(SeekFrom::Start(0)).unwrap();
        let hv2 = Arc::new(MockHypervisor::new());
        let (parent2, control) = Parent::pair();
        let (tx, done2) = mpsc::channel();
        let hv2_vm = hv2.clone();
        thread::spawn(move || {
            let vm = Vm::new(
                VmConfig {
                    name: "received".into(),
                    ..Default::default()
                },
                hv2_vm,
                control,
                Box::new(io::sink()),
                ConfidentialCompute::disabled(),
            );
            let _ = tx.send(vm.start(Boot::Received(&mut target)));
        });

        created(&parent2);
        assert!(hv2.wait_for_runs(0, 1, TIMEOUT));
        assert!(hv2.wait_for_runs(1, 1, TIMEOUT));
        assert_eq!(hv2.resets(0), 1);
        assert_eq!(hv2.registers(0).gprs.rip, sent[0].gprs.rip);
        assert_eq!(hv2.registers(1).gprs.rip, sent[1].gprs.rip);

        // The restored VM was resumed and can be paused like any other.
        parent2.request(2, PAUSE, &[]);
        assert!(matches!(parent2.reply().1, Reply::Pause { result: 0, .. }));
        parent2.request(2, SHUTDOWN, &[]);
        assert!(done2.recv_timeout(TIMEOUT).unwrap().is_ok());
    }
}
