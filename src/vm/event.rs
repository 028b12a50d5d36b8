//! Event-dispatch thread.
//!
//! One thread per VM process waits on three descriptors:
//!
//! - the control socket to the parent (requests)
//! - the device pipe (work handed over by device emulation)
//! - a stop eventfd, written by the controller once every vCPU has exited
//!
//! Requests are handled one at a time, in arrival order. A pause request
//! blocks this thread until every vCPU has reached the pause barrier.

use crate::control::{verbosity_level, ControlChannel, ControlError, Header, Reply, Request};
use crate::devices::pipe::{PipeMessage, PipeReceiver};
use crate::devices::{DeviceError, Devices, VmmCommand, VmmControlError};
use crate::memory::GuestMemory;
use crate::migration::{self, MigrationError};
use crate::sync::SyncError;
use crate::vm::runtime::VmRuntime;
use log::{debug, error, info, warn};
use std::io::{self, BufWriter};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

const CONTROL_EVENT: u64 = 0;
const PIPE_EVENT: u64 = 1;
const STOP_EVENT: u64 = 2;

const EPOLL_EVENTS_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to create epoll descriptor: {0}")]
    EpollCreate(#[source] io::Error),

    #[error("Failed to register descriptor with epoll: {0}")]
    EpollCtl(#[source] io::Error),

    #[error("Failed to wait on epoll: {0}")]
    EpollWait(#[source] io::Error),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Event thread panicked")]
    Panicked,
}

/// Everything the event thread works on.
pub struct EventLoop {
    control: ControlChannel,
    pipe: PipeReceiver,
    stop: EventFd,
    runtime: Arc<VmRuntime>,
    devices: Arc<Devices>,
    memory: Arc<GuestMemory>,
}

impl EventLoop {
    pub fn new(
        control: ControlChannel,
        pipe: PipeReceiver,
        stop: EventFd,
        runtime: Arc<VmRuntime>,
        devices: Arc<Devices>,
        memory: Arc<GuestMemory>,
    ) -> Self {
        Self {
            control,
            pipe,
            stop,
            runtime,
            devices,
            memory,
        }
    }

    /// Dispatch events until the stop eventfd fires.
    ///
    /// The runtime is told the thread has finished whatever the outcome, so
    /// an unexpected exit wakes the controller.
    pub fn run(self) -> Result<(), EventError> {
        let result = self.dispatch();
        match &result {
            Ok(()) => debug!("event thread: stopped"),
            Err(e) => error!("event thread: {}", e),
        }
        if let Err(e) = self.runtime.mark_event_done() {
            error!("event thread: failed to report completion: {}", e);
        }
        result
    }

    fn dispatch(&self) -> Result<(), EventError> {
        let epoll_fd = epoll::create(true).map_err(EventError::EpollCreate)?;
        // SAFETY: epoll::create just returned this descriptor and nothing
        // else owns it.
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll_fd) };

        add(&epoll, self.control.as_raw_fd(), CONTROL_EVENT)?;
        add(&epoll, self.pipe.as_raw_fd(), PIPE_EVENT)?;
        add(&epoll, self.stop.as_raw_fd(), STOP_EVENT)?;

        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); EPOLL_EVENTS_LEN];
        loop {
            let num_events = match epoll::wait(epoll.as_raw_fd(), -1, &mut events[..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EventError::EpollWait(e)),
            };

            for event in events.iter().take(num_events) {
                match event.data {
                    CONTROL_EVENT => {
                        if !self.handle_control()? {
                            // Parent is gone; stop listening on the socket.
                            epoll::ctl(
                                epoll.as_raw_fd(),
                                epoll::ControlOptions::EPOLL_CTL_DEL,
                                self.control.as_raw_fd(),
                                epoll::Event::new(epoll::Events::empty(), CONTROL_EVENT),
                            )
                            .map_err(EventError::EpollCtl)?;
                        }
                    }
                    PIPE_EVENT => {
                        for msg in self.pipe.drain() {
                            self.handle_pipe(msg);
                        }
                    }
                    STOP_EVENT => {
                        let _ = self.stop.read();
                        return Ok(());
                    }
                    other => warn!("event thread: unknown event {}", other),
                }
            }
        }
    }

    /// Handle one control message. Returns `false` on EOF.
    fn handle_control(&self) -> Result<bool, EventError> {
        let Some((header, req)) = self.control.recv()? else {
            info!("vm {}: parent closed the control channel", self.runtime.vm_id());
            self.terminate();
            return Ok(false);
        };

        let vm_id = self.runtime.vm_id();
        match req {
            Request::Verbose(v) => {
                let level = verbosity_level(v);
                log::set_max_level(level);
                self.devices.set_verbosity(level);
                info!("log level set to {}", level);
            }
            Request::Shutdown => self.guest_request(VmmCommand::Shutdown),
            Request::Reboot => self.guest_request(VmmCommand::Reboot),
            Request::Pause => {
                let result = match self.runtime.pause() {
                    Ok(_) => 0,
                    Err(e) => {
                        error!("vm {}: pause failed: {}", vm_id, e);
                        libc::EDEADLK
                    }
                };
                self.reply(&header, Reply::Pause { vm_id, result });
            }
            Request::Unpause => {
                let result = match self.runtime.unpause() {
                    Ok(_) => 0,
                    Err(e) => {
                        error!("vm {}: unpause failed: {}", vm_id, e);
                        libc::EDEADLK
                    }
                };
                self.reply(&header, Reply::Unpause { vm_id, result });
            }
            Request::SendVm(target) => {
                let mut w = BufWriter::new(target);
                let result = match migration::send(
                    &mut w,
                    &self.runtime,
                    &self.memory,
                    self.devices.as_ref(),
                ) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("vm {}: send failed: {}", vm_id, e);
                        migration_errno(&e)
                    }
                };
                self.reply(&header, Reply::SendVm { vm_id, result });
            }
            Request::AddrResponse { nic, mac } => self.devices.set_host_mac(nic, mac)?,
        }
        Ok(true)
    }

    /// Forward a shutdown or reboot to the guest. A guest that cannot take
    /// the request is stopped right away.
    fn guest_request(&self, cmd: VmmCommand) {
        match self.devices.request(&self.runtime, cmd) {
            Ok(()) => debug!("vm {}: {:?} requested", self.runtime.vm_id(), cmd),
            Err(DeviceError::Control(VmmControlError::NotReady)) => {
                info!(
                    "vm {}: guest has no control driver, stopping",
                    self.runtime.vm_id()
                );
                self.terminate();
            }
            Err(e) => {
                warn!("vm {}: {:?} request failed: {}", self.runtime.vm_id(), cmd, e);
                self.terminate();
            }
        }
    }

    fn handle_pipe(&self, msg: PipeMessage) {
        let vm_id = self.runtime.vm_id();
        let reply = match msg {
            PipeMessage::GuestShutdown => Reply::VmShutdown { vm_id },
            PipeMessage::GuestReboot => Reply::VmReboot { vm_id },
        };
        info!("vm {}: guest acknowledged {:?}", vm_id, msg);
        if let Err(e) = self.control.send(0, reply) {
            warn!("vm {}: {}", vm_id, e);
        }
        self.terminate();
    }

    fn reply(&self, header: &Header, reply: Reply) {
        if let Err(e) = self.control.send(header.peer_id, reply) {
            warn!("vm {}: {}", self.runtime.vm_id(), e);
        }
    }

    fn terminate(&self) {
        if let Err(e) = self.runtime.terminate() {
            warn!("vm {}: terminate failed: {}", self.runtime.vm_id(), e);
        }
    }
}

fn add(epoll: &OwnedFd, fd: RawFd, token: u64) -> Result<(), EventError> {
    epoll::ctl(
        epoll.as_raw_fd(),
        epoll::ControlOptions::EPOLL_CTL_ADD,
        fd,
        epoll::Event::new(epoll::Events::EPOLLIN, token),
    )
    .map_err(EventError::EpollCtl)
}

fn migration_errno(e: &MigrationError) -> i32 {
    match e {
        MigrationError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        MigrationError::Vcpu { source, .. } => source.errno().unwrap_or(libc::EIO),
        MigrationError::Sync(_) => libc::EDEADLK,
        _ => libc::EIO,
    }
}
