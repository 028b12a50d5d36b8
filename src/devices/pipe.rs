//! Device signalling channel.
//!
//! Device emulation runs on vCPU threads and has to hand some work to the
//! event thread (for example "the guest acknowledged a shutdown request").
//! Messages travel over a bounded channel, one whole [`PipeMessage`] at a
//! time; an eventfd makes the channel visible to the event thread's epoll
//! loop.

use log::warn;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use thiserror::Error;
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

/// Capacity of the channel. Senders never block.
const PIPE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMessage {
    /// The guest acknowledged a shutdown request.
    GuestShutdown,
    /// The guest acknowledged a reboot request.
    GuestReboot,
}

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Failed to create pipe eventfd: {0}")]
    EventFd(#[source] io::Error),

    #[error("Device pipe is full")]
    Full,

    #[error("Device pipe is closed")]
    Closed,
}

/// Create a connected sender/receiver pair.
pub fn device_pipe() -> Result<(PipeSender, PipeReceiver), PipeError> {
    let evt = Arc::new(EventFd::new(EFD_NONBLOCK).map_err(PipeError::EventFd)?);
    let (tx, rx) = flume::bounded(PIPE_DEPTH);
    Ok((
        PipeSender {
            tx,
            evt: Arc::clone(&evt),
        },
        PipeReceiver { rx, evt },
    ))
}

#[derive(Clone)]
pub struct PipeSender {
    tx: flume::Sender<PipeMessage>,
    evt: Arc<EventFd>,
}

impl PipeSender {
    pub fn send(&self, msg: PipeMessage) -> Result<(), PipeError> {
        self.tx.try_send(msg).map_err(|e| match e {
            flume::TrySendError::Full(_) => PipeError::Full,
            flume::TrySendError::Disconnected(_) => PipeError::Closed,
        })?;
        if let Err(e) = self.evt.write(1) {
            warn!("device pipe: failed to signal eventfd: {}", e);
        }
        Ok(())
    }
}

pub struct PipeReceiver {
    rx: flume::Receiver<PipeMessage>,
    evt: Arc<EventFd>,
}

impl PipeReceiver {
    /// Clear the readiness signal and take every queued message.
    pub fn drain(&self) -> Vec<PipeMessage> {
        // EAGAIN just means the counter was already consumed.
        let _ = self.evt.read();
        self.rx.try_iter().collect()
    }
}

impl AsRawFd for PipeReceiver {
    fn as_raw_fd(&self) -> RawFd {
        self.evt.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_arrive_whole_and_in_order() {
        let (tx, rx) = device_pipe().unwrap();
        tx.send(PipeMessage::GuestReboot).unwrap();
        tx.clone().send(PipeMessage::GuestShutdown).unwrap();
        assert_eq!(
            rx.drain(),
            vec![PipeMessage::GuestReboot, PipeMessage::GuestShutdown]
        );
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn test_full_pipe_rejects_without_blocking() {
        let (tx, _rx) = device_pipe().unwrap();
        for _ in 0..PIPE_DEPTH {
            tx.send(PipeMessage::GuestShutdown).unwrap();
        }
        assert!(matches!(
            tx.send(PipeMessage::GuestShutdown),
            Err(PipeError::Full)
        ));
    }

    #[test]
    fn test_closed_pipe() {
        let (tx, rx) = device_pipe().unwrap();
        drop(rx);
        assert!(matches!(
            tx.send(PipeMessage::GuestShutdown),
            Err(PipeError::Closed)
        ));
    }
}
