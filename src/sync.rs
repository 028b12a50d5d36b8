//! Thread signalling primitives shared by the vCPU threads and the controller.
//!
//! Each vCPU owns two independent [`Notify`] handles: one that wakes it from
//! a halt (run) and one that releases it from a pause (unpause). Keeping them
//! separate means an unpause wake can never be consumed by a thread that is
//! waiting to be un-halted, and vice versa.
//!
//! A `Notify` remembers a wake that arrives before anyone waits on it, so the
//! classic lost-wakeup race between "check flag, then sleep" and "set flag,
//! then signal" cannot strand a vCPU.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Errors raised when a synchronization object becomes unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A thread panicked while holding the named lock.
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

/// Lock a mutex, converting poisoning into a [`SyncError`].
pub fn lock<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> Result<MutexGuard<'a, T>, SyncError> {
    mutex.lock().map_err(|_| SyncError::Poisoned(name))
}

/// A single-consumer wake-up signal with a sticky pending bit.
#[derive(Debug)]
pub struct Notify {
    name: &'static str,
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Notify {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Wake the waiter, or arm the signal if nobody is waiting yet.
    pub fn notify(&self) -> Result<(), SyncError> {
        let mut pending = lock(&self.pending, self.name)?;
        *pending = true;
        self.cond.notify_one();
        Ok(())
    }

    /// Block until notified, consuming the pending wake.
    pub fn wait(&self) -> Result<(), SyncError> {
        let mut pending = lock(&self.pending, self.name)?;
        while !*pending {
            pending = self
                .cond
                .wait(pending)
                .map_err(|_| SyncError::Poisoned(self.name))?;
        }
        *pending = false;
        Ok(())
    }

    /// Like [`Notify::wait`] but gives up after `timeout`.
    ///
    /// Returns `true` if a wake was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SyncError> {
        let pending = lock(&self.pending, self.name)?;
        let (mut pending, _) = self
            .cond
            .wait_timeout_while(pending, timeout, |pending| !*pending)
            .map_err(|_| SyncError::Poisoned(self.name))?;
        let woken = *pending;
        *pending = false;
        Ok(woken)
    }
}
