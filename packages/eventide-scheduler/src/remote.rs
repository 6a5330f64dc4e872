//! Cross-thread entry point into a loop.
//!
//! The loop itself is single-threaded. Other threads talk to it only through
//! an unbounded channel that the loop merges into its macrotask queue at the
//! start of every iteration. The same channel is what the loop blocks on when
//! it sleeps, so a remote submission or stop request wakes it immediately.

use crate::error::{IntoTaskResult, SchedulerError, TaskResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub(crate) type RemoteTask = Box<dyn FnOnce() -> TaskResult + Send>;

pub(crate) enum Envelope {
    Task(RemoteTask),
    Stop,
}

pub(crate) struct Inbox {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    stopped: Arc<AtomicBool>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.tx.clone(),
            stopped: self.stopped.clone(),
        }
    }

    pub(crate) fn try_recv(&self) -> Option<Envelope> {
        match self.rx.try_recv() {
            Ok(envelope) => Some(envelope),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Blocks until a message arrives or `timeout` elapses. `None` waits
    /// without a limit.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Option<Envelope> {
        match timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(envelope) => Some(envelope),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
            None => self.rx.recv().ok(),
        }
    }

    pub(crate) fn drain(&self) -> Vec<Envelope> {
        self.rx.try_iter().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Thread-safe producer handle for an [`EventLoop`](crate::EventLoop).
///
/// Work submitted here runs on the loop thread as a macrotask with origin
/// [`TaskOrigin::Remote`](crate::TaskOrigin::Remote), after everything the
/// loop had already queued.
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<Envelope>,
    stopped: Arc<AtomicBool>,
}

impl LoopHandle {
    /// Hands `f` to the loop's inbox.
    ///
    /// `Ok` means the task was accepted by the inbox, not that it will run. A
    /// `stop()` on the loop thread can land between the stopped check and the
    /// send, in which case the loop drops the task unrun.
    pub fn schedule_macrotask<F, R>(&self, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoTaskResult,
    {
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        self.tx
            .send(Envelope::Task(Box::new(move || f().into_task_result())))
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Asks the loop to stop and wakes it if it is sleeping. The task the loop
    /// is running right now, if any, still finishes.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // The loop may already be gone; the flag alone is enough then.
        let _ = self.tx.send(Envelope::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
