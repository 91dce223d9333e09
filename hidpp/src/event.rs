//! A blocking report queue used to hand reports from the dispatcher thread to
//! consumer threads.

use std::{
    sync::{
        Mutex,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::report::Report;

/// An unbounded, thread-safe queue of reports that can be interrupted.
///
/// Once [`Self::interrupt`] was called, every [`Self::pop`] returns [`None`]
/// without blocking and pushed reports are discarded. Consumer threads use
/// this as their shutdown signal.
#[derive(Debug)]
pub struct EventQueue {
    sender: Mutex<Option<flume::Sender<Report>>>,
    receiver: flume::Receiver<Report>,
    interrupted: AtomicBool,
}

impl EventQueue {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();

        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            interrupted: AtomicBool::new(false),
        }
    }

    /// Appends a report to the queue. Never blocks.
    ///
    /// Returns `false` if the queue was interrupted and the report was
    /// discarded.
    pub fn push(&self, report: Report) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);

        match sender.as_ref() {
            Some(sender) => sender.send(report).is_ok(),
            None => false,
        }
    }

    /// Removes the oldest report from the queue, blocking until one is
    /// available.
    ///
    /// Returns [`None`] if the queue is or gets interrupted.
    pub fn pop(&self) -> Option<Report> {
        if self.is_interrupted() {
            return None;
        }

        // Dropping the only sender in `interrupt` disconnects the channel,
        // which wakes every blocked receiver. Reports still buffered at that
        // point are handed out by flume first, hence the second check.
        let report = self.receiver.recv().ok()?;
        (!self.is_interrupted()).then_some(report)
    }

    /// Like [`Self::pop`], but gives up after `timeout`.
    ///
    /// A timeout too large to be added to the current time waits forever.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Report, PopError> {
        if self.is_interrupted() {
            return Err(PopError::Interrupted);
        }

        let received = match Instant::now().checked_add(timeout) {
            Some(deadline) => self.receiver.recv_deadline(deadline),
            None => self
                .receiver
                .recv()
                .map_err(|_| flume::RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(report) if !self.is_interrupted() => Ok(report),
            Ok(_) | Err(flume::RecvTimeoutError::Disconnected) => Err(PopError::Interrupted),
            Err(flume::RecvTimeoutError::Timeout) => Err(PopError::Timeout),
        }
    }

    /// Wakes every blocked [`Self::pop`] and makes all future pops return
    /// [`None`]. Idempotent.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// The amount of reports waiting to be popped.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents the reason [`EventQueue::pop_timeout`] returned without a
/// report.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum PopError {
    #[error("the queue was interrupted")]
    Interrupted,

    #[error("no report arrived in time")]
    Timeout,
}
