//! Lifecycle and cancellation context of one scan task

pub mod command;

use crate::ScanResult;
use log::{debug, info, warn};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use command::ScanCommand;

/// Owns the pause flag and the cancellable context of a running scan.
///
/// Pausing never kills in-flight work; it only stops further admissions at
/// the next checkpoint. Stopping (or hitting the deadline) cancels the
/// context, which unblocks every dial, wait and slot acquisition.
#[derive(Debug)]
pub struct TaskManager {
    token: CancellationToken,
    paused: AtomicBool,
    stopped: AtomicBool,
    timed_out: Arc<AtomicBool>,
    checkpointed: AtomicBool,
    started: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

impl TaskManager {
    /// Child context of `parent` with no deadline yet
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            timed_out: Arc::new(AtomicBool::new(false)),
            checkpointed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            deadline: Mutex::new(None),
        }
    }

    /// Arm the total-timeout deadline. Only the first call has an effect.
    pub fn start(&self, total_timeout: Duration) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Task manager already started, ignoring new deadline");
            return;
        }

        let deadline = Instant::now() + total_timeout;
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = Some(deadline);

        let token = self.token.clone();
        let timed_out = Arc::clone(&self.timed_out);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    info!("Scan deadline of {:?} reached, cancelling", total_timeout);
                    timed_out.store(true, Ordering::SeqCst);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// Request a pause, taking effect at the next checkpoint
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Pause requested");
        }
    }

    /// Cancel the context
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Stop requested");
        }
        self.token.cancel();
    }

    /// Safe dispatch point. When a pause is pending, `persist` runs once and
    /// dispatch must end; cancellation also ends dispatch, without persisting.
    pub fn checkpoint<F>(&self, persist: F) -> ScanResult<ControlFlow<()>>
    where
        F: FnOnce() -> ScanResult<()>,
    {
        if self.token.is_cancelled() {
            return Ok(ControlFlow::Break(()));
        }
        if !self.paused.load(Ordering::SeqCst) {
            return Ok(ControlFlow::Continue(()));
        }
        if !self.checkpointed.swap(true, Ordering::SeqCst) {
            persist()?;
            info!("Checkpoint persisted, dispatch halted");
        } else {
            debug!("Checkpoint already taken");
        }
        Ok(ControlFlow::Break(()))
    }

    /// Cancel the context of a scan that has ended; releases the deadline timer
    pub fn release(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// A pause actually took effect
    pub fn is_checkpointed(&self) -> bool {
        self.checkpointed.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether new work may still be admitted
    pub fn should_dispatch(&self) -> bool {
        !self.is_paused() && !self.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }
}
