//! Shared run state and a background progress reporter.
//!
//! The controller is the only writer of the patch index and the phase; the
//! caller is the only writer of the cancellation flag. Everyone else reads.
//! Values are monotonic, so a reader that sees a slightly stale snapshot is
//! harmless.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RunPhase {
    Planning = 0,
    Extending = 1,
    Iterating = 2,
    Inferring = 3,
    Reconstructing = 4,
    Done = 5,
    Cancelled = 6,
}

impl RunPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Planning,
            1 => Self::Extending,
            2 => Self::Iterating,
            3 => Self::Inferring,
            4 => Self::Reconstructing,
            5 => Self::Done,
            _ => Self::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Extending => "extending",
            Self::Iterating => "iterating",
            Self::Inferring => "inferring",
            Self::Reconstructing => "reconstructing",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
struct RunState {
    total_patches: AtomicUsize,
    current_patch: AtomicUsize,
    cancelled: AtomicBool,
    phase: AtomicU8,
    peak_memory_bytes: AtomicU64,
    started: OnceLock<Instant>,
    finished: OnceLock<Instant>,
}

/// Cheap, cloneable view of one run's state.
#[derive(Debug, Clone)]
pub struct RunHandle {
    state: Arc<RunState>,
}

impl Default for RunHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RunState {
                total_patches: AtomicUsize::new(0),
                current_patch: AtomicUsize::new(0),
                cancelled: AtomicBool::new(false),
                phase: AtomicU8::new(RunPhase::Planning as u8),
                peak_memory_bytes: AtomicU64::new(0),
                started: OnceLock::new(),
                finished: OnceLock::new(),
            }),
        }
    }

    /// 1-based index of the patch being processed, 0 before the first patch.
    pub fn current_patch(&self) -> usize {
        self.state.current_patch.load(Ordering::Acquire)
    }

    pub fn total_patches(&self) -> usize {
        self.state.total_patches.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Takes effect at the next patch boundary; the patch in flight completes.
    pub fn request_cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            info!(
                current_patch = self.current_patch(),
                total_patches = self.total_patches(),
                "Cancellation requested"
            );
        }
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from_u8(self.state.phase.load(Ordering::Acquire))
    }

    pub fn elapsed(&self) -> Duration {
        let Some(started) = self.state.started.get() else {
            return Duration::ZERO;
        };
        match self.state.finished.get() {
            Some(finished) => finished.saturating_duration_since(*started),
            None => started.elapsed(),
        }
    }

    pub fn peak_memory_bytes(&self) -> u64 {
        self.state.peak_memory_bytes.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            current_patch: self.current_patch(),
            total_patches: self.total_patches(),
            phase: self.phase(),
            elapsed: self.elapsed(),
            cancelled: self.is_cancelled(),
        }
    }

    pub(crate) fn start(&self, total_patches: usize) {
        let _ = self.state.started.set(Instant::now());
        self.state
            .total_patches
            .store(total_patches, Ordering::Release);
    }

    pub(crate) fn begin_patch(&self) -> usize {
        self.state.current_patch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn set_phase(&self, next: RunPhase) {
        let previous = RunPhase::from_u8(self.state.phase.swap(next as u8, Ordering::AcqRel));
        if previous != next {
            debug!(from = previous.label(), to = next.label(), "Run phase changed");
        }
        if next.is_terminal() {
            let _ = self.state.finished.set(Instant::now());
        }
    }

    pub(crate) fn record_memory(&self, bytes: u64) {
        self.state
            .peak_memory_bytes
            .fetch_max(bytes, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub current_patch: usize,
    pub total_patches: usize,
    pub phase: RunPhase,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl ProgressSnapshot {
    pub fn fraction(&self) -> f64 {
        if self.total_patches == 0 {
            0.0
        } else {
            (self.current_patch.min(self.total_patches) as f64) / self.total_patches as f64
        }
    }
}

/// Polls a [`RunHandle`] on its own thread and hands snapshots to a callback.
///
/// Stops once the run reaches a terminal phase, or when stopped or dropped;
/// the final state is always delivered once.
pub struct ProgressReporter {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn<F>(handle: RunHandle, interval: Duration, mut on_tick: F) -> Self
    where
        F: FnMut(&ProgressSnapshot) + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::<()>();
        let thread = thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => {
                    on_tick(&handle.snapshot());
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let snapshot = handle.snapshot();
                    on_tick(&snapshot);
                    if snapshot.phase.is_terminal() {
                        break;
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }
    }

    /// Reports through `tracing` at info level.
    pub fn spawn_logging(handle: RunHandle, interval: Duration) -> Self {
        Self::spawn(handle, interval, |snapshot| {
            info!(
                patch = snapshot.current_patch,
                total = snapshot.total_patches,
                phase = snapshot.phase.label(),
                elapsed_secs = snapshot.elapsed.as_secs_f64(),
                "Tiling progress"
            );
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
