//! Progress & Timer Coordination
//!
//! Owns the recurring timers tied to a single operation's lifetime and
//! guarantees each is cancelled exactly once, on whichever of success,
//! failure, explicit cancellation, or host teardown comes first.
//! Timer callbacks consult a liveness flag after every tick, so a tick
//! already in flight when cancellation lands still no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Ceiling for automatic progress ticks; the final jump to done is the
/// operation's own call.
const TICK_CEILING: u8 = 95;

/// Teardown signal for an in-flight operation.
///
/// Captured by value at the start of every async step; consulted after
/// every suspension point. Once cancelled, a step must discard its
/// result and skip any further state mutation or emission.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives user-visible progress for one operation.
///
/// Percent updates flow over a watch channel; subscribers (the CLI)
/// never mutate. `finish` is idempotent and resets the percentage to
/// its initial value on every exit path, including error.
pub struct ProgressCoordinator {
    alive: Arc<AtomicBool>,
    percent_tx: watch::Sender<u8>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProgressCoordinator {
    pub fn new() -> Self {
        let (percent_tx, _) = watch::channel(0u8);
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            percent_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u8> {
        self.percent_tx.subscribe()
    }

    /// Start a recurring tick that bumps the percentage by `step` every
    /// `every`, capped below completion.
    pub fn start_ticker(&self, step: u8, every: Duration) {
        let alive = Arc::clone(&self.alive);
        let tx = self.percent_tx.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick of tokio's interval fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                // Liveness is re-checked after the await: a tick that
                // was already scheduled when cancellation landed must
                // not emit.
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                tx.send_modify(|p| *p = p.saturating_add(step).min(TICK_CEILING));
            }
        });

        self.handles.lock().unwrap().push(handle);
    }

    /// Set the percentage directly. No-op after finish.
    pub fn set_percent(&self, percent: u8) {
        if self.alive.load(Ordering::SeqCst) {
            // Stored even when nothing subscribes yet.
            self.percent_tx.send_replace(percent);
        }
    }

    /// Stop the recurring timers without finishing the coordinator.
    /// Used between attempts of a retryable operation: the percentage
    /// can be reset and a new ticker started later.
    pub fn stop_tickers(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    /// Stop all timers and reset the percentage. Exactly-once: only the
    /// first caller tears down; later calls are no-ops.
    pub fn finish(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("progress coordinator finished; cancelling timers");
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.percent_tx.send_replace(0);
    }

    pub fn is_finished(&self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }
}

impl Default for ProgressCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProgressCoordinator {
    // Host teardown path: dropping the owner cancels whatever is left.
    fn drop(&mut self) {
        self.finish();
    }
}
