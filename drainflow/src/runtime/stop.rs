//! Shutdown signal shared by a deployment's threads.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// A callback run when the token fires.
pub type StopCallback = Box<dyn Fn() + Send + Sync>;

/// A one-shot stop signal.
///
/// Stopping is idempotent; only the first reason is kept. Callbacks run on
/// the stopping thread and a panicking callback is logged and suppressed.
#[derive(Default)]
pub struct StopToken {
    stopped: AtomicBool,
    reason: RwLock<Option<String>>,
    callbacks: RwLock<Vec<StopCallback>>,
}

impl StopToken {
    /// Creates an unfired token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token. Returns true for the call that fired it.
    pub fn stop(&self, reason: impl Into<String>) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.reason.write() = Some(reason.into());
        let callbacks = std::mem::take(&mut *self.callbacks.write());
        for callback in &callbacks {
            run_callback(callback.as_ref());
        }
        true
    }

    /// Registers a callback. Runs it at once if the token already fired.
    pub fn on_stop(&self, callback: impl Fn() + Send + Sync + 'static) {
        let mut callbacks = self.callbacks.write();
        if !self.is_stopped() {
            callbacks.push(Box::new(callback));
            return;
        }
        drop(callbacks);
        run_callback(&callback);
    }

    /// Returns true once fired.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The reason given by the first `stop`.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }
}

fn run_callback(callback: &(dyn Fn() + Send + Sync)) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        warn!("Stop callback panicked: {:?}", panic);
    }
}

impl std::fmt::Debug for StopToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopToken")
            .field("stopped", &self.is_stopped())
            .field("reason", &self.reason())
            .finish()
    }
}
