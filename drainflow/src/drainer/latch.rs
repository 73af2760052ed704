//! One-shot completion signal with blocking and async waiters.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Released at most once; waiting after release returns immediately.
#[derive(Debug, Default)]
pub struct Latch {
    released: Mutex<bool>,
    condvar: Condvar,
    notify: Notify,
}

impl Latch {
    /// Creates a closed latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the latch. Returns true for the call that opened it.
    pub fn release(&self) -> bool {
        let mut released = self.released.lock();
        if *released {
            return false;
        }
        *released = true;
        self.condvar.notify_all();
        drop(released);
        self.notify.notify_waiters();
        true
    }

    /// Returns true once released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }

    /// Blocks until released.
    pub fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.condvar.wait(&mut released);
        }
    }

    /// Blocks until released or the timeout passes. Returns true if
    /// released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut released = self.released.lock();
        if !*released {
            // Spurious wakeups are covered by the predicate.
            self.condvar
                .wait_while_for(&mut released, |released| !*released, timeout);
        }
        *released
    }

    /// Waits asynchronously until released.
    pub async fn wait_async(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_released() {
                return;
            }
            notified.await;
        }
    }
}
