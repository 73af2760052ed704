//! Liveness watchdog for drain rounds.

use super::Inner;
use crate::config::WatchdogConfig;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use tracing::{debug, error};
use uuid::Uuid;

/// Periodically forces units that have been draining longer than the
/// configured timeout. One watchdog serves one round.
#[derive(Debug)]
pub struct DrainWatchdog {
    signal: Arc<(Mutex<bool>, Condvar)>,
}

impl DrainWatchdog {
    pub(crate) fn start(inner: Weak<Inner>, round: Uuid, config: WatchdogConfig) -> Self {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_signal = signal.clone();
        let spawned = std::thread::Builder::new()
            .name("drain-watchdog".to_string())
            .spawn(move || watch(&inner, round, &config, &thread_signal));
        if let Err(err) = spawned {
            error!(round = %round, error = %err, "Failed to start drain watchdog");
        }
        Self { signal }
    }

    /// Stops the watchdog. Does not wait for its thread.
    pub fn stop(&self) {
        let (stopped, condvar) = &*self.signal;
        *stopped.lock() = true;
        condvar.notify_all();
    }

    /// Returns true once stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.signal.0.lock()
    }
}

impl Drop for DrainWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch(inner: &Weak<Inner>, round: Uuid, config: &WatchdogConfig, signal: &(Mutex<bool>, Condvar)) {
    let (stopped, condvar) = signal;
    debug!(round = %round, timeout_ms = config.timeout_ms, "Drain watchdog started");
    loop {
        {
            let mut stopped = stopped.lock();
            if !*stopped {
                condvar.wait_for(&mut stopped, config.period());
            }
            if *stopped {
                break;
            }
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.force_stuck(round, config.timeout());
    }
    debug!(round = %round, "Drain watchdog stopped");
}
