//! Configuration for units, the drainer and in-process deployments.
//!
//! Every component takes its configuration explicitly at construction time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Liveness watchdog for drain rounds.
///
/// When enabled, a unit that was asked to drain and has not completed
/// within `timeout_ms` is forced to completion with empty drain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Whether the watchdog runs at all.
    #[serde(default)]
    pub enabled: bool,
    /// How long a unit may stay mid-drain before it is forced.
    #[serde(default = "default_watchdog_timeout")]
    pub timeout_ms: u64,
    /// How often the watchdog checks the graph.
    #[serde(default = "default_watchdog_period")]
    pub period_ms: u64,
}

fn default_watchdog_timeout() -> u64 {
    10_000
}

fn default_watchdog_period() -> u64 {
    500
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: default_watchdog_timeout(),
            period_ms: default_watchdog_period(),
        }
    }
}

impl WatchdogConfig {
    /// Creates an enabled watchdog with the given timeout.
    #[must_use]
    pub fn enabled_with_timeout(timeout: Duration) -> Self {
        Self {
            enabled: true,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            period_ms: default_watchdog_period()
                .min(u64::try_from(timeout.as_millis() / 4).unwrap_or(u64::MAX))
                .max(1),
        }
    }

    /// Sets the check period.
    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    /// Gets the timeout as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Gets the check period as a Duration.
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

/// Drainer behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Collect drain data at all. When false the data phase is skipped.
    #[serde(default = "default_true")]
    pub use_drain_data: bool,
    /// Ask units to throw their residue away instead of reporting it.
    #[serde(default)]
    pub discard_drain_data: bool,
    /// Keep a per-token history of residue sizes across rounds.
    #[serde(default = "default_true")]
    pub collect_statistics: bool,
    /// Liveness watchdog.
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

fn default_true() -> bool {
    true
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            use_drain_data: true,
            discard_drain_data: false,
            collect_statistics: true,
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl DrainConfig {
    /// Creates a drain configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the watchdog configuration.
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Discards residue instead of collecting it.
    #[must_use]
    pub fn discarding(mut self) -> Self {
        self.discard_drain_data = true;
        self
    }

    /// Skips the data phase entirely.
    #[must_use]
    pub fn without_drain_data(mut self) -> Self {
        self.use_drain_data = false;
        self
    }
}

/// Per-unit execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Record init/adjust/drain timings.
    #[serde(default)]
    pub collect_timings: bool,
    /// Busy-poll attempts on an unsatisfied read before yielding the thread.
    #[serde(default = "default_spin")]
    pub spin_before_yield: u32,
}

fn default_spin() -> u32 {
    64
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            collect_timings: false,
            spin_before_yield: default_spin(),
        }
    }
}

impl UnitConfig {
    /// Enables timing collection.
    #[must_use]
    pub fn with_timings(mut self) -> Self {
        self.collect_timings = true;
        self
    }
}

/// Settings for an in-process deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Capacity of every inter-unit buffer (raised to each unit's minimum).
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Settings handed to the drainer.
    #[serde(default)]
    pub drain: DrainConfig,
}

fn default_buffer_capacity() -> usize {
    1024
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            drain: DrainConfig::default(),
        }
    }
}

impl DeploymentConfig {
    /// Sets the buffer capacity.
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Sets the drain configuration.
    #[must_use]
    pub fn with_drain(mut self, drain: DrainConfig) -> Self {
        self.drain = drain;
        self
    }
}
