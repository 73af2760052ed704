//! Drain lifecycle events.
//!
//! The drainer reports each step of a round to an [`EventSink`]. Sinks are
//! passed explicitly to the drainer; there is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The events a drain round emits, in the order they first occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrainEvent {
    /// A round started.
    Requested,
    /// A unit was asked to drain.
    UnitRequested,
    /// A unit finished its local drain.
    UnitCompleted,
    /// The watchdog forced a unit to completion.
    UnitForced,
    /// Every unit completed locally.
    Completed,
    /// The merged drain data is available.
    DataReady,
}

impl DrainEvent {
    /// The event type string handed to sinks.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "drain.requested",
            Self::UnitRequested => "drain.unit_requested",
            Self::UnitCompleted => "drain.unit_completed",
            Self::UnitForced => "drain.unit_forced",
            Self::Completed => "drain.completed",
            Self::DataReady => "drain.data_ready",
        }
    }
}

impl fmt::Display for DrainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
