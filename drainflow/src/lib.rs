//! # Drainflow
//!
//! Partitioned dataflow execution with an orderly way to stop.
//!
//! A stream program is split into execution units connected by bounded
//! buffers. Each unit runs its workers on several cores kept in lockstep by
//! a phase barrier. Drainflow provides:
//!
//! - **Barrier-synchronized units**: init, steady state and drain phases
//!   guarded by two one-way gates
//! - **Unit graph**: the dependency graph of units with a single source and
//!   a topological order
//! - **Drain protocol**: the drainer drains units strictly after all of
//!   their predecessors and merges what they leave behind into one
//!   resumable [`DrainData`](core::DrainData)
//! - **Watchdog**: stuck units are forced to complete with empty data
//! - **In-process runtime**: deployments that run, pause, resume and finish
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use drainflow::prelude::*;
//!
//! let units = vec![producer, consumer];
//! let deployment = Deployment::launch(units, source, &DeploymentConfig::default(), None)?;
//!
//! // Intermediate drain: everything in flight comes back as drain data.
//! let paused = deployment.pause()?;
//!
//! // Resume in a new deployment from that data, then run to the end.
//! let deployment = Deployment::launch(next_units, next_source, &config, paused.drain_data.as_ref())?;
//! let outcome = deployment.finish()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod buffer;
pub mod config;
pub mod core;
pub mod drainer;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod runtime;
pub mod testing;
pub mod unit;

#[cfg(feature = "persistence")]
pub mod persist;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::buffer::{BoundedBuffer, Buffer, BufferMap};
    pub use crate::config::{DeploymentConfig, DrainConfig, UnitConfig, WatchdogConfig};
    pub use crate::core::{DrainData, DrainDataBuilder, FieldMap, Item, MemberId, Token};
    pub use crate::drainer::{
        DrainBackend, DrainControl, DrainKind, DrainReport, Drainer, DrainerState,
        LocalDrainBackend,
    };
    pub use crate::errors::{
        ConfigurationError, ContractErrorInfo, DrainflowError, MergeConflictError, ProtocolError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{NodeDrainState, UnitGraph};
    pub use crate::runtime::{Deployment, InputSource, RunOutcome, StopToken};
    pub use crate::unit::{
        BarrierUnit, CompiledSchedule, CoreStatus, DrainDataAction, ExecutionStatistics,
        ExecutionUnit, Interpreter, Worker,
    };
}
