//! Running units in this process.
//!
//! A [`Deployment`] owns the buffers between units, one [`UnitExecutor`]
//! per unit and a feeder thread moving items between an [`InputSource`]
//! and the graph's boundary buffers. Its drainer is a regular
//! [`Drainer`](crate::drainer::Drainer) over a
//! [`LocalDrainBackend`](crate::drainer::LocalDrainBackend).

mod deployment;
mod executor;
mod source;
mod stop;

#[cfg(test)]
mod integration_tests;

pub use deployment::{Deployment, RunOutcome};
pub use executor::UnitExecutor;
pub use source::InputSource;
pub use stop::{StopCallback, StopToken};
