//! Testing utilities for drainflow deployments.
//!
//! This module provides:
//! - Simple interpreter workers
//! - A compiled map unit and an in-memory input source
//! - A unit that never drains on its own
//! - Assertions over drain order and item conservation

mod assertions;
mod fixtures;
mod mocks;
mod workers;

pub use assertions::{assert_drain_order, assert_items_conserved};
pub use fixtures::{MapUnitBuilder, VecSource};
pub use mocks::StuckUnit;
pub use workers::{CountingWorker, MapWorker};
