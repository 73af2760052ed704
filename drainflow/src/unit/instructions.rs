//! Contracts for the pieces a code generator hands to a [`BarrierUnit`].
//!
//! The runtime only calls these; producing them is the code generator's job.
//!
//! [`BarrierUnit`]: super::BarrierUnit

use crate::buffer::BufferMap;
use crate::core::{FieldMap, Item, MemberId, Token};
use crate::errors::DrainflowError;
use std::collections::BTreeMap;

/// A step run by the barrier epilogue (init code, storage adjust,
/// migration).
pub type Step = Box<dyn FnMut() -> Result<(), DrainflowError> + Send>;

/// The steady-state step of one core. Cores run their steps concurrently,
/// so shared storage must be synchronized by the step itself.
pub type SteadyStep = Box<dyn Fn() -> Result<(), DrainflowError> + Send + Sync>;

/// Moves items from an input buffer into unit storage.
pub trait ReadInstruction: Send {
    /// Binds the instruction to its buffers.
    fn init(&mut self, buffers: &BufferMap) -> Result<(), DrainflowError>;

    /// Minimum capacity needed per token.
    fn minimum_buffer_capacity(&self) -> BTreeMap<Token, usize>;

    /// Tries to fill storage for the next round. Returns false if the buffer
    /// does not hold enough items yet; nothing is consumed in that case.
    fn load(&mut self) -> bool;

    /// Returns the items loaded by the last successful `load` that no step
    /// has consumed, keyed by token.
    fn unload(&mut self) -> BTreeMap<Token, Vec<Item>>;
}

/// Moves items from unit storage into an output buffer.
pub trait WriteInstruction: Send {
    /// Binds the instruction to its buffers.
    fn init(&mut self, buffers: &BufferMap) -> Result<(), DrainflowError>;

    /// Minimum capacity needed per token.
    fn minimum_buffer_capacity(&self) -> BTreeMap<Token, usize>;

    /// Writes as much pending output as fits. Returns true once nothing is
    /// pending.
    fn write(&mut self) -> bool;

    /// Hands out output that could not be written, keyed by token.
    fn take_pending(&mut self) -> BTreeMap<Token, Vec<Item>>;
}

/// Extracts items stranded in unit-internal storage.
pub trait DrainInstruction: Send {
    /// Removes and returns the stranded items, keyed by token.
    fn extract(&mut self) -> BTreeMap<Token, Vec<Item>>;
}

/// A worker whose fields survive a drain.
pub trait StatefulMember: Send + Sync {
    /// The member's identifier.
    fn member_id(&self) -> MemberId;

    /// Captures every non-constant field.
    fn capture_state(&self) -> FieldMap;

    /// Restores fields captured by a previous configuration.
    fn restore_state(&self, fields: &FieldMap) -> Result<(), DrainflowError>;
}
