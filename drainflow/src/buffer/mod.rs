//! Bounded FIFO buffers connecting execution units.
//!
//! A buffer carries one edge between two units. One side writes, the other
//! reads; neither side owns it. The runtime only needs best-effort bulk
//! operations and size queries, so remote transports can implement the same
//! trait.

mod bounded;

pub use bounded::BoundedBuffer;

use crate::core::{Item, Token};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Buffers installed into a unit, keyed by edge token.
pub type BufferMap = BTreeMap<Token, Arc<dyn Buffer>>;

/// A bounded, single-producer/single-consumer FIFO of items.
///
/// Reads and writes never block. A read or write that cannot be satisfied
/// right now reports so and the caller retries on its next step.
pub trait Buffer: Send + Sync + fmt::Debug {
    /// Removes and returns the oldest item, if any.
    fn read(&self) -> Option<Item>;

    /// Removes exactly `count` items, or nothing if fewer are available.
    fn read_exact(&self, count: usize) -> Option<Vec<Item>>;

    /// Removes every item currently buffered.
    fn read_all(&self) -> Vec<Item>;

    /// Moves as many items as fit from the front of `items` into the buffer
    /// and returns how many were written.
    fn write(&self, items: &mut VecDeque<Item>) -> usize;

    /// Writes every item or none of them.
    fn write_all(&self, items: Vec<Item>) -> Result<(), Vec<Item>>;

    /// Number of buffered items.
    fn size(&self) -> usize;

    /// Maximum number of buffered items.
    fn capacity(&self) -> usize;

    /// Returns true if nothing is buffered.
    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Free slots left.
    fn room(&self) -> usize {
        self.capacity().saturating_sub(self.size())
    }
}
