//! Item-at-a-time workers run by the [`Interpreter`](super::Interpreter).

use crate::core::{FieldMap, Item, MemberId, Token};
use crate::errors::DrainflowError;
use std::collections::VecDeque;

/// Items a worker inspects and consumes on one input per firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    /// Items that must be present.
    pub peek: usize,
    /// Items removed.
    pub pop: usize,
}

impl Rate {
    /// A rate that pops what it peeks.
    #[must_use]
    pub const fn pop(count: usize) -> Self {
        Self {
            peek: count,
            pop: count,
        }
    }

    /// A rate that peeks further than it pops.
    #[must_use]
    pub const fn peek_pop(peek: usize, pop: usize) -> Self {
        Self { peek, pop }
    }

    /// Items needed before the worker can fire.
    #[must_use]
    pub const fn required(&self) -> usize {
        if self.peek > self.pop {
            self.peek
        } else {
            self.pop
        }
    }
}

/// A filter, splitter or joiner.
///
/// `inputs` and `outputs` give the worker's edges; `input_rates` lines up
/// with `inputs`. One call to `work` is one firing: it may assume every
/// input queue holds at least the required number of items and must pop
/// exactly `pop` of them.
pub trait Worker: Send {
    /// The worker's identifier.
    fn id(&self) -> MemberId;

    /// Input edges, in port order.
    fn inputs(&self) -> &[Token];

    /// Output edges, in port order.
    fn outputs(&self) -> &[Token];

    /// Per-input firing rates.
    fn input_rates(&self) -> &[Rate];

    /// Fires once.
    fn work(
        &mut self,
        inputs: &mut [VecDeque<Item>],
        outputs: &mut [VecDeque<Item>],
    ) -> Result<(), DrainflowError>;

    /// Captures non-constant fields. Stateless workers return `None`.
    fn capture_state(&self) -> Option<FieldMap> {
        None
    }

    /// Restores fields captured by [`capture_state`](Self::capture_state).
    fn restore_state(&mut self, _fields: &FieldMap) -> Result<(), DrainflowError> {
        Ok(())
    }
}
