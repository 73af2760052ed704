//! One execution unit's place in the drain graph.

use crate::core::{DrainData, Token};
use crate::errors::ProtocolError;
use crate::unit::ExecutionUnit;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a node is within the current drain round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum NodeDrainState {
    /// Not asked to drain this round.
    NotRequested = 0,
    /// Asked to drain, still running.
    Requested = 1,
    /// Every core reached the drain point.
    CompletedLocal = 2,
    /// Drain data received.
    DataCollected = 3,
    /// Forced to completion by the watchdog.
    DeadlockForced = 4,
}

impl NodeDrainState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotRequested,
            1 => Self::Requested,
            2 => Self::CompletedLocal,
            3 => Self::DataCollected,
            _ => Self::DeadlockForced,
        }
    }

    /// Returns true once the node no longer blocks its successors.
    #[must_use]
    pub const fn is_complete(self) -> bool {
        matches!(
            self,
            Self::CompletedLocal | Self::DataCollected | Self::DeadlockForced
        )
    }
}

/// Wraps one unit in the [`UnitGraph`](super::UnitGraph).
///
/// Edges are fixed at construction. Only the pending-predecessor counter,
/// the drain state and the drain-data slot change during a round.
pub struct UnitNode {
    id: Token,
    unit: Arc<dyn ExecutionUnit>,
    predecessors: Vec<Token>,
    successors: Vec<Token>,
    pending_predecessors: AtomicUsize,
    state: AtomicU8,
    requested_at: Mutex<Option<Instant>>,
    drain_data: Mutex<Option<DrainData>>,
}

impl UnitNode {
    pub(crate) fn new(
        unit: Arc<dyn ExecutionUnit>,
        predecessors: Vec<Token>,
        successors: Vec<Token>,
    ) -> Self {
        let in_degree = predecessors.len();
        Self {
            id: unit.id(),
            unit,
            predecessors,
            successors,
            pending_predecessors: AtomicUsize::new(in_degree),
            state: AtomicU8::new(NodeDrainState::NotRequested as u8),
            requested_at: Mutex::new(None),
            drain_data: Mutex::new(None),
        }
    }

    /// The node's identity, its unit's smallest input token.
    #[must_use]
    pub fn id(&self) -> Token {
        self.id
    }

    /// The wrapped unit.
    #[must_use]
    pub fn unit(&self) -> &Arc<dyn ExecutionUnit> {
        &self.unit
    }

    /// Units feeding this one.
    #[must_use]
    pub fn predecessors(&self) -> &[Token] {
        &self.predecessors
    }

    /// Units fed by this one.
    #[must_use]
    pub fn successors(&self) -> &[Token] {
        &self.successors
    }

    /// Static in-degree.
    #[must_use]
    pub fn in_degree(&self) -> usize {
        self.predecessors.len()
    }

    /// Predecessors that have not completed locally this round.
    #[must_use]
    pub fn pending_predecessors(&self) -> usize {
        self.pending_predecessors.load(Ordering::Acquire)
    }

    /// Current drain state.
    #[must_use]
    pub fn state(&self) -> NodeDrainState {
        NodeDrainState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// How long the node has been draining, if it was asked to.
    #[must_use]
    pub fn draining_for(&self) -> Option<Duration> {
        (*self.requested_at.lock()).map(|at| at.elapsed())
    }

    /// Resets the per-round counters.
    pub(crate) fn reset(&self) {
        self.pending_predecessors
            .store(self.in_degree(), Ordering::Release);
        self.state
            .store(NodeDrainState::NotRequested as u8, Ordering::Release);
        *self.requested_at.lock() = None;
        *self.drain_data.lock() = None;
    }

    /// Counts one predecessor as done. Returns true for the call that
    /// brought the counter to zero.
    pub(crate) fn predecessor_completed(&self) -> bool {
        let previous = self
            .pending_predecessors
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        previous == Ok(1)
    }

    /// NOT_REQUESTED -> REQUESTED.
    pub(crate) fn mark_requested(&self) -> bool {
        let moved = self.transition(NodeDrainState::NotRequested, NodeDrainState::Requested);
        if moved {
            *self.requested_at.lock() = Some(Instant::now());
        }
        moved
    }

    /// REQUESTED -> COMPLETED_LOCAL.
    pub(crate) fn mark_completed(&self) -> bool {
        self.transition(NodeDrainState::Requested, NodeDrainState::CompletedLocal)
    }

    /// REQUESTED -> DEADLOCK_FORCED.
    pub(crate) fn mark_forced(&self) -> bool {
        self.transition(NodeDrainState::Requested, NodeDrainState::DeadlockForced)
    }

    /// Stores the unit's drain data. A second delivery in the same round is
    /// a protocol error.
    pub(crate) fn set_drain_data(&self, data: DrainData) -> Result<(), ProtocolError> {
        let mut slot = self.drain_data.lock();
        if slot.is_some() {
            return Err(ProtocolError::DuplicateDrainData { unit: self.id });
        }
        *slot = Some(data);
        drop(slot);
        self.transition(NodeDrainState::CompletedLocal, NodeDrainState::DataCollected);
        Ok(())
    }

    /// Takes the stored drain data.
    pub(crate) fn take_drain_data(&self) -> Option<DrainData> {
        self.drain_data.lock().take()
    }

    fn transition(&self, from: NodeDrainState, to: NodeDrainState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for UnitNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitNode")
            .field("id", &self.id)
            .field("predecessors", &self.predecessors)
            .field("successors", &self.successors)
            .field("pending_predecessors", &self.pending_predecessors())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
