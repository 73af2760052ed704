//! Error types for the drainflow runtime.
//!
//! Three families of failure exist: configuration errors raised while a
//! deployment is assembled, protocol misuse (calling the drain machinery in
//! the wrong order), and execution failures raised by worker steps.

use crate::core::{MemberId, Token};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for drainflow operations.
#[derive(Debug, Error)]
pub enum DrainflowError {
    /// The unit partition or buffer wiring is invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The drain protocol was used incorrectly.
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// Two drain snapshots claimed the same state cell.
    #[error("{0}")]
    MergeConflict(#[from] MergeConflictError),

    /// A worker step failed.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The unit's barrier was broken by a failing worker.
    #[error("Barrier broken for unit {unit}")]
    BarrierBroken {
        /// The unit whose barrier was broken.
        unit: Token,
    },

    /// The unit was aborted while a worker was waiting on a buffer.
    #[error("Unit {unit} aborted")]
    Aborted {
        /// The aborted unit.
        unit: Token,
    },

    /// A blocking wait ran past its deadline.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DrainflowError {
    /// Creates an execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

impl From<serde_json::Error> for DrainflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Metadata about a configuration error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while building a deployment: the unit graph, buffer wiring,
/// or per-unit buffer requirements.
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    /// The token graph between units contains a cycle.
    #[error("Cycle detected among units: {}", fmt_path(.path))]
    Cycle {
        /// Units forming the cycle, first unit repeated at the end.
        path: Vec<Token>,
    },

    /// Every unit has an upstream unit, so nothing can start the drain.
    #[error("No source unit: every unit has at least one predecessor")]
    NoSourceUnit,

    /// More than one unit has no predecessor.
    #[error("Multiple source units found: {}", fmt_path(.units))]
    MultipleSourceUnits {
        /// The units without predecessors.
        units: Vec<Token>,
    },

    /// Two units claim the same side of one edge.
    #[error("Token {token} is claimed as {side} by both unit {first} and unit {second}")]
    DuplicateTokenOwnership {
        /// The contested token.
        token: Token,
        /// "input" or "output".
        side: &'static str,
        /// First claiming unit.
        first: Token,
        /// Second claiming unit.
        second: Token,
    },

    /// A unit consumes no token, so it has no stable identity.
    #[error("Unit #{index} has no input tokens")]
    UnitWithoutInputs {
        /// Position of the unit in the construction input.
        index: usize,
    },

    /// A token was named that the unit neither reads nor writes.
    #[error("Token {token} is not an input or output of unit {unit}")]
    UnknownToken {
        /// The unit queried.
        unit: Token,
        /// The token that is not attached to it.
        token: Token,
    },

    /// No buffer was supplied for one of the unit's tokens.
    #[error("No buffer for token {token} of unit {unit}")]
    MissingBuffer {
        /// The unit being wired.
        unit: Token,
        /// The token without a buffer.
        token: Token,
    },

    /// The workers handed to an interpreter do not form a valid unit.
    #[error("Invalid worker set: {reason}")]
    InvalidWorkerSet {
        /// What is wrong with the set.
        reason: String,
    },

    /// A buffer is smaller than the schedule needs.
    #[error("Buffer for {token} has capacity {capacity}, but minimum is {minimum}")]
    InsufficientCapacity {
        /// The token.
        token: Token,
        /// Capacity supplied.
        capacity: usize,
        /// Capacity required.
        minimum: usize,
    },
}

impl ConfigurationError {
    /// Returns structured diagnostics for this error.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        match self {
            Self::Cycle { path } => ContractErrorInfo::new(
                "GRAPH-001-CYCLE",
                format!("Unit partition contains a cycle: {}", fmt_path(path)),
            )
            .with_context_entry("units", fmt_path(path)),
            Self::NoSourceUnit | Self::MultipleSourceUnits { .. } => ContractErrorInfo::new(
                "GRAPH-002-SOURCE",
                "A pipeline partition must have exactly one source unit",
            ),
            Self::DuplicateTokenOwnership { token, .. } => ContractErrorInfo::new(
                "GRAPH-003-OWNERSHIP",
                format!("Token {token} is owned twice"),
            )
            .with_context_entry("token", token.to_string()),
            Self::UnitWithoutInputs { index } => ContractErrorInfo::new(
                "GRAPH-004-INPUTS",
                format!("Unit #{index} has no inputs"),
            ),
            Self::InvalidWorkerSet { reason } => {
                ContractErrorInfo::new("GRAPH-004-INPUTS", reason.clone())
            }
            Self::UnknownToken { .. }
            | Self::MissingBuffer { .. }
            | Self::InsufficientCapacity { .. } => {
                ContractErrorInfo::new("UNIT-001-BUFFERS", self.to_string())
            }
        }
        .with_fix_hint_from_code()
    }
}

impl ContractErrorInfo {
    fn with_fix_hint_from_code(self) -> Self {
        match ContractSuggestions::get(&self.code) {
            Some(hint) => self.with_fix_hint(hint),
            None => self,
        }
    }
}

/// Misuse of the drain protocol. These are programmer errors and are
/// surfaced immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// `drain` was called twice on one unit.
    #[error("drain() called more than once on unit {unit}")]
    DrainAlreadyRequested {
        /// The unit.
        unit: Token,
    },

    /// `install_buffers` was called twice on one unit.
    #[error("install_buffers() called more than once on unit {unit}")]
    BuffersAlreadyInstalled {
        /// The unit.
        unit: Token,
    },

    /// The unit was used before its buffers were installed.
    #[error("Unit {unit} used before buffers were installed")]
    BuffersNotInstalled {
        /// The unit.
        unit: Token,
    },

    /// Drain data was requested before the unit finished draining.
    #[error("Unit {unit} has not finished draining")]
    DrainNotCompleted {
        /// The unit.
        unit: Token,
    },

    /// A drain round is already running.
    #[error("A drain round is already in progress")]
    DrainInProgress,

    /// A wait was started before any drain round was requested.
    #[error("No drain round has been requested")]
    NoDrainRound,

    /// The unit's drain data was already handed out.
    #[error("Drain data of unit {unit} was already taken")]
    DrainDataAlreadyTaken {
        /// The unit.
        unit: Token,
    },

    /// A unit reported drain data twice in one round.
    #[error("Multiple drain data received from unit {unit}")]
    DuplicateDrainData {
        /// The unit.
        unit: Token,
    },

    /// A notification named a unit that is not part of the graph.
    #[error("Unknown unit {unit}")]
    UnknownUnit {
        /// The unit.
        unit: Token,
    },

    /// A core index beyond the unit's core count.
    #[error("Core {core} out of range for unit {unit} with {count} cores")]
    CoreIndexOutOfRange {
        /// The unit.
        unit: Token,
        /// The index requested.
        core: usize,
        /// The number of cores.
        count: usize,
    },

    /// The unit cannot accept initial data on the given token.
    #[error("Unit {unit} cannot accept initial data for token {token}")]
    UnsupportedInitialData {
        /// The unit.
        unit: Token,
        /// The token.
        token: Token,
    },
}

/// Two snapshots captured the same state cell.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Merge conflict: state field '{field}' of member {member} captured twice")]
pub struct MergeConflictError {
    /// The member whose state collided.
    pub member: MemberId,
    /// The colliding field name.
    pub field: String,
}

impl MergeConflictError {
    /// Creates a new merge conflict error.
    #[must_use]
    pub fn new(member: MemberId, field: impl Into<String>) -> Self {
        Self {
            member,
            field: field.into(),
        }
    }
}

/// Provides default suggestions for common configuration error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "GRAPH-001-CYCLE" => Some(
                "Units must form a feed-forward pipeline. Merge the units on the cycle \
                 into one unit or repartition the stream graph.",
            ),
            "GRAPH-002-SOURCE" => Some(
                "Exactly one unit may read the overall input. Check that every other \
                 unit consumes an edge produced by another unit.",
            ),
            "GRAPH-003-OWNERSHIP" => Some(
                "Each edge token has one producer and one consumer. Check the partition \
                 for units that share workers.",
            ),
            "GRAPH-004-INPUTS" => Some("Every unit must read at least one edge."),
            "UNIT-001-BUFFERS" => Some(
                "Supply one buffer per input and output token, sized at least \
                 minimum_buffer_capacity(token).",
            ),
            _ => None,
        }
    }
}

fn fmt_path(path: &[Token]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
