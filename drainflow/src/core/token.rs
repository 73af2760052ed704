//! Edge and member identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a logical edge between two workers.
///
/// A token names the edge by the identifiers of its upstream and downstream
/// workers. The overall input of the stream graph has no upstream worker and
/// the overall output has no downstream worker; both use `-1` for the
/// missing side. Tokens are ordered lexicographically by (upstream,
/// downstream), which makes the overall input the smallest token of the
/// graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token {
    upstream: i32,
    downstream: i32,
}

impl Token {
    /// Creates a token for the edge between two workers.
    #[must_use]
    pub const fn new(upstream: i32, downstream: i32) -> Self {
        Self {
            upstream,
            downstream,
        }
    }

    /// Token of the edge feeding the first worker of the stream graph.
    #[must_use]
    pub const fn overall_input(first_worker: i32) -> Self {
        Self::new(-1, first_worker)
    }

    /// Token of the edge leaving the last worker of the stream graph.
    #[must_use]
    pub const fn overall_output(last_worker: i32) -> Self {
        Self::new(last_worker, -1)
    }

    /// Upstream worker id, `-1` for the overall input.
    #[must_use]
    pub const fn upstream(&self) -> i32 {
        self.upstream
    }

    /// Downstream worker id, `-1` for the overall output.
    #[must_use]
    pub const fn downstream(&self) -> i32 {
        self.downstream
    }

    /// Returns true if this is the overall input edge.
    #[must_use]
    pub const fn is_overall_input(&self) -> bool {
        self.upstream < 0
    }

    /// Returns true if this is the overall output edge.
    #[must_use]
    pub const fn is_overall_output(&self) -> bool {
        self.downstream < 0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}, {})", self.upstream, self.downstream)
    }
}

/// Identifier of a worker (filter, splitter or joiner) inside a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub u32);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
