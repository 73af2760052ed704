//! Drain kinds and the drainer's lifecycle.

use crate::unit::DrainDataAction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three ways to stop a running graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainKind {
    /// Pause for reconfiguration; the pipeline resumes from the drain data.
    Intermediate,
    /// Stop without new input; the pipeline does not resume.
    SemiFinal,
    /// Stop at the end of the data.
    Final,
}

impl DrainKind {
    /// The action units apply to their residue for this kind.
    #[must_use]
    pub const fn action(self, discard: bool) -> DrainDataAction {
        if discard {
            return DrainDataAction::Discard;
        }
        match self {
            Self::Intermediate | Self::SemiFinal => DrainDataAction::SendBack,
            Self::Final => DrainDataAction::Finish,
        }
    }

    /// Returns true if the graph stays stopped after this drain.
    #[must_use]
    pub const fn stops_pipeline(self) -> bool {
        !matches!(self, Self::Intermediate)
    }

    /// Gets the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Intermediate => "intermediate",
            Self::SemiFinal => "semi_final",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for DrainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a [`Drainer`](super::Drainer).
///
/// `Idle -> Draining(kind) -> Idle` for intermediate drains; semi-final
/// drains end in `Stopped`, final drains in `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DrainerState {
    /// No round running.
    Idle = 0,
    /// An intermediate round is running.
    Intermediate = 1,
    /// A semi-final round is running.
    SemiFinal = 2,
    /// A final round is running.
    Final = 3,
    /// A semi-final round completed.
    Stopped = 4,
    /// A final round completed.
    Terminated = 5,
}

impl DrainerState {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Intermediate,
            2 => Self::SemiFinal,
            3 => Self::Final,
            4 => Self::Stopped,
            _ => Self::Terminated,
        }
    }

    pub(crate) const fn draining(kind: DrainKind) -> Self {
        match kind {
            DrainKind::Intermediate => Self::Intermediate,
            DrainKind::SemiFinal => Self::SemiFinal,
            DrainKind::Final => Self::Final,
        }
    }

    pub(crate) const fn after(kind: DrainKind) -> Self {
        match kind {
            DrainKind::Intermediate => Self::Idle,
            DrainKind::SemiFinal => Self::Stopped,
            DrainKind::Final => Self::Terminated,
        }
    }

    /// The kind of the running round, if any.
    #[must_use]
    pub const fn running_kind(self) -> Option<DrainKind> {
        match self {
            Self::Intermediate => Some(DrainKind::Intermediate),
            Self::SemiFinal => Some(DrainKind::SemiFinal),
            Self::Final => Some(DrainKind::Final),
            Self::Idle | Self::Stopped | Self::Terminated => None,
        }
    }

    /// Returns true while a round is running.
    #[must_use]
    pub const fn is_draining(self) -> bool {
        self.running_kind().is_some()
    }

    /// Returns true once no further round can start.
    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped | Self::Terminated)
    }
}
