//! The seam between the drainer and the units it drains.
//!
//! The drainer only needs three calls into the deployment; whether the units
//! live in this process or behind a network link is the backend's business.

use super::{DrainKind, Inner};
use crate::core::{DrainData, Token};
use crate::errors::{DrainflowError, ProtocolError};
use crate::runtime::InputSource;
use crate::unit::{DrainDataAction, ExecutionUnit};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Carries drain requests to units.
#[cfg_attr(test, mockall::automock)]
pub trait DrainBackend: Send + Sync {
    /// Called once at the start of a round, before any unit is asked.
    fn prepare_draining(&self, kind: DrainKind);

    /// Arms the drain of one unit. The backend reports back through
    /// `notifier` once the unit has completed locally and once its drain
    /// data is available.
    fn drain_unit(
        &self,
        unit: Token,
        action: DrainDataAction,
        notifier: DrainNotifier,
    ) -> Result<(), DrainflowError>;

    /// Called once the round's data phase has finished.
    fn draining_done(&self, kind: DrainKind);
}

/// Reports one unit's drain progress back to the drainer that asked for it.
///
/// Notifications for a round that is no longer current are dropped.
#[derive(Clone)]
pub struct DrainNotifier {
    inner: Weak<Inner>,
    round: Uuid,
    collects_data: bool,
}

impl DrainNotifier {
    pub(crate) fn new(inner: Weak<Inner>, round: Uuid, collects_data: bool) -> Self {
        Self {
            inner,
            round,
            collects_data,
        }
    }

    /// The round this notifier belongs to.
    #[must_use]
    pub fn round_id(&self) -> Uuid {
        self.round
    }

    /// Returns false if the drainer skips the data phase.
    #[must_use]
    pub fn collects_data(&self) -> bool {
        self.collects_data
    }

    /// The unit reached its drain point on every core.
    pub fn local_drain_complete(&self, unit: Token) {
        let Some(inner) = self.inner.upgrade() else {
            debug!(unit = %unit, "Drainer gone, completion dropped");
            return;
        };
        let Some(round) = inner.round_by_id(self.round) else {
            debug!(unit = %unit, round = %self.round, "Completion for a past round dropped");
            return;
        };
        if let Err(err) = inner.local_complete(&round, unit) {
            warn!(unit = %unit, error = %err, "Rejected local drain completion");
        }
    }

    /// The unit's drain data is ready.
    pub fn drain_data_ready(&self, unit: Token, data: DrainData) {
        let Some(inner) = self.inner.upgrade() else {
            debug!(unit = %unit, "Drainer gone, drain data dropped");
            return;
        };
        let Some(round) = inner.round_by_id(self.round) else {
            debug!(unit = %unit, round = %self.round, "Drain data for a past round dropped");
            return;
        };
        if let Err(err) = inner.data_ready(&round, unit, data) {
            warn!(unit = %unit, error = %err, "Rejected drain data");
        }
    }
}

impl fmt::Debug for DrainNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainNotifier")
            .field("round", &self.round)
            .field("collects_data", &self.collects_data)
            .finish_non_exhaustive()
    }
}

/// Drains units living in this process.
pub struct LocalDrainBackend {
    units: BTreeMap<Token, Arc<dyn ExecutionUnit>>,
    source: Option<Arc<dyn InputSource>>,
}

impl LocalDrainBackend {
    /// Creates a backend over `units`, keyed by their ids.
    #[must_use]
    pub fn new(units: impl IntoIterator<Item = Arc<dyn ExecutionUnit>>) -> Self {
        Self {
            units: units.into_iter().map(|u| (u.id(), u)).collect(),
            source: None,
        }
    }

    /// Sets the external source that is told to stop at each round.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn InputSource>) -> Self {
        self.source = Some(source);
        self
    }
}

impl DrainBackend for LocalDrainBackend {
    fn prepare_draining(&self, kind: DrainKind) {
        if let Some(source) = &self.source {
            source.stop(kind);
        }
    }

    fn drain_unit(
        &self,
        unit: Token,
        action: DrainDataAction,
        notifier: DrainNotifier,
    ) -> Result<(), DrainflowError> {
        let target = self
            .units
            .get(&unit)
            .ok_or(ProtocolError::UnknownUnit { unit })?;
        let handle: Weak<dyn ExecutionUnit> = Arc::downgrade(target);

        target.drain(
            action,
            Box::new(move || {
                notifier.local_drain_complete(unit);
                if !notifier.collects_data() {
                    return;
                }
                let data = match handle.upgrade().map(|u| u.take_drain_data()) {
                    Some(Ok(data)) => data,
                    Some(Err(err)) => {
                        warn!(unit = %unit, error = %err, "Drain data unavailable, reporting empty data");
                        DrainData::empty()
                    }
                    None => DrainData::empty(),
                };
                notifier.drain_data_ready(unit, data);
            }),
        )
    }

    fn draining_done(&self, kind: DrainKind) {
        debug!(%kind, units = self.units.len(), "Local draining done");
    }
}

impl fmt::Debug for LocalDrainBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDrainBackend")
            .field("units", &self.units.keys().collect::<Vec<_>>())
            .field("source", &self.source.is_some())
            .finish()
    }
}
