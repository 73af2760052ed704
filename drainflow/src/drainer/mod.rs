//! The drain coordinator.
//!
//! A round starts at the graph's source. Each unit that completes locally
//! counts itself off at its successors; a successor whose counter reaches
//! zero is asked to drain next. Once every unit has completed the round's
//! completion latch opens, and once every unit has delivered its drain data
//! the snapshots are merged and the data latch opens.
//!
//! No lock is held across a round. Nodes move through atomic state
//! transitions; the only mutexes guard short bookkeeping updates.

mod backend;
mod control;
mod kind;
mod latch;
mod report;
mod watchdog;

#[cfg(test)]
pub(crate) use backend::MockDrainBackend;
pub use backend::{DrainBackend, DrainNotifier, LocalDrainBackend};
pub use control::DrainControl;
pub use kind::{DrainKind, DrainerState};
pub use latch::Latch;
pub use report::{DrainReport, DrainStatistics};
pub use watchdog::DrainWatchdog;

use crate::config::DrainConfig;
use crate::core::{DrainData, Token};
use crate::errors::{DrainflowError, MergeConflictError, ProtocolError};
use crate::events::{DrainEvent, EventSink, NoOpEventSink};
use crate::graph::{NodeDrainState, UnitGraph, UnitNode};
use crate::unit::DrainDataAction;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type Outcome = Result<Option<DrainData>, MergeConflictError>;

/// Bookkeeping for one drain round.
struct Round {
    id: Uuid,
    kind: DrainKind,
    action: DrainDataAction,
    started_at: DateTime<Utc>,
    started: Instant,
    completion: Latch,
    data: Latch,
    pending_local: AtomicUsize,
    pending_data: AtomicUsize,
    forced: Mutex<Vec<Token>>,
    outcome: Mutex<Option<Outcome>>,
}

impl Round {
    fn new(kind: DrainKind, action: DrainDataAction, units: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            action,
            started_at: Utc::now(),
            started: Instant::now(),
            completion: Latch::new(),
            data: Latch::new(),
            pending_local: AtomicUsize::new(units),
            pending_data: AtomicUsize::new(units),
            forced: Mutex::new(Vec::new()),
            outcome: Mutex::new(None),
        }
    }

    fn outcome(&self) -> Result<Option<DrainData>, DrainflowError> {
        match &*self.outcome.lock() {
            Some(Ok(data)) => Ok(data.clone()),
            Some(Err(conflict)) => Err(conflict.clone().into()),
            None => Ok(None),
        }
    }
}

pub(crate) struct Inner {
    graph: Arc<UnitGraph>,
    backend: Arc<dyn DrainBackend>,
    config: DrainConfig,
    state: AtomicU8,
    round: Mutex<Option<Arc<Round>>>,
    events: RwLock<Arc<dyn EventSink>>,
    statistics: DrainStatistics,
    reports: Mutex<Vec<DrainReport>>,
    watchdog: Mutex<Option<DrainWatchdog>>,
}

/// Coordinates drain rounds over a [`UnitGraph`].
///
/// Cloning is cheap; clones share the same coordinator.
#[derive(Clone)]
pub struct Drainer {
    inner: Arc<Inner>,
}

impl Drainer {
    /// Creates an idle drainer.
    #[must_use]
    pub fn new(graph: Arc<UnitGraph>, backend: Arc<dyn DrainBackend>, config: DrainConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                graph,
                backend,
                config,
                state: AtomicU8::new(DrainerState::Idle as u8),
                round: Mutex::new(None),
                events: RwLock::new(Arc::new(NoOpEventSink)),
                statistics: DrainStatistics::new(),
                reports: Mutex::new(Vec::new()),
                watchdog: Mutex::new(None),
            }),
        }
    }

    /// Sets the sink receiving drain events.
    #[must_use]
    pub fn with_event_sink(self, sink: Arc<dyn EventSink>) -> Self {
        self.set_event_sink(sink);
        self
    }

    /// Replaces the sink receiving drain events. Takes effect for the next
    /// event emitted.
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        *self.inner.events.write() = sink;
    }

    /// The graph being drained.
    #[must_use]
    pub fn graph(&self) -> &Arc<UnitGraph> {
        &self.inner.graph
    }

    /// The drainer's configuration.
    #[must_use]
    pub fn config(&self) -> &DrainConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DrainerState {
        self.inner.state()
    }

    /// Residue sizes recorded across rounds.
    #[must_use]
    pub fn statistics(&self) -> &DrainStatistics {
        &self.inner.statistics
    }

    /// Reports of every finished round, oldest first.
    #[must_use]
    pub fn reports(&self) -> Vec<DrainReport> {
        self.inner.reports.lock().clone()
    }

    /// Report of the most recent finished round.
    #[must_use]
    pub fn last_report(&self) -> Option<DrainReport> {
        self.inner.reports.lock().last().cloned()
    }

    /// Starts a drain round.
    ///
    /// Returns `Ok(false)` once the pipeline has been stopped by a
    /// semi-final or final drain, including while a final drain runs.
    /// Requesting a drain while another round runs is an error. A round
    /// runs until its drain data is merged, which may be after
    /// [`await_drain_completion`](Self::await_drain_completion) returns.
    pub fn request_drain(&self, kind: DrainKind) -> Result<bool, DrainflowError> {
        let inner = &self.inner;
        let draining = DrainerState::draining(kind) as u8;
        if let Err(actual) = inner.state.compare_exchange(
            DrainerState::Idle as u8,
            draining,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            let actual = DrainerState::from_u8(actual);
            if actual.is_stopped() || actual == DrainerState::Final {
                info!(%kind, state = ?actual, "Drain request ignored, pipeline is stopping");
                return Ok(false);
            }
            return Err(ProtocolError::DrainInProgress.into());
        }

        inner.graph.reset();
        let action = kind.action(inner.config.discard_drain_data);
        let round = Arc::new(Round::new(kind, action, inner.graph.len()));
        *inner.round.lock() = Some(round.clone());

        info!(round = %round.id, %kind, ?action, units = inner.graph.len(), "Drain requested");
        inner.emit(
            DrainEvent::Requested,
            json!({ "round": round.id, "kind": kind, "action": action }),
        );

        if inner.config.watchdog.enabled {
            let watchdog = DrainWatchdog::start(
                Arc::downgrade(inner),
                round.id,
                inner.config.watchdog.clone(),
            );
            if let Some(previous) = inner.watchdog.lock().replace(watchdog) {
                previous.stop();
            }
        }

        inner.backend.prepare_draining(kind);
        inner.drain_node(&round, inner.graph.source_id());
        Ok(true)
    }

    /// Records that `unit` completed its local drain in the current round.
    pub fn notify_local_drain_complete(&self, unit: Token) -> Result<(), ProtocolError> {
        let round = self.inner.current_round()?;
        self.inner.local_complete(&round, unit)
    }

    /// Stores `unit`'s drain data for the current round.
    pub fn notify_drain_data_ready(&self, unit: Token, data: DrainData) -> Result<(), DrainflowError> {
        let round = self.inner.current_round()?;
        self.inner.data_ready(&round, unit, data)
    }

    /// Blocks until every unit of the current round completed locally.
    ///
    /// The drainer stays busy until the round's data is merged; wait on
    /// [`await_drain_data`](Self::await_drain_data) before requesting the
    /// next round.
    pub fn await_drain_completion(&self) -> Result<(), ProtocolError> {
        self.inner.current_round()?.completion.wait();
        Ok(())
    }

    /// Like [`await_drain_completion`](Self::await_drain_completion) with a
    /// deadline.
    pub fn await_drain_completion_timeout(&self, timeout: Duration) -> Result<(), DrainflowError> {
        if self.inner.current_round()?.completion.wait_timeout(timeout) {
            Ok(())
        } else {
            Err(DrainflowError::Timeout("drain completion".to_string()))
        }
    }

    /// Blocks until the current round's merged drain data is available.
    ///
    /// Returns `None` when the drainer does not collect drain data.
    pub fn await_drain_data(&self) -> Result<Option<DrainData>, DrainflowError> {
        let round = self.inner.current_round()?;
        round.data.wait();
        round.outcome()
    }

    /// Like [`await_drain_data`](Self::await_drain_data) with a deadline.
    pub fn await_drain_data_timeout(&self, timeout: Duration) -> Result<Option<DrainData>, DrainflowError> {
        let round = self.inner.current_round()?;
        if round.data.wait_timeout(timeout) {
            round.outcome()
        } else {
            Err(DrainflowError::Timeout("drain data".to_string()))
        }
    }

    async fn wait_completion_async(&self) -> Result<(), DrainflowError> {
        let round = self.inner.current_round()?;
        round.completion.wait_async().await;
        Ok(())
    }

    async fn wait_data_async(&self) -> Result<Option<DrainData>, DrainflowError> {
        let round = self.inner.current_round()?;
        round.data.wait_async().await;
        round.outcome()
    }
}

impl fmt::Debug for Drainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drainer")
            .field("state", &self.state())
            .field("units", &self.inner.graph.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn state(&self) -> DrainerState {
        DrainerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn current_round(&self) -> Result<Arc<Round>, ProtocolError> {
        self.round.lock().clone().ok_or(ProtocolError::NoDrainRound)
    }

    fn round_by_id(&self, id: Uuid) -> Option<Arc<Round>> {
        self.round.lock().clone().filter(|round| round.id == id)
    }

    fn emit(&self, event: DrainEvent, data: serde_json::Value) {
        self.events.read().try_emit(event.as_str(), Some(data));
    }

    fn drain_node(self: &Arc<Self>, round: &Arc<Round>, unit: Token) {
        let Some(node) = self.graph.node(unit) else {
            return;
        };
        if !node.mark_requested() {
            return;
        }
        debug!(unit = %unit, round = %round.id, "Asking unit to drain");
        self.emit(
            DrainEvent::UnitRequested,
            json!({ "round": round.id, "unit": unit.to_string() }),
        );

        let notifier = DrainNotifier::new(Arc::downgrade(self), round.id, self.config.use_drain_data);
        if let Err(err) = self.backend.drain_unit(unit, round.action, notifier) {
            error!(unit = %unit, error = %err, "Backend could not drain unit, forcing completion");
            self.force(round, node);
        }
    }

    fn local_complete(self: &Arc<Self>, round: &Arc<Round>, unit: Token) -> Result<(), ProtocolError> {
        let node = self.graph.node(unit).ok_or(ProtocolError::UnknownUnit { unit })?;
        if !node.mark_completed() {
            match node.state() {
                NodeDrainState::DeadlockForced => {
                    warn!(unit = %unit, "Late completion from forced unit ignored");
                }
                state => warn!(unit = %unit, ?state, "Unexpected local completion ignored"),
            }
            return Ok(());
        }

        info!(unit = %unit, round = %round.id, "Unit drained locally");
        self.emit(
            DrainEvent::UnitCompleted,
            json!({ "round": round.id, "unit": unit.to_string() }),
        );
        self.advance(round, node);
        Ok(())
    }

    fn data_ready(self: &Arc<Self>, round: &Arc<Round>, unit: Token, data: DrainData) -> Result<(), DrainflowError> {
        if !self.config.use_drain_data {
            debug!(unit = %unit, "Drain data not collected, dropped");
            return Ok(());
        }
        let node = self.graph.node(unit).ok_or(ProtocolError::UnknownUnit { unit })?;
        if node.state() == NodeDrainState::DeadlockForced {
            warn!(unit = %unit, "Late drain data from forced unit ignored");
            return Ok(());
        }
        self.store_data(round, node, data)
    }

    /// Counts `node` off at its successors and at the round.
    fn advance(self: &Arc<Self>, round: &Arc<Round>, node: &UnitNode) {
        for successor in node.successors() {
            let ready = self
                .graph
                .node(*successor)
                .is_some_and(UnitNode::predecessor_completed);
            if ready {
                self.drain_node(round, *successor);
            }
        }

        if round.pending_local.fetch_sub(1, Ordering::AcqRel) == 1 {
            info!(round = %round.id, kind = %round.kind, "Every unit drained locally");
            self.emit(DrainEvent::Completed, json!({ "round": round.id }));
            round.completion.release();
            if !self.config.use_drain_data {
                self.finish(round, Ok(None));
            }
        }
    }

    fn force(self: &Arc<Self>, round: &Arc<Round>, node: &UnitNode) {
        if !node.mark_forced() {
            return;
        }
        let unit = node.id();
        warn!(
            unit = %unit,
            round = %round.id,
            draining_ms = node
                .draining_for()
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            "Forcing unit to complete with empty drain data"
        );
        round.forced.lock().push(unit);
        self.emit(
            DrainEvent::UnitForced,
            json!({ "round": round.id, "unit": unit.to_string() }),
        );

        self.advance(round, node);
        if self.config.use_drain_data {
            if let Err(err) = self.store_data(round, node, DrainData::empty()) {
                error!(unit = %unit, error = %err, "Could not record forced drain data");
            }
        }
    }

    /// Forces every unit of round `id` that has been draining for at least
    /// `timeout`.
    pub(crate) fn force_stuck(self: &Arc<Self>, id: Uuid, timeout: Duration) {
        let Some(round) = self.round_by_id(id) else {
            return;
        };
        for node in self.graph.nodes() {
            let stuck = node.state() == NodeDrainState::Requested
                && node.draining_for().is_some_and(|d| d >= timeout);
            if stuck {
                self.force(&round, node);
            }
        }
    }

    fn store_data(self: &Arc<Self>, round: &Arc<Round>, node: &UnitNode, data: DrainData) -> Result<(), DrainflowError> {
        node.set_drain_data(data)?;
        if round.pending_data.fetch_sub(1, Ordering::AcqRel) == 1 {
            let outcome = self.merge(round);
            self.finish(round, outcome);
        }
        Ok(())
    }

    /// Merges the nodes' data, consumers first, so a token's residue on the
    /// consumer side precedes output its producer could not push.
    fn merge(&self, round: &Round) -> Outcome {
        let mut merged = DrainData::empty();
        for id in self.graph.topological_order().iter().rev() {
            let Some(data) = self.graph.node(*id).and_then(UnitNode::take_drain_data) else {
                continue;
            };
            merged = merged.merge(&data).map_err(|conflict| {
                error!(round = %round.id, error = %conflict, "Drain data merge failed");
                conflict
            })?;
        }
        if self.config.collect_statistics {
            self.statistics.record(&merged);
        }
        Ok(Some(merged))
    }

    fn finish(&self, round: &Round, outcome: Outcome) {
        let residue_items = match &outcome {
            Ok(Some(data)) => data.item_count(),
            _ => 0,
        };
        *round.outcome.lock() = Some(outcome);
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.stop();
        }

        let report = DrainReport {
            round_id: round.id,
            kind: round.kind,
            started_at: round.started_at,
            finished_at: Utc::now(),
            duration_ms: u64::try_from(round.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            forced_units: round.forced.lock().clone(),
            residue_items,
        };
        info!(
            round = %round.id,
            kind = %round.kind,
            duration_ms = report.duration_ms,
            forced = report.forced_units.len(),
            residue_items,
            "Drain round finished"
        );
        self.reports.lock().push(report);

        // Draining state holds until the data phase ends.
        self.state
            .store(DrainerState::after(round.kind) as u8, Ordering::Release);
        self.backend.draining_done(round.kind);
        self.emit(
            DrainEvent::DataReady,
            json!({ "round": round.id, "items": residue_items }),
        );
        round.data.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;
    use crate::core::{FieldMap, MemberId};
    use crate::events::CollectingEventSink;
    use crate::testing::StuckUnit;
    use crate::unit::ExecutionUnit;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    type Calls = Arc<Mutex<Vec<(Token, DrainDataAction, DrainNotifier)>>>;

    fn t(a: i32, b: i32) -> Token {
        Token::new(a, b)
    }

    fn graph(edges: &[(&[Token], &[Token])]) -> Arc<UnitGraph> {
        let units: Vec<Arc<dyn ExecutionUnit>> = edges
            .iter()
            .map(|(ins, outs)| {
                Arc::new(StuckUnit::new(ins.iter().copied(), outs.iter().copied())) as Arc<dyn ExecutionUnit>
            })
            .collect();
        Arc::new(UnitGraph::new(units).unwrap())
    }

    fn chain() -> Arc<UnitGraph> {
        graph(&[
            (&[t(-1, 0)], &[t(0, 1)]),
            (&[t(0, 1)], &[t(1, 2)]),
            (&[t(1, 2)], &[t(2, -1)]),
        ])
    }

    /// A backend that records every request and never completes on its own.
    fn recording_backend(calls: &Calls) -> MockDrainBackend {
        let mut backend = MockDrainBackend::new();
        backend.expect_prepare_draining().return_const(());
        backend.expect_draining_done().return_const(());
        let calls = calls.clone();
        backend
            .expect_drain_unit()
            .returning(move |unit, action, notifier| {
                calls.lock().push((unit, action, notifier));
                Ok(())
            });
        backend
    }

    fn notifier(calls: &Calls, unit: Token) -> DrainNotifier {
        calls
            .lock()
            .iter()
            .find(|(u, _, _)| *u == unit)
            .map(|(_, _, n)| n.clone())
            .unwrap()
    }

    fn requested(calls: &Calls) -> Vec<Token> {
        calls.lock().iter().map(|(u, _, _)| *u).collect()
    }

    fn items(token: Token, values: &[i64]) -> DrainData {
        let mut data = BTreeMap::new();
        data.insert(token, values.iter().map(|v| json!(v)).collect());
        DrainData::new(data, BTreeMap::new())
    }

    fn complete(calls: &Calls, unit: Token, data: DrainData) {
        let notifier = notifier(calls, unit);
        notifier.local_drain_complete(unit);
        notifier.drain_data_ready(unit, data);
    }

    #[test]
    fn test_chain_drains_in_order() {
        let calls = Calls::default();
        let sink = Arc::new(CollectingEventSink::new());
        let drainer = Drainer::new(chain(), Arc::new(recording_backend(&calls)), DrainConfig::default())
            .with_event_sink(sink.clone());

        assert!(drainer.request_drain(DrainKind::Intermediate).unwrap());
        assert_eq!(drainer.state(), DrainerState::Intermediate);
        assert_eq!(requested(&calls), vec![t(-1, 0)]);
        assert_eq!(calls.lock()[0].1, DrainDataAction::SendBack);

        let err = drainer.request_drain(DrainKind::Intermediate).unwrap_err();
        assert!(matches!(err, DrainflowError::Protocol(ProtocolError::DrainInProgress)));

        complete(&calls, t(-1, 0), items(t(-1, 0), &[1]));
        assert_eq!(requested(&calls), vec![t(-1, 0), t(0, 1)]);
        complete(&calls, t(0, 1), items(t(0, 1), &[2, 3]));
        assert!(drainer
            .await_drain_completion_timeout(Duration::from_millis(10))
            .is_err());
        complete(&calls, t(1, 2), items(t(1, 2), &[]));

        drainer.await_drain_completion().unwrap();
        let data = drainer.await_drain_data().unwrap().unwrap();
        assert_eq!(data.item_count(), 3);
        assert_eq!(data.get_data(t(0, 1)).unwrap(), &[json!(2), json!(3)]);
        assert_eq!(drainer.state(), DrainerState::Idle);

        let report = drainer.last_report().unwrap();
        assert_eq!(report.kind, DrainKind::Intermediate);
        assert_eq!(report.residue_items, 3);
        assert!(report.is_clean());
        assert_eq!(drainer.statistics().sizes(t(0, 1)), vec![2]);

        assert_eq!(sink.count(DrainEvent::Requested), 1);
        assert_eq!(sink.count(DrainEvent::UnitRequested), 3);
        assert_eq!(sink.count(DrainEvent::UnitCompleted), 3);
        assert_eq!(sink.count(DrainEvent::Completed), 1);
        assert_eq!(sink.count(DrainEvent::DataReady), 1);
    }

    #[test]
    fn test_join_waits_for_every_predecessor() {
        let calls = Calls::default();
        let diamond = graph(&[
            (&[t(-1, 0)], &[t(0, 1), t(0, 2)]),
            (&[t(0, 1)], &[t(1, 3)]),
            (&[t(0, 2)], &[t(2, 3)]),
            (&[t(1, 3), t(2, 3)], &[t(3, -1)]),
        ]);
        let drainer = Drainer::new(diamond.clone(), Arc::new(recording_backend(&calls)), DrainConfig::default());
        drainer.request_drain(DrainKind::Final).unwrap();
        assert_eq!(calls.lock()[0].1, DrainDataAction::Finish);

        complete(&calls, t(-1, 0), DrainData::empty());
        assert_eq!(requested(&calls), vec![t(-1, 0), t(0, 1), t(0, 2)]);

        complete(&calls, t(0, 1), DrainData::empty());
        let join = diamond.node(t(1, 3)).unwrap();
        assert_eq!(join.state(), NodeDrainState::NotRequested);
        assert_eq!(join.pending_predecessors(), 1);

        complete(&calls, t(0, 2), DrainData::empty());
        assert_eq!(join.state(), NodeDrainState::Requested);
        complete(&calls, t(1, 3), DrainData::empty());

        assert!(drainer.await_drain_data().unwrap().unwrap().is_empty());
        assert_eq!(drainer.state(), DrainerState::Terminated);
        assert!(!drainer.request_drain(DrainKind::Intermediate).unwrap());
    }

    #[test]
    fn test_semi_final_stops_pipeline() {
        let calls = Calls::default();
        let drainer = Drainer::new(
            graph(&[(&[t(-1, 0)], &[t(0, -1)])]),
            Arc::new(recording_backend(&calls)),
            DrainConfig::default(),
        );
        drainer.request_drain(DrainKind::SemiFinal).unwrap();
        complete(&calls, t(-1, 0), items(t(-1, 0), &[7]));

        assert_eq!(drainer.await_drain_data().unwrap().unwrap().item_count(), 1);
        assert_eq!(drainer.state(), DrainerState::Stopped);
        assert!(!drainer.request_drain(DrainKind::Final).unwrap());
    }

    #[test]
    fn test_backend_error_forces_unit() {
        let mut backend = MockDrainBackend::new();
        backend.expect_prepare_draining().times(1).return_const(());
        backend.expect_draining_done().times(1).return_const(());
        backend
            .expect_drain_unit()
            .times(1)
            .returning(|unit, _, _| Err(ProtocolError::UnknownUnit { unit }.into()));

        let drainer = Drainer::new(
            graph(&[(&[t(-1, 0)], &[t(0, -1)])]),
            Arc::new(backend),
            DrainConfig::default(),
        );
        drainer.request_drain(DrainKind::Intermediate).unwrap();

        let data = drainer.await_drain_data_timeout(Duration::from_secs(1)).unwrap();
        assert!(data.unwrap().is_empty());
        assert_eq!(drainer.last_report().unwrap().forced_units, vec![t(-1, 0)]);
        assert_eq!(drainer.state(), DrainerState::Idle);
    }

    #[test]
    fn test_without_drain_data_finishes_at_local_completion() {
        let calls = Calls::default();
        let drainer = Drainer::new(
            graph(&[(&[t(-1, 0)], &[t(0, -1)])]),
            Arc::new(recording_backend(&calls)),
            DrainConfig::default().without_drain_data(),
        );
        drainer.request_drain(DrainKind::Intermediate).unwrap();
        let notifier = notifier(&calls, t(-1, 0));
        assert!(!notifier.collects_data());
        notifier.local_drain_complete(t(-1, 0));

        assert_eq!(drainer.await_drain_data().unwrap(), None);
        assert_eq!(drainer.state(), DrainerState::Idle);
    }

    #[test]
    fn test_discard_uses_discard_action() {
        let calls = Calls::default();
        let drainer = Drainer::new(
            graph(&[(&[t(-1, 0)], &[t(0, -1)])]),
            Arc::new(recording_backend(&calls)),
            DrainConfig::default().discarding(),
        );
        drainer.request_drain(DrainKind::Intermediate).unwrap();
        assert_eq!(calls.lock()[0].1, DrainDataAction::Discard);
    }

    #[test]
    fn test_merge_conflict_surfaces() {
        let calls = Calls::default();
        let drainer = Drainer::new(
            graph(&[(&[t(-1, 0)], &[t(0, 1)]), (&[t(0, 1)], &[t(1, -1)])]),
            Arc::new(recording_backend(&calls)),
            DrainConfig::default(),
        );
        let state = |value: i64| {
            let mut fields = FieldMap::new();
            fields.insert("count".to_string(), json!(value));
            let mut rows = BTreeMap::new();
            rows.insert(MemberId(1), fields);
            DrainData::new(BTreeMap::new(), rows)
        };

        drainer.request_drain(DrainKind::Intermediate).unwrap();
        complete(&calls, t(-1, 0), state(1));
        complete(&calls, t(0, 1), state(2));

        let err = drainer.await_drain_data().unwrap_err();
        assert!(matches!(err, DrainflowError::MergeConflict(_)));
        assert_eq!(drainer.state(), DrainerState::Idle);
    }

    #[test]
    fn test_duplicate_data_rejected() {
        let calls = Calls::default();
        let drainer = Drainer::new(chain(), Arc::new(recording_backend(&calls)), DrainConfig::default());
        drainer.request_drain(DrainKind::Intermediate).unwrap();
        drainer.notify_local_drain_complete(t(-1, 0)).unwrap();
        drainer.notify_drain_data_ready(t(-1, 0), DrainData::empty()).unwrap();

        let err = drainer
            .notify_drain_data_ready(t(-1, 0), DrainData::empty())
            .unwrap_err();
        assert!(matches!(
            err,
            DrainflowError::Protocol(ProtocolError::DuplicateDrainData { .. })
        ));
        assert_eq!(
            drainer.notify_local_drain_complete(t(9, 9)).unwrap_err(),
            ProtocolError::UnknownUnit { unit: t(9, 9) }
        );
    }

    #[test]
    fn test_busy_until_data_merged() {
        let drainer = Drainer::new(
            graph(&[(&[t(-1, 0)], &[t(0, -1)])]),
            Arc::new(recording_backend(&Calls::default())),
            DrainConfig::default(),
        );
        drainer.request_drain(DrainKind::Intermediate).unwrap();
        drainer.notify_local_drain_complete(t(-1, 0)).unwrap();
        drainer.await_drain_completion().unwrap();

        assert_eq!(drainer.state(), DrainerState::draining(DrainKind::Intermediate));
        assert!(matches!(
            drainer.request_drain(DrainKind::Intermediate).unwrap_err(),
            DrainflowError::Protocol(ProtocolError::DrainInProgress)
        ));

        drainer.notify_drain_data_ready(t(-1, 0), items(t(-1, 0), &[1])).unwrap();
        assert_eq!(drainer.await_drain_data().unwrap().unwrap().item_count(), 1);
        assert_eq!(drainer.state(), DrainerState::Idle);
        assert!(drainer.request_drain(DrainKind::Intermediate).unwrap());
    }

    #[test]
    fn test_wait_before_any_round() {
        let calls = Calls::default();
        let drainer = Drainer::new(chain(), Arc::new(recording_backend(&calls)), DrainConfig::default());
        assert_eq!(drainer.await_drain_completion().unwrap_err(), ProtocolError::NoDrainRound);
        assert!(drainer.await_drain_data().is_err());
    }

    #[test]
    fn test_watchdog_forces_stuck_unit() {
        let stuck = Arc::new(StuckUnit::new([t(-1, 0)], [t(0, -1)]));
        let units: Vec<Arc<dyn ExecutionUnit>> = vec![stuck.clone()];
        let graph = Arc::new(UnitGraph::new(units.clone()).unwrap());
        let config = DrainConfig::default()
            .with_watchdog(WatchdogConfig::enabled_with_timeout(Duration::from_millis(50)));
        let sink = Arc::new(CollectingEventSink::new());
        let drainer = Drainer::new(graph, Arc::new(LocalDrainBackend::new(units)), config)
            .with_event_sink(sink.clone());

        drainer.request_drain(DrainKind::Intermediate).unwrap();
        drainer
            .await_drain_completion_timeout(Duration::from_secs(5))
            .unwrap();
        let data = drainer.await_drain_data_timeout(Duration::from_secs(5)).unwrap();
        assert!(data.unwrap().is_empty());
        assert_eq!(drainer.last_report().unwrap().forced_units, vec![t(-1, 0)]);
        assert_eq!(sink.count(DrainEvent::UnitForced), 1);

        // The unit finally completes; the round is already over.
        stuck.release();
        assert_eq!(drainer.reports().len(), 1);
        assert_eq!(drainer.state(), DrainerState::Idle);
    }

    #[tokio::test]
    async fn test_async_waiters() {
        let calls = Calls::default();
        let drainer = Drainer::new(chain(), Arc::new(recording_backend(&calls)), DrainConfig::default());
        assert!(DrainControl::request_drain(&drainer, DrainKind::Intermediate).await.unwrap());

        let waiter = {
            let drainer = drainer.clone();
            tokio::spawn(async move { drainer.drain_data().await })
        };
        for unit in [t(-1, 0), t(0, 1), t(1, 2)] {
            complete(&calls, unit, items(unit, &[1]));
        }
        drainer.drain_completed().await.unwrap();

        let data = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(data.item_count(), 3);
    }
}
