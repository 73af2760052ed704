//! An in-process deployment: units, their buffers, their threads and the
//! drainer that stops them.

use super::{InputSource, StopToken, UnitExecutor};
use crate::buffer::{BoundedBuffer, Buffer, BufferMap};
use crate::config::DeploymentConfig;
use crate::core::{DrainData, Item, Token};
use crate::drainer::{DrainKind, DrainReport, Drainer, LocalDrainBackend};
use crate::errors::{DrainflowError, ProtocolError};
use crate::graph::UnitGraph;
use crate::unit::{Backoff, ExecutionStatistics, ExecutionUnit};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a deployment leaves behind once it has been drained and shut down.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Merged drain data of the final round, if one ran and kept data.
    pub drain_data: Option<DrainData>,
    /// Items collected from the tail buffers, keyed by tail token.
    pub emitted: BTreeMap<Token, Vec<Item>>,
    /// Report of the final round.
    pub report: Option<DrainReport>,
    /// Per-unit statistics at shutdown.
    pub statistics: BTreeMap<Token, ExecutionStatistics>,
}

impl RunOutcome {
    /// Emitted items of one tail token.
    #[must_use]
    pub fn emitted_on(&self, token: Token) -> &[Item] {
        self.emitted.get(&token).map_or(&[], Vec::as_slice)
    }
}

/// Drains the tail buffers into per-token vectors.
#[derive(Debug)]
struct Collector {
    tails: BufferMap,
    items: Mutex<BTreeMap<Token, Vec<Item>>>,
}

impl Collector {
    fn collect(&self) -> usize {
        let mut moved = 0;
        for (token, buffer) in &self.tails {
            let items = buffer.read_all();
            if !items.is_empty() {
                moved += items.len();
                self.items.lock().entry(*token).or_default().extend(items);
            }
        }
        moved
    }
}

/// A running set of units wired through bounded buffers.
///
/// `launch` assembles the graph, sizes and seeds the buffers, restores the
/// units from an earlier drain and starts one thread per core plus a
/// feeder thread that pumps the source into the head buffers and collects
/// the tail buffers. The deployment is stopped with [`finish`](Self::finish)
/// (a final drain once the source runs dry), [`pause`](Self::pause) (an
/// intermediate drain handing back resumable data) or
/// [`shutdown`](Self::shutdown).
pub struct Deployment {
    graph: Arc<UnitGraph>,
    drainer: Drainer,
    buffers: BufferMap,
    source: Arc<dyn InputSource>,
    stop: Arc<StopToken>,
    executors: Vec<UnitExecutor>,
    feeder: Option<JoinHandle<()>>,
    output: Arc<Collector>,
}

impl Deployment {
    /// Assembles and starts a deployment.
    ///
    /// `initial` is the merged drain data of a previous configuration. Items
    /// for buffer tokens are placed in the buffers, items for internal
    /// tokens and member state go to the owning unit.
    pub fn launch(
        units: Vec<Arc<dyn ExecutionUnit>>,
        source: Arc<dyn InputSource>,
        config: &DeploymentConfig,
        initial: Option<&DrainData>,
    ) -> Result<Self, DrainflowError> {
        let graph = Arc::new(UnitGraph::new(units.clone())?);
        let initial = initial.cloned().unwrap_or_default();
        check_initial(&graph, &initial)?;

        let buffers = build_buffers(&graph, config.buffer_capacity, &initial)?;
        for node in graph.nodes() {
            let unit = node.unit();
            if !initial.is_empty() {
                let members = unit.members();
                unit.insert_drain_data(&initial.subset(&unit.internal_tokens(), &members))?;
            }
            unit.install_buffers(&buffers)?;
        }

        let backend = LocalDrainBackend::new(units).with_source(source.clone());
        let drainer = Drainer::new(graph.clone(), Arc::new(backend), config.drain.clone());

        let stop = Arc::new(StopToken::new());
        let mut executors = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            match UnitExecutor::spawn(node.unit().clone(), &stop) {
                Ok(executor) => executors.push(executor),
                Err(err) => {
                    stop.stop("launch failed");
                    return Err(err);
                }
            }
        }

        let head: BufferMap = select(&buffers, graph.head_tokens());
        let output = Arc::new(Collector {
            tails: select(&buffers, graph.tail_tokens()),
            items: Mutex::new(BTreeMap::new()),
        });
        let feeder = {
            let (source, output, stop) = (source.clone(), output.clone(), stop.clone());
            std::thread::Builder::new()
                .name("drainflow-feeder".to_string())
                .spawn(move || feed(source.as_ref(), &head, &output, &stop))
        };
        let feeder = match feeder {
            Ok(handle) => handle,
            Err(err) => {
                stop.stop("launch failed");
                return Err(err.into());
            }
        };

        info!(
            units = graph.len(),
            buffers = buffers.len(),
            restored_items = initial.item_count(),
            "Deployment launched"
        );
        Ok(Self {
            graph,
            drainer,
            buffers,
            source,
            stop,
            executors,
            feeder: Some(feeder),
            output,
        })
    }

    /// The unit graph.
    #[must_use]
    pub fn graph(&self) -> &Arc<UnitGraph> {
        &self.graph
    }

    /// The drainer coordinating this deployment.
    #[must_use]
    pub fn drainer(&self) -> &Drainer {
        &self.drainer
    }

    /// The buffer installed for `token`.
    #[must_use]
    pub fn buffer(&self, token: Token) -> Option<&Arc<dyn Buffer>> {
        self.buffers.get(&token)
    }

    /// Items collected from the tail buffers so far.
    #[must_use]
    pub fn emitted(&self) -> BTreeMap<Token, Vec<Item>> {
        self.output.collect();
        self.output.items.lock().clone()
    }

    /// Returns true if any core has failed.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.executors.iter().any(UnitExecutor::has_failed)
    }

    /// Runs one drain round and waits for its data.
    ///
    /// Returns `Ok(None)` if the drainer refused the round because the
    /// deployment is already stopped, or if the drainer skips drain data.
    pub fn drain(&self, kind: DrainKind) -> Result<Option<DrainData>, DrainflowError> {
        if !self.drainer.request_drain(kind)? {
            debug!(%kind, state = ?self.drainer.state(), "Drain request refused");
            return Ok(None);
        }
        self.drainer.await_drain_data()
    }

    /// Waits until the source runs dry or a core fails.
    pub fn wait_exhausted(&self) {
        let mut backoff = Backoff::new(0);
        while !self.source.is_exhausted() && !self.has_failed() && !self.stop.is_stopped() {
            backoff.snooze();
        }
    }

    /// Lets the source run dry, drains with [`DrainKind::Final`] and shuts
    /// down.
    pub fn finish(mut self) -> Result<RunOutcome, DrainflowError> {
        self.wait_exhausted();
        let data = self.drain(DrainKind::Final)?;
        self.outcome(data)
    }

    /// Drains with [`DrainKind::Intermediate`] and shuts down. The returned
    /// drain data resumes the stream in a new deployment.
    pub fn pause(self) -> Result<RunOutcome, DrainflowError> {
        self.drain_and_shutdown(DrainKind::Intermediate)
    }

    /// Drains with `kind` without waiting for the source, then shuts down.
    pub fn drain_and_shutdown(mut self, kind: DrainKind) -> Result<RunOutcome, DrainflowError> {
        let data = self.drain(kind)?;
        self.outcome(data)
    }

    fn outcome(&mut self, drain_data: Option<DrainData>) -> Result<RunOutcome, DrainflowError> {
        let statistics = self
            .graph
            .nodes()
            .map(|node| (node.id(), node.unit().execution_statistics()))
            .collect();
        self.shutdown()?;
        Ok(RunOutcome {
            drain_data,
            emitted: std::mem::take(&mut *self.output.items.lock()),
            report: self.drainer.last_report(),
            statistics,
        })
    }

    /// Stops every thread without draining and returns the first core
    /// failure. Units still running are aborted. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), DrainflowError> {
        if self.stop.stop("shutdown") {
            debug!("Deployment shutting down");
        }
        if let Some(feeder) = self.feeder.take() {
            if feeder.join().is_err() {
                error!("Feeder thread panicked");
            }
        }
        let mut first = None;
        for executor in self.executors.drain(..) {
            let unit = executor.unit();
            if let Err(err) = executor.join() {
                warn!(unit = %unit, error = %err, "Unit stopped with an error");
                first.get_or_insert(err);
            }
        }
        self.output.collect();
        first.map_or(Ok(()), Err)
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "Deployment dropped with a failed unit");
        }
    }
}

impl fmt::Debug for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deployment")
            .field("units", &self.graph.topological_order())
            .field("buffers", &self.buffers.keys().collect::<Vec<_>>())
            .field("state", &self.drainer.state())
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

fn check_initial(graph: &UnitGraph, initial: &DrainData) -> Result<(), ProtocolError> {
    let mut known = graph.buffer_tokens();
    for node in graph.nodes() {
        known.extend(node.unit().internal_tokens());
    }
    let stray = initial
        .data()
        .iter()
        .find(|(token, items)| !items.is_empty() && !known.contains(*token));
    if let Some((token, _)) = stray {
        return Err(ProtocolError::UnsupportedInitialData {
            unit: graph.source_id(),
            token: *token,
        });
    }

    let members: BTreeSet<_> = graph.nodes().flat_map(|n| n.unit().members()).collect();
    for member in initial.state().keys().filter(|m| !members.contains(*m)) {
        warn!(member = %member, "Initial state for an unknown member ignored");
    }
    Ok(())
}

fn build_buffers(graph: &UnitGraph, capacity: usize, initial: &DrainData) -> Result<BufferMap, DrainflowError> {
    let mut buffers = BufferMap::new();
    for token in graph.buffer_tokens() {
        let mut minimum = 1;
        for node in graph.nodes() {
            let unit = node.unit();
            if unit.inputs().contains(&token) || unit.outputs().contains(&token) {
                minimum = minimum.max(unit.minimum_buffer_capacity(token)?);
            }
        }
        let capacity = capacity.max(minimum);
        let buffer: Arc<dyn Buffer> = match initial.get_data(token) {
            Some(items) if !items.is_empty() => Arc::new(BoundedBuffer::with_items(capacity, items.to_vec())),
            _ => Arc::new(BoundedBuffer::new(capacity)),
        };
        debug!(token = %token, capacity = buffer.capacity(), seeded = buffer.size(), "Buffer created");
        buffers.insert(token, buffer);
    }
    Ok(buffers)
}

fn select(buffers: &BufferMap, tokens: &BTreeSet<Token>) -> BufferMap {
    tokens
        .iter()
        .filter_map(|token| buffers.get(token).map(|b| (*token, b.clone())))
        .collect()
}

fn feed(source: &dyn InputSource, head: &BufferMap, output: &Collector, stop: &StopToken) {
    let mut backoff = Backoff::new(16);
    let mut pumped = 0_usize;
    while !stop.is_stopped() {
        let offered = source.pump(head);
        pumped += offered;
        if offered + output.collect() == 0 {
            backoff.snooze();
        } else {
            backoff = Backoff::new(16);
        }
    }
    debug!(pumped, pending = head.values().map(|b| b.size()).sum::<usize>(), "Feeder stopped");
}
