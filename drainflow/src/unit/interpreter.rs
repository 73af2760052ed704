//! Single-core unit that runs workers one firing at a time.
//!
//! Items move between workers through in-memory channels. Each run pulls the
//! unit's sinks: a worker whose inputs are short first fires its producer, or
//! reads one item from an input buffer if the edge crosses the unit boundary.
//! Because the interpreter only ever waits on its own buffers it can finish
//! any residue a compiled schedule leaves behind.

use super::{
    elapsed_ms, guarded, Backoff, CoreCode, CoreStatus, DrainCallback, DrainDataAction, DrainDataSlot,
    ExecutionStatistics, ExecutionUnit, Worker,
};
use crate::buffer::{Buffer, BufferMap};
use crate::config::UnitConfig;
use crate::core::{DrainData, DrainDataBuilder, Item, MemberId, Token};
use crate::errors::{ConfigurationError, DrainflowError, ProtocolError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

struct Engine {
    unit: Token,
    workers: Vec<Box<dyn Worker>>,
    channels: BTreeMap<Token, VecDeque<Item>>,
    producers: BTreeMap<Token, usize>,
    sinks: Vec<usize>,
    input_buffers: BTreeMap<Token, Arc<dyn Buffer>>,
    output_buffers: BTreeMap<Token, Arc<dyn Buffer>>,
    spin: u32,
}

struct Shared {
    id: Token,
    inputs: BTreeSet<Token>,
    outputs: BTreeSet<Token>,
    internal: BTreeSet<Token>,
    members: Vec<MemberId>,
    config: UnitConfig,
    engine: Mutex<Engine>,
    installed: AtomicBool,
    armed: AtomicBool,
    request: Mutex<Option<(DrainDataAction, DrainCallback)>>,
    drained: AtomicBool,
    failed: AtomicBool,
    aborted: AtomicBool,
    drain_data: Mutex<DrainDataSlot>,
    stats: Mutex<ExecutionStatistics>,
}

/// A single-core [`ExecutionUnit`] over a set of [`Worker`]s.
#[derive(Clone)]
pub struct Interpreter {
    shared: Arc<Shared>,
}

impl Interpreter {
    /// Builds an interpreter over `workers`.
    ///
    /// Edges produced and consumed inside the set become internal channels;
    /// the rest become the unit's inputs and outputs. The workers must form
    /// an acyclic graph with at least one external input.
    pub fn new(workers: Vec<Box<dyn Worker>>, config: UnitConfig) -> Result<Self, ConfigurationError> {
        if workers.is_empty() {
            return Err(invalid("an interpreter needs at least one worker"));
        }

        let mut producers: BTreeMap<Token, usize> = BTreeMap::new();
        let mut consumers: BTreeMap<Token, usize> = BTreeMap::new();
        for (index, worker) in workers.iter().enumerate() {
            if worker.inputs().len() != worker.input_rates().len() {
                return Err(invalid(format!(
                    "member {} declares {} inputs but {} rates",
                    worker.id(),
                    worker.inputs().len(),
                    worker.input_rates().len()
                )));
            }
            for token in worker.outputs() {
                if let Some(other) = producers.insert(*token, index) {
                    return Err(invalid(format!(
                        "{token} is produced by members {} and {}",
                        workers[other].id(),
                        worker.id()
                    )));
                }
            }
            for token in worker.inputs() {
                if let Some(other) = consumers.insert(*token, index) {
                    return Err(invalid(format!(
                        "{token} is consumed by members {} and {}",
                        workers[other].id(),
                        worker.id()
                    )));
                }
            }
        }

        let inputs: BTreeSet<Token> = consumers
            .keys()
            .filter(|t| !producers.contains_key(*t))
            .copied()
            .collect();
        let outputs: BTreeSet<Token> = producers
            .keys()
            .filter(|t| !consumers.contains_key(*t))
            .copied()
            .collect();
        let internal: BTreeSet<Token> = producers
            .keys()
            .filter(|t| consumers.contains_key(*t))
            .copied()
            .collect();
        let Some(&id) = inputs.first() else {
            return Err(invalid("the workers read no external input"));
        };

        check_acyclic(&workers, &internal, &consumers)?;

        let sinks = workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.outputs().iter().all(|t| !internal.contains(t)))
            .map(|(index, _)| index)
            .collect();
        let channels = inputs
            .iter()
            .chain(&outputs)
            .chain(&internal)
            .map(|t| (*t, VecDeque::new()))
            .collect();
        let members = workers.iter().map(|w| w.id()).collect();
        let internal_producers = producers
            .into_iter()
            .filter(|(t, _)| internal.contains(t))
            .collect();

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                inputs,
                outputs,
                internal,
                members,
                engine: Mutex::new(Engine {
                    unit: id,
                    workers,
                    channels,
                    producers: internal_producers,
                    sinks,
                    input_buffers: BTreeMap::new(),
                    output_buffers: BTreeMap::new(),
                    spin: config.spin_before_yield,
                }),
                config,
                installed: AtomicBool::new(false),
                armed: AtomicBool::new(false),
                request: Mutex::new(None),
                drained: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                drain_data: Mutex::new(DrainDataSlot::Pending),
                stats: Mutex::new(ExecutionStatistics::default()),
            }),
        })
    }

    /// Builds an interpreter and seeds it with residue from a drain.
    pub fn with_initial(
        workers: Vec<Box<dyn Worker>>,
        config: UnitConfig,
        initial: &DrainData,
    ) -> Result<Self, DrainflowError> {
        let interpreter = Self::new(workers, config)?;
        interpreter.insert_drain_data(initial)?;
        Ok(interpreter)
    }

    /// Runs everything the residue allows, flushes the outputs and returns
    /// what is left. Used by a compiled unit to finish its residue inline.
    pub(crate) fn drain_now(&self, action: DrainDataAction) -> Result<DrainData, DrainflowError> {
        let data = self.shared.engine.lock().finish(action, &self.shared.aborted)?;
        self.shared.drained.store(true, Ordering::Release);
        Ok(data)
    }
}

impl Shared {
    fn run_core(&self) -> Result<CoreStatus, DrainflowError> {
        if self.drained.load(Ordering::Acquire) {
            return Ok(CoreStatus::Drained);
        }
        if self.aborted.load(Ordering::Acquire) {
            return Err(DrainflowError::Aborted { unit: self.id });
        }
        if !self.installed.load(Ordering::Acquire) {
            return Err(ProtocolError::BuffersNotInstalled { unit: self.id }.into());
        }
        if self.failed.load(Ordering::Acquire) {
            return Err(DrainflowError::execution(format!("unit {} has failed", self.id)));
        }

        let request = if self.armed.load(Ordering::Acquire) {
            self.request.lock().take()
        } else {
            None
        };
        let result = match request {
            Some((action, callback)) => self.drain_with(action, callback),
            None => self.step(),
        };
        if let Err(err) = &result {
            if !matches!(err, DrainflowError::Aborted { .. }) {
                self.fail(err);
            }
        }
        result
    }

    fn step(&self) -> Result<CoreStatus, DrainflowError> {
        let mut engine = self.engine.lock();
        let fired = engine.interpret_pass()?;
        engine.push_outputs();
        if fired {
            self.stats.lock().steady_steps += 1;
            return Ok(CoreStatus::Progress);
        }
        Ok(CoreStatus::Idle)
    }

    /// Finishes the residue and signals completion. A failure while
    /// finishing still completes the drain, with empty data.
    fn drain_with(&self, action: DrainDataAction, callback: DrainCallback) -> Result<CoreStatus, DrainflowError> {
        let started = Instant::now();
        let finished = self.engine.lock().finish(action, &self.aborted);
        let (data, outcome) = match finished {
            Ok(data) => (data, Ok(CoreStatus::Drained)),
            Err(err) => {
                warn!(unit = %self.id, error = %err, "Interpreter drain failed, reporting empty data");
                (DrainData::empty(), Err(err))
            }
        };

        debug!(unit = %self.id, items = data.item_count(), "Interpreter drained");
        if self.config.collect_timings {
            self.stats.lock().drain_time_ms = elapsed_ms(started);
        }
        self.complete(data, callback);
        outcome
    }

    fn complete(&self, data: DrainData, callback: DrainCallback) {
        self.drain_data.lock().fill(data);
        self.drained.store(true, Ordering::Release);
        callback();
    }

    /// Marks the unit failed. A drain armed but not yet started completes
    /// at once with empty data.
    fn fail(&self, err: &DrainflowError) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(unit = %self.id, error = %err, "Interpreter failed");
        let pending = self.request.lock().take();
        if let Some((_, callback)) = pending {
            warn!(unit = %self.id, "Completing armed drain of failed unit with empty data");
            self.complete(DrainData::empty(), callback);
        }
    }
}

impl Engine {
    /// Pulls every sink once. Returns true if any sink fired.
    fn interpret_pass(&mut self) -> Result<bool, DrainflowError> {
        let mut fired = false;
        for sink in self.sinks.clone() {
            fired |= self.pull(sink)?;
        }
        Ok(fired)
    }

    fn pull(&mut self, target: usize) -> Result<bool, DrainflowError> {
        let mut stack = vec![target];
        while let Some(&current) = stack.last() {
            match self.unsatisfied_input(current) {
                None => {
                    self.fire(current)?;
                    stack.pop();
                }
                Some(token) => {
                    if let Some(&producer) = self.producers.get(&token) {
                        stack.push(producer);
                        continue;
                    }
                    let Some(item) = self.input_buffers.get(&token).and_then(|b| b.read()) else {
                        return Ok(false);
                    };
                    self.channels.entry(token).or_default().push_back(item);
                }
            }
        }
        Ok(true)
    }

    fn unsatisfied_input(&self, index: usize) -> Option<Token> {
        let worker = &self.workers[index];
        worker
            .inputs()
            .iter()
            .zip(worker.input_rates())
            .find(|(token, rate)| self.channels.get(*token).map_or(0, VecDeque::len) < rate.required())
            .map(|(token, _)| *token)
    }

    fn fire(&mut self, index: usize) -> Result<(), DrainflowError> {
        let Self {
            unit,
            workers,
            channels,
            ..
        } = self;
        let worker = &mut workers[index];
        let in_tokens = worker.inputs().to_vec();
        let out_tokens = worker.outputs().to_vec();

        let mut ins: Vec<VecDeque<Item>> = in_tokens
            .iter()
            .map(|t| channels.get_mut(t).map(std::mem::take).unwrap_or_default())
            .collect();
        let mut outs = vec![VecDeque::new(); out_tokens.len()];

        let result = guarded(*unit, || worker.work(&mut ins, &mut outs));
        for (token, queue) in in_tokens.into_iter().zip(ins) {
            channels.insert(token, queue);
        }
        result?;
        for (token, queue) in out_tokens.into_iter().zip(outs) {
            channels.entry(token).or_default().extend(queue);
        }
        Ok(())
    }

    /// Writes what fits to every output buffer, round-robin.
    fn push_outputs(&mut self) -> bool {
        let mut all_flushed = true;
        for (token, buffer) in &self.output_buffers {
            if let Some(channel) = self.channels.get_mut(token) {
                buffer.write(channel);
                all_flushed &= channel.is_empty();
            }
        }
        all_flushed
    }

    fn flush_outputs(&mut self, aborted: &AtomicBool) -> Result<(), DrainflowError> {
        let mut backoff = Backoff::new(self.spin);
        while !self.push_outputs() {
            if aborted.load(Ordering::Acquire) {
                return Err(DrainflowError::Aborted { unit: self.unit });
            }
            backoff.snooze();
        }
        Ok(())
    }

    fn finish(&mut self, action: DrainDataAction, aborted: &AtomicBool) -> Result<DrainData, DrainflowError> {
        if !action.keeps_data() {
            for channel in self.channels.values_mut() {
                channel.clear();
            }
            return Ok(DrainData::empty());
        }

        while self.interpret_pass()? {
            self.push_outputs();
        }
        self.flush_outputs(aborted)?;
        self.collect()
    }

    fn collect(&mut self) -> Result<DrainData, DrainflowError> {
        let mut builder = DrainDataBuilder::new();
        for (token, channel) in &mut self.channels {
            builder.touch(*token).extend_items(*token, channel.drain(..));
        }
        for (token, buffer) in &self.input_buffers {
            builder.extend_items(*token, buffer.read_all());
        }
        for worker in &self.workers {
            if let Some(fields) = worker.capture_state() {
                builder.put_state(worker.id(), fields)?;
            }
        }
        Ok(builder.build())
    }
}

impl ExecutionUnit for Interpreter {
    fn id(&self) -> Token {
        self.shared.id
    }

    fn inputs(&self) -> &BTreeSet<Token> {
        &self.shared.inputs
    }

    fn outputs(&self) -> &BTreeSet<Token> {
        &self.shared.outputs
    }

    fn internal_tokens(&self) -> BTreeSet<Token> {
        self.shared.internal.clone()
    }

    fn members(&self) -> Vec<MemberId> {
        self.shared.members.clone()
    }

    fn minimum_buffer_capacity(&self, token: Token) -> Result<usize, ConfigurationError> {
        if self.shared.inputs.contains(&token) || self.shared.outputs.contains(&token) {
            Ok(1)
        } else {
            Err(ConfigurationError::UnknownToken {
                unit: self.shared.id,
                token,
            })
        }
    }

    fn install_buffers(&self, buffers: &BufferMap) -> Result<(), DrainflowError> {
        let shared = &self.shared;
        let mut engine = shared.engine.lock();
        if shared.installed.load(Ordering::Acquire) {
            return Err(ProtocolError::BuffersAlreadyInstalled { unit: shared.id }.into());
        }

        let pick = |token: &Token| {
            buffers
                .get(token)
                .cloned()
                .ok_or(ConfigurationError::MissingBuffer {
                    unit: shared.id,
                    token: *token,
                })
        };
        engine.input_buffers = shared
            .inputs
            .iter()
            .map(|t| pick(t).map(|b| (*t, b)))
            .collect::<Result<_, _>>()?;
        engine.output_buffers = shared
            .outputs
            .iter()
            .map(|t| pick(t).map(|b| (*t, b)))
            .collect::<Result<_, _>>()?;

        shared.installed.store(true, Ordering::Release);
        Ok(())
    }

    fn core_count(&self) -> usize {
        1
    }

    fn core_code(&self, core: usize) -> Result<CoreCode, ProtocolError> {
        if core != 0 {
            return Err(ProtocolError::CoreIndexOutOfRange {
                unit: self.shared.id,
                core,
                count: 1,
            });
        }
        let shared = self.shared.clone();
        Ok(Box::new(move || shared.run_core()))
    }

    fn drain(&self, action: DrainDataAction, callback: DrainCallback) -> Result<(), DrainflowError> {
        let shared = &self.shared;
        if !shared.installed.load(Ordering::Acquire) {
            return Err(ProtocolError::BuffersNotInstalled { unit: shared.id }.into());
        }
        let mut request = shared.request.lock();
        if shared.armed.load(Ordering::Acquire) {
            return Err(ProtocolError::DrainAlreadyRequested { unit: shared.id }.into());
        }
        if shared.failed.load(Ordering::Acquire) {
            shared.armed.store(true, Ordering::Release);
            drop(request);
            warn!(unit = %shared.id, "Drain requested on failed unit, completing with empty data");
            shared.complete(DrainData::empty(), callback);
            return Ok(());
        }
        *request = Some((action, callback));
        shared.armed.store(true, Ordering::Release);
        info!(unit = %shared.id, ?action, "Drain armed");
        Ok(())
    }

    fn take_drain_data(&self) -> Result<DrainData, ProtocolError> {
        self.shared.drain_data.lock().take(self.shared.id)
    }

    fn insert_drain_data(&self, initial: &DrainData) -> Result<(), DrainflowError> {
        let mut engine = self.shared.engine.lock();
        for (token, items) in initial.data() {
            let Some(channel) = engine.channels.get_mut(token) else {
                return Err(ProtocolError::UnsupportedInitialData {
                    unit: self.shared.id,
                    token: *token,
                }
                .into());
            };
            channel.extend(items.iter().cloned());
        }
        for worker in &mut engine.workers {
            if let Some(fields) = initial.member_state(worker.id()) {
                worker.restore_state(fields)?;
            }
        }
        Ok(())
    }

    fn execution_statistics(&self) -> ExecutionStatistics {
        self.shared.stats.lock().clone()
    }

    fn is_drained(&self) -> bool {
        self.shared.drained.load(Ordering::Acquire)
    }

    fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("id", &self.shared.id)
            .field("inputs", &self.shared.inputs)
            .field("outputs", &self.shared.outputs)
            .field("drained", &self.is_drained())
            .finish_non_exhaustive()
    }
}

fn invalid(reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidWorkerSet {
        reason: reason.into(),
    }
}

/// Kahn's algorithm over the internal edges.
fn check_acyclic(
    workers: &[Box<dyn Worker>],
    internal: &BTreeSet<Token>,
    consumers: &BTreeMap<Token, usize>,
) -> Result<(), ConfigurationError> {
    let mut indegree = vec![0usize; workers.len()];
    for token in internal {
        if let Some(&consumer) = consumers.get(token) {
            indegree[consumer] += 1;
        }
    }
    let mut ready: Vec<usize> = (0..workers.len()).filter(|i| indegree[*i] == 0).collect();
    let mut visited = 0;
    while let Some(index) = ready.pop() {
        visited += 1;
        for token in workers[index].outputs() {
            if !internal.contains(token) {
                continue;
            }
            if let Some(&consumer) = consumers.get(token) {
                indegree[consumer] -= 1;
                if indegree[consumer] == 0 {
                    ready.push(consumer);
                }
            }
        }
    }
    if visited == workers.len() {
        Ok(())
    } else {
        Err(invalid("the workers form a cycle"))
    }
}
