//! The barrier-synchronized execution unit.
//!
//! Every core runs the same loop: past drain it does nothing, before init it
//! only arrives at the barrier, and in steady state it runs its step and then
//! arrives. The last core to arrive runs the epilogue for everyone:
//!
//! - before G1: init reads, init code, init writes, migrations, the first
//!   steady reads, then G1 opens;
//! - in steady state: writes, storage adjusts, the next reads.
//!
//! A read that cannot be satisfied while a drain is armed turns the epilogue
//! into the drain sequence, which ends by opening G2.

use super::instructions::{
    DrainInstruction, ReadInstruction, StatefulMember, SteadyStep, Step, WriteInstruction,
};
use super::{
    elapsed_ms, guarded, Backoff, CoreCode, CoreStatus, DrainCallback, DrainDataAction,
    DrainDataSlot, ExecutionStatistics, ExecutionUnit, Interpreter, Phase, PhaseBarrier,
    PhaseGates,
};
use crate::buffer::BufferMap;
use crate::config::UnitConfig;
use crate::core::{DrainData, DrainDataBuilder, Item, MemberId, Token};
use crate::errors::{ConfigurationError, DrainflowError, ProtocolError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Builds the interpreter that finishes a drained unit's residue.
///
/// It receives the items the compiled schedule left in its storage, keyed by
/// token, and must return an interpreter over the same input and output
/// tokens.
pub type InterpreterFactory =
    Box<dyn FnOnce(&DrainData) -> Result<Interpreter, DrainflowError> + Send>;

/// Everything a code generator produces for one unit.
pub struct CompiledSchedule {
    inputs: BTreeSet<Token>,
    outputs: BTreeSet<Token>,
    internal: BTreeSet<Token>,
    init_code: Option<Step>,
    steady_code: Vec<SteadyStep>,
    storage_adjusts: Vec<Step>,
    init_reads: Vec<Box<dyn ReadInstruction>>,
    init_writes: Vec<Box<dyn WriteInstruction>>,
    migrations: Vec<Step>,
    reads: Vec<Box<dyn ReadInstruction>>,
    writes: Vec<Box<dyn WriteInstruction>>,
    drains: Vec<Box<dyn DrainInstruction>>,
    stateful: Vec<Arc<dyn StatefulMember>>,
    fallback: Option<InterpreterFactory>,
}

impl CompiledSchedule {
    /// Creates an empty schedule over the given boundary tokens.
    #[must_use]
    pub fn new(inputs: impl IntoIterator<Item = Token>, outputs: impl IntoIterator<Item = Token>) -> Self {
        Self {
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            internal: BTreeSet::new(),
            init_code: None,
            steady_code: Vec::new(),
            storage_adjusts: Vec::new(),
            init_reads: Vec::new(),
            init_writes: Vec::new(),
            migrations: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            drains: Vec::new(),
            stateful: Vec::new(),
            fallback: None,
        }
    }

    /// Declares edges kept in unit storage.
    #[must_use]
    pub fn with_internal_tokens(mut self, tokens: impl IntoIterator<Item = Token>) -> Self {
        self.internal.extend(tokens);
        self
    }

    /// Sets the code run once before the first steady step.
    #[must_use]
    pub fn with_init_code(mut self, step: impl FnMut() -> Result<(), DrainflowError> + Send + 'static) -> Self {
        self.init_code = Some(Box::new(step));
        self
    }

    /// Adds one core running `step` every steady round.
    #[must_use]
    pub fn with_core(mut self, step: impl Fn() -> Result<(), DrainflowError> + Send + Sync + 'static) -> Self {
        self.steady_code.push(Box::new(step));
        self
    }

    /// Adds a storage adjust run between steady rounds.
    #[must_use]
    pub fn with_storage_adjust(mut self, step: impl FnMut() -> Result<(), DrainflowError> + Send + 'static) -> Self {
        self.storage_adjusts.push(Box::new(step));
        self
    }

    /// Adds a migration run once after init.
    #[must_use]
    pub fn with_migration(mut self, step: impl FnMut() -> Result<(), DrainflowError> + Send + 'static) -> Self {
        self.migrations.push(Box::new(step));
        self
    }

    /// Adds a read run before init.
    #[must_use]
    pub fn with_init_read(mut self, read: impl ReadInstruction + 'static) -> Self {
        self.init_reads.push(Box::new(read));
        self
    }

    /// Adds a write run after init.
    #[must_use]
    pub fn with_init_write(mut self, write: impl WriteInstruction + 'static) -> Self {
        self.init_writes.push(Box::new(write));
        self
    }

    /// Adds a read run before every steady round.
    #[must_use]
    pub fn with_read(mut self, read: impl ReadInstruction + 'static) -> Self {
        self.reads.push(Box::new(read));
        self
    }

    /// Adds a write run after every steady round.
    #[must_use]
    pub fn with_write(mut self, write: impl WriteInstruction + 'static) -> Self {
        self.writes.push(Box::new(write));
        self
    }

    /// Adds a drain instruction for internal storage.
    #[must_use]
    pub fn with_drain(mut self, drain: impl DrainInstruction + 'static) -> Self {
        self.drains.push(Box::new(drain));
        self
    }

    /// Registers a member whose state is captured on drain.
    #[must_use]
    pub fn with_stateful(mut self, member: Arc<dyn StatefulMember>) -> Self {
        self.stateful.push(member);
        self
    }

    /// Sets the interpreter used to finish residue on drain.
    #[must_use]
    pub fn with_fallback(
        mut self,
        factory: impl FnOnce(&DrainData) -> Result<Interpreter, DrainflowError> + Send + 'static,
    ) -> Self {
        self.fallback = Some(Box::new(factory));
        self
    }

    fn minimum_capacities(&self) -> BTreeMap<Token, usize> {
        let mut minimums: BTreeMap<Token, usize> = BTreeMap::new();
        let reads = self.init_reads.iter().chain(&self.reads).map(|r| r.minimum_buffer_capacity());
        let writes = self.init_writes.iter().chain(&self.writes).map(|w| w.minimum_buffer_capacity());
        for (token, capacity) in reads.chain(writes).flatten() {
            let entry = minimums.entry(token).or_insert(0);
            *entry = (*entry).max(capacity);
        }
        minimums
    }
}

impl fmt::Debug for CompiledSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchedule")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("cores", &self.steady_code.len())
            .field("reads", &self.reads.len())
            .field("writes", &self.writes.len())
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

/// State only the epilogue touches.
struct Epilogue {
    init_code: Option<Step>,
    init_reads: Vec<Box<dyn ReadInstruction>>,
    init_writes: Vec<Box<dyn WriteInstruction>>,
    migrations: Vec<Step>,
    storage_adjusts: Vec<Step>,
    reads: Vec<Box<dyn ReadInstruction>>,
    writes: Vec<Box<dyn WriteInstruction>>,
    drains: Vec<Box<dyn DrainInstruction>>,
    fallback: Option<InterpreterFactory>,
    buffers: BufferMap,
}

#[derive(Clone, Copy)]
enum Round {
    Init,
    Steady,
}

impl Epilogue {
    fn reads(&mut self, set: Round) -> &mut Vec<Box<dyn ReadInstruction>> {
        match set {
            Round::Init => &mut self.init_reads,
            Round::Steady => &mut self.reads,
        }
    }

    fn writes(&mut self, set: Round) -> &mut Vec<Box<dyn WriteInstruction>> {
        match set {
            Round::Init => &mut self.init_writes,
            Round::Steady => &mut self.writes,
        }
    }
}

struct Host {
    id: Token,
    inputs: BTreeSet<Token>,
    outputs: BTreeSet<Token>,
    internal: BTreeSet<Token>,
    config: UnitConfig,
    minimums: BTreeMap<Token, usize>,
    gates: PhaseGates,
    barrier: PhaseBarrier,
    steady_code: Vec<SteadyStep>,
    stateful: Vec<Arc<dyn StatefulMember>>,
    epilogue: Mutex<Epilogue>,
    installed: AtomicBool,
    armed: AtomicBool,
    request: Mutex<Option<(DrainDataAction, DrainCallback)>>,
    failed: AtomicBool,
    aborted: AtomicBool,
    drain_data: Mutex<DrainDataSlot>,
    steady_steps: AtomicU64,
    stats: Mutex<ExecutionStatistics>,
}

/// An [`ExecutionUnit`] running a [`CompiledSchedule`] on parallel cores.
#[derive(Clone)]
pub struct BarrierUnit {
    host: Arc<Host>,
}

impl BarrierUnit {
    /// Creates a unit from a compiled schedule.
    pub fn new(schedule: CompiledSchedule, config: UnitConfig) -> Result<Self, ConfigurationError> {
        let Some(&id) = schedule.inputs.first() else {
            return Err(ConfigurationError::UnitWithoutInputs { index: 0 });
        };
        if schedule.steady_code.is_empty() {
            return Err(ConfigurationError::InvalidWorkerSet {
                reason: format!("unit {id} has no cores"),
            });
        }

        let minimums = schedule.minimum_capacities();
        if let Some(token) = minimums
            .keys()
            .find(|t| !schedule.inputs.contains(*t) && !schedule.outputs.contains(*t))
        {
            return Err(ConfigurationError::UnknownToken { unit: id, token: *token });
        }

        let cores = schedule.steady_code.len();
        debug!(unit = %id, cores, "Created barrier unit");
        Ok(Self {
            host: Arc::new(Host {
                id,
                inputs: schedule.inputs,
                outputs: schedule.outputs,
                internal: schedule.internal,
                config,
                minimums,
                gates: PhaseGates::new(),
                barrier: PhaseBarrier::new(id, cores),
                steady_code: schedule.steady_code,
                stateful: schedule.stateful,
                epilogue: Mutex::new(Epilogue {
                    init_code: schedule.init_code,
                    init_reads: schedule.init_reads,
                    init_writes: schedule.init_writes,
                    migrations: schedule.migrations,
                    storage_adjusts: schedule.storage_adjusts,
                    reads: schedule.reads,
                    writes: schedule.writes,
                    drains: schedule.drains,
                    fallback: schedule.fallback,
                    buffers: BufferMap::new(),
                }),
                installed: AtomicBool::new(false),
                armed: AtomicBool::new(false),
                request: Mutex::new(None),
                failed: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                drain_data: Mutex::new(DrainDataSlot::Pending),
                steady_steps: AtomicU64::new(0),
                stats: Mutex::new(ExecutionStatistics::default()),
            }),
        })
    }

    /// The unit's phase gates.
    #[must_use]
    pub fn gates(&self) -> &PhaseGates {
        &self.host.gates
    }

    /// Returns true if a step failed.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.host.failed.load(Ordering::Acquire)
    }
}

impl Host {
    fn run_core(&self, core: usize) -> Result<CoreStatus, DrainflowError> {
        match self.gates.phase() {
            Phase::Drained => return Ok(CoreStatus::Drained),
            Phase::Init => {}
            Phase::Steady => {
                let step = &self.steady_code[core];
                if let Err(err) = guarded(self.id, || step()) {
                    self.fail(&err);
                    return Err(err);
                }
                self.steady_steps.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Err(err) = self.barrier.arrive(|| self.run_epilogue()) {
            if self.aborted.load(Ordering::Acquire) {
                return Err(DrainflowError::Aborted { unit: self.id });
            }
            self.fail(&err);
            return Err(err);
        }

        if self.gates.past_drain() {
            Ok(CoreStatus::Drained)
        } else {
            Ok(CoreStatus::Progress)
        }
    }

    fn run_epilogue(&self) -> Result<(), DrainflowError> {
        let mut epilogue = self.epilogue.lock();
        match self.gates.phase() {
            Phase::Init => self.do_init(&mut epilogue),
            Phase::Steady => self.do_adjust(&mut epilogue),
            Phase::Drained => Ok(()),
        }
    }

    fn do_init(&self, epilogue: &mut Epilogue) -> Result<(), DrainflowError> {
        let started = Instant::now();
        if self.read_or_drain(epilogue, Round::Init)? {
            return Ok(());
        }

        if let Some(init) = epilogue.init_code.as_mut() {
            guarded(self.id, || init())?;
        }
        self.write_pending(epilogue, Round::Init)?;
        for migration in &mut epilogue.migrations {
            guarded(self.id, || migration())?;
        }

        let drained = self.read_or_drain(epilogue, Round::Steady)?;
        if !drained {
            self.gates.open_init();
            debug!(unit = %self.id, "Past init");
        }
        if self.config.collect_timings {
            self.stats.lock().init_time_ms = elapsed_ms(started);
        }
        Ok(())
    }

    fn do_adjust(&self, epilogue: &mut Epilogue) -> Result<(), DrainflowError> {
        let started = Instant::now();
        self.write_pending(epilogue, Round::Steady)?;
        for adjust in &mut epilogue.storage_adjusts {
            guarded(self.id, || adjust())?;
        }
        self.read_or_drain(epilogue, Round::Steady)?;

        let mut stats = self.stats.lock();
        stats.adjust_count += 1;
        if self.config.collect_timings {
            stats.adjust_time_ms += elapsed_ms(started);
        }
        Ok(())
    }

    /// Loads every read in `set`. Returns true if a read came up short with
    /// a drain armed, in which case the drain sequence has already run.
    fn read_or_drain(&self, epilogue: &mut Epilogue, set: Round) -> Result<bool, DrainflowError> {
        let count = epilogue.reads(set).len();
        for index in 0..count {
            let mut backoff = Backoff::new(self.config.spin_before_yield);
            while !epilogue.reads(set)[index].load() {
                if self.armed.load(Ordering::Acquire) {
                    self.do_drain(epilogue, set, index)?;
                    return Ok(true);
                }
                self.check_aborted()?;
                backoff.snooze();
            }
        }
        Ok(false)
    }

    fn write_pending(&self, epilogue: &mut Epilogue, set: Round) -> Result<(), DrainflowError> {
        let mut backoff = Backoff::new(self.config.spin_before_yield);
        loop {
            let mut done = true;
            for write in epilogue.writes(set).iter_mut() {
                done &= write.write();
            }
            if done {
                return Ok(());
            }
            self.check_aborted()?;
            backoff.snooze();
        }
    }

    fn check_aborted(&self) -> Result<(), DrainflowError> {
        if self.aborted.load(Ordering::Acquire) {
            Err(DrainflowError::Aborted { unit: self.id })
        } else {
            Ok(())
        }
    }

    /// Extracts the residue, opens G2 and signals completion. `loaded` reads
    /// of `set` hold items no step has consumed.
    fn do_drain(&self, epilogue: &mut Epilogue, set: Round, loaded: usize) -> Result<(), DrainflowError> {
        let started = Instant::now();
        let Some((action, callback)) = self.request.lock().take() else {
            self.gates.open_drain();
            return Ok(());
        };

        let (data, outcome) = match self.extract(epilogue, set, loaded, action) {
            Ok(data) => (data, Ok(())),
            Err(err) => {
                warn!(unit = %self.id, error = %err, "Drain extraction failed, reporting empty data");
                (DrainData::empty(), Err(err))
            }
        };
        info!(unit = %self.id, items = data.item_count(), "Unit drained");

        self.drain_data.lock().fill(data);
        if self.config.collect_timings {
            self.stats.lock().drain_time_ms = elapsed_ms(started);
        }
        self.gates.open_drain();
        callback();
        outcome
    }

    fn extract(
        &self,
        epilogue: &mut Epilogue,
        set: Round,
        loaded: usize,
        action: DrainDataAction,
    ) -> Result<DrainData, DrainflowError> {
        let mut residue: BTreeMap<Token, Vec<Item>> = BTreeMap::new();
        for read in epilogue.reads(set).iter_mut().take(loaded) {
            append(&mut residue, read.unload());
        }
        if matches!(set, Round::Steady) {
            for drain in &mut epilogue.drains {
                append(&mut residue, drain.extract());
            }
        }
        for write in epilogue.writes(set).iter_mut() {
            write.write();
            append(&mut residue, write.take_pending());
        }

        if !action.keeps_data() {
            return Ok(DrainData::empty());
        }

        for token in &self.outputs {
            if let (Some(items), Some(buffer)) = (residue.get_mut(token), epilogue.buffers.get(token)) {
                let mut queue: VecDeque<Item> = items.drain(..).collect();
                buffer.write(&mut queue);
                items.extend(queue);
            }
        }

        let mut data = if let Some(factory) = epilogue.fallback.take() {
            let interpreter = factory(&DrainData::new(residue, BTreeMap::new()))?;
            interpreter.install_buffers(&epilogue.buffers)?;
            debug!(unit = %self.id, "Finishing residue in the interpreter");
            interpreter.drain_now(action)?
        } else {
            let mut builder = DrainDataBuilder::new();
            for (token, items) in residue {
                builder.extend_items(token, items);
            }
            for token in &self.inputs {
                builder.touch(*token);
                if let Some(buffer) = epilogue.buffers.get(token) {
                    builder.extend_items(*token, buffer.read_all());
                }
            }
            builder.build()
        };

        let mut state = DrainDataBuilder::new();
        for member in &self.stateful {
            state.put_state(member.member_id(), member.capture_state())?;
        }
        data = data.merge(&state.build())?;
        Ok(data)
    }

    /// Breaks the barrier and opens both gates so every core exits. A drain
    /// armed on a failed unit completes at once with empty data.
    fn fail(&self, err: &DrainflowError) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.aborted.load(Ordering::Acquire) {
            error!(unit = %self.id, error = %err, "Unit failed");
        }
        self.barrier.terminate();

        let pending = self.request.lock().take();
        if let Some((_, callback)) = pending {
            warn!(unit = %self.id, "Completing armed drain of failed unit with empty data");
            self.drain_data.lock().fill(DrainData::empty());
            self.gates.open_drain();
            callback();
        } else {
            self.gates.open_drain();
        }
    }
}

fn append(residue: &mut BTreeMap<Token, Vec<Item>>, items: BTreeMap<Token, Vec<Item>>) {
    for (token, items) in items {
        residue.entry(token).or_default().extend(items);
    }
}

impl ExecutionUnit for BarrierUnit {
    fn id(&self) -> Token {
        self.host.id
    }

    fn inputs(&self) -> &BTreeSet<Token> {
        &self.host.inputs
    }

    fn outputs(&self) -> &BTreeSet<Token> {
        &self.host.outputs
    }

    fn internal_tokens(&self) -> BTreeSet<Token> {
        self.host.internal.clone()
    }

    fn members(&self) -> Vec<MemberId> {
        self.host.stateful.iter().map(|m| m.member_id()).collect()
    }

    fn minimum_buffer_capacity(&self, token: Token) -> Result<usize, ConfigurationError> {
        if !self.host.inputs.contains(&token) && !self.host.outputs.contains(&token) {
            return Err(ConfigurationError::UnknownToken {
                unit: self.host.id,
                token,
            });
        }
        Ok(self.host.minimums.get(&token).copied().unwrap_or(1))
    }

    fn install_buffers(&self, buffers: &BufferMap) -> Result<(), DrainflowError> {
        let host = &self.host;
        let mut guard = host.epilogue.lock();
        let epilogue = &mut *guard;
        if host.installed.load(Ordering::Acquire) {
            return Err(ProtocolError::BuffersAlreadyInstalled { unit: host.id }.into());
        }

        let mut mine = BufferMap::new();
        for token in host.inputs.iter().chain(&host.outputs) {
            let buffer = buffers.get(token).ok_or(ConfigurationError::MissingBuffer {
                unit: host.id,
                token: *token,
            })?;
            let minimum = self.minimum_buffer_capacity(*token)?;
            if buffer.capacity() < minimum {
                return Err(ConfigurationError::InsufficientCapacity {
                    token: *token,
                    capacity: buffer.capacity(),
                    minimum,
                }
                .into());
            }
            mine.insert(*token, buffer.clone());
        }

        for read in epilogue.init_reads.iter_mut().chain(epilogue.reads.iter_mut()) {
            read.init(&mine)?;
        }
        for write in epilogue.init_writes.iter_mut().chain(epilogue.writes.iter_mut()) {
            write.init(&mine)?;
        }
        epilogue.buffers = mine;
        host.installed.store(true, Ordering::Release);
        Ok(())
    }

    fn core_count(&self) -> usize {
        self.host.steady_code.len()
    }

    fn core_code(&self, core: usize) -> Result<CoreCode, ProtocolError> {
        let count = self.core_count();
        if core >= count {
            return Err(ProtocolError::CoreIndexOutOfRange {
                unit: self.host.id,
                core,
                count,
            });
        }
        if !self.host.installed.load(Ordering::Acquire) {
            return Err(ProtocolError::BuffersNotInstalled { unit: self.host.id });
        }
        let host = self.host.clone();
        Ok(Box::new(move || host.run_core(core)))
    }

    fn drain(&self, action: DrainDataAction, callback: DrainCallback) -> Result<(), DrainflowError> {
        let host = &self.host;
        if !host.installed.load(Ordering::Acquire) {
            return Err(ProtocolError::BuffersNotInstalled { unit: host.id }.into());
        }

        let mut request = host.request.lock();
        if host.armed.load(Ordering::Acquire) {
            return Err(ProtocolError::DrainAlreadyRequested { unit: host.id }.into());
        }
        if host.failed.load(Ordering::Acquire) {
            host.armed.store(true, Ordering::Release);
            drop(request);
            warn!(unit = %host.id, "Drain requested on failed unit, completing with empty data");
            host.drain_data.lock().fill(DrainData::empty());
            callback();
            return Ok(());
        }

        *request = Some((action, callback));
        host.armed.store(true, Ordering::Release);
        info!(unit = %host.id, ?action, "Drain armed");
        Ok(())
    }

    fn take_drain_data(&self) -> Result<DrainData, ProtocolError> {
        self.host.drain_data.lock().take(self.host.id)
    }

    fn insert_drain_data(&self, initial: &DrainData) -> Result<(), DrainflowError> {
        if let Some((token, _)) = initial.data().iter().find(|(_, items)| !items.is_empty()) {
            return Err(ProtocolError::UnsupportedInitialData {
                unit: self.host.id,
                token: *token,
            }
            .into());
        }
        for member in &self.host.stateful {
            if let Some(fields) = initial.member_state(member.member_id()) {
                member.restore_state(fields)?;
            }
        }
        Ok(())
    }

    fn execution_statistics(&self) -> ExecutionStatistics {
        let mut stats = self.host.stats.lock().clone();
        stats.steady_steps = self.host.steady_steps.load(Ordering::Relaxed);
        stats
    }

    fn is_drained(&self) -> bool {
        !self.host.drain_data.lock().is_pending()
    }

    fn abort(&self) {
        self.host.aborted.store(true, Ordering::Release);
        self.host.barrier.terminate();
    }
}

impl fmt::Debug for BarrierUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierUnit")
            .field("id", &self.host.id)
            .field("cores", &self.core_count())
            .field("phase", &self.host.gates.phase())
            .field("failed", &self.has_failed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BoundedBuffer, Buffer};
    use crate::testing::MapUnitBuilder;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn t(a: i32, b: i32) -> Token {
        Token::new(a, b)
    }

    fn items(range: std::ops::Range<i64>) -> Vec<Item> {
        range.map(|i| json!(i)).collect()
    }

    fn wire(unit: &BarrierUnit, capacity: usize) -> (Arc<BoundedBuffer>, Arc<BoundedBuffer>) {
        let head = Arc::new(BoundedBuffer::new(capacity));
        let tail = Arc::new(BoundedBuffer::new(capacity));
        let mut buffers: BufferMap = BTreeMap::new();
        buffers.insert(t(-1, 0), head.clone());
        buffers.insert(t(0, -1), tail.clone());
        unit.install_buffers(&buffers).unwrap();
        (head, tail)
    }

    /// Runs every core on its own thread until the unit drains.
    fn run_to_drain(unit: &BarrierUnit) -> Vec<Result<(), DrainflowError>> {
        let handles: Vec<_> = (0..unit.core_count())
            .map(|core| {
                let mut code = unit.core_code(core).unwrap();
                std::thread::spawn(move || loop {
                    match code() {
                        Ok(CoreStatus::Drained) => return Ok(()),
                        Ok(_) => {}
                        Err(err) => return Err(err),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_construction_checks() {
        let err = BarrierUnit::new(CompiledSchedule::new([], [t(0, -1)]), UnitConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnitWithoutInputs { .. }));

        let err = BarrierUnit::new(CompiledSchedule::new([t(-1, 0)], []), UnitConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidWorkerSet { .. }));
    }

    #[test]
    fn test_minimum_capacity_enforced() {
        let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1))
            .cores(2)
            .batch(4)
            .build(|v| v.clone())
            .unwrap();
        assert_eq!(unit.minimum_buffer_capacity(t(-1, 0)).unwrap(), 8);
        assert!(unit.minimum_buffer_capacity(t(5, 6)).is_err());

        let mut buffers: BufferMap = BTreeMap::new();
        buffers.insert(t(-1, 0), Arc::new(BoundedBuffer::new(4)));
        buffers.insert(t(0, -1), Arc::new(BoundedBuffer::new(16)));
        let err = unit.install_buffers(&buffers).unwrap_err();
        assert!(matches!(
            err,
            DrainflowError::Configuration(ConfigurationError::InsufficientCapacity { minimum: 8, .. })
        ));

        buffers.remove(&t(-1, 0));
        let err = unit.install_buffers(&buffers).unwrap_err();
        assert!(matches!(
            err,
            DrainflowError::Configuration(ConfigurationError::MissingBuffer { .. })
        ));
    }

    #[test]
    fn test_drain_before_install_fails() {
        let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1)).build(|v| v.clone()).unwrap();
        let err = unit.drain(DrainDataAction::Finish, Box::new(|| {})).unwrap_err();
        assert!(matches!(
            err,
            DrainflowError::Protocol(ProtocolError::BuffersNotInstalled { .. })
        ));
        assert!(unit.core_code(0).is_err());
    }

    #[test]
    fn test_drain_twice_fails() {
        let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1)).build(|v| v.clone()).unwrap();
        wire(&unit, 16);
        unit.drain(DrainDataAction::SendBack, Box::new(|| {})).unwrap();
        let err = unit.drain(DrainDataAction::SendBack, Box::new(|| {})).unwrap_err();
        assert!(matches!(
            err,
            DrainflowError::Protocol(ProtocolError::DrainAlreadyRequested { .. })
        ));
    }

    #[test]
    fn test_runs_and_drains_on_exhaustion() {
        let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1))
            .cores(2)
            .batch(3)
            .member(MemberId(0))
            .build(|v| json!(v.as_i64().unwrap_or(0) * 10))
            .unwrap();
        let (head, tail) = wire(&unit, 64);
        head.write_all(items(0..20)).unwrap();

        let callbacks = Arc::new(AtomicUsize::new(0));
        let counter = callbacks.clone();
        unit.drain(
            DrainDataAction::SendBack,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        for result in run_to_drain(&unit) {
            result.unwrap();
        }
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);
        assert!(unit.is_drained());
        assert!(unit.gates().past_drain());

        // 18 items fill three rounds of 2 cores x 3; two stay behind.
        let produced = tail.read_all();
        assert_eq!(produced, (0..18).map(|i| json!(i * 10)).collect::<Vec<_>>());
        let data = unit.take_drain_data().unwrap();
        assert_eq!(data.get_data(t(-1, 0)).unwrap(), items(18..20).as_slice());
        assert_eq!(data.get_state(MemberId(0), "processed"), Some(&json!(18)));

        let stats = unit.execution_statistics();
        assert_eq!(stats.steady_steps, 6);
        assert_eq!(stats.adjust_count, 3);
    }

    #[test]
    fn test_drain_during_init_reports_buffer() {
        let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1))
            .batch(4)
            .build(|v| v.clone())
            .unwrap();
        let (head, tail) = wire(&unit, 16);
        head.write_all(items(0..2)).unwrap();
        unit.drain(DrainDataAction::SendBack, Box::new(|| {})).unwrap();

        for result in run_to_drain(&unit) {
            result.unwrap();
        }
        assert!(unit.gates().past_drain());
        assert!(tail.is_empty());
        let data = unit.take_drain_data().unwrap();
        assert_eq!(data.get_data(t(-1, 0)).unwrap(), items(0..2).as_slice());
        assert_eq!(unit.execution_statistics().steady_steps, 0);
    }

    #[test]
    fn test_fallback_finishes_residue() {
        let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1))
            .cores(2)
            .batch(4)
            .with_fallback()
            .build(|v| json!(v.as_i64().unwrap_or(0) + 100))
            .unwrap();
        let (head, tail) = wire(&unit, 64);
        head.write_all(items(0..11)).unwrap();
        unit.drain(DrainDataAction::Finish, Box::new(|| {})).unwrap();

        for result in run_to_drain(&unit) {
            result.unwrap();
        }
        assert_eq!(tail.read_all(), (100..111).map(|i| json!(i)).collect::<Vec<_>>());
        assert!(unit.take_drain_data().unwrap().is_empty());
    }

    #[test]
    fn test_discard_reports_nothing() {
        let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1)).batch(4).build(|v| v.clone()).unwrap();
        let (head, _tail) = wire(&unit, 16);
        head.write_all(items(0..3)).unwrap();
        unit.drain(DrainDataAction::Discard, Box::new(|| {})).unwrap();

        for result in run_to_drain(&unit) {
            result.unwrap();
        }
        assert!(unit.take_drain_data().unwrap().is_empty());
    }

    #[test]
    fn test_step_failure_opens_gates_and_completes_drain() {
        let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1))
            .cores(3)
            .batch(1)
            .build(|v| {
                assert!(v.as_i64() != Some(4), "bad item");
                v.clone()
            })
            .unwrap();
        let (head, _tail) = wire(&unit, 64);
        head.write_all(items(0..9)).unwrap();

        let results = run_to_drain(&unit);
        assert!(results.iter().any(Result::is_err));
        assert!(unit.has_failed());
        assert!(unit.gates().past_drain());

        let called = Arc::new(AtomicUsize::new(0));
        let counter = called.clone();
        unit.drain(
            DrainDataAction::SendBack,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert!(unit.take_drain_data().unwrap().is_empty());
    }

    #[test]
    fn test_restores_state() {
        let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1))
            .member(MemberId(3))
            .build(|v| v.clone())
            .unwrap();
        let mut fields = crate::core::FieldMap::new();
        fields.insert("processed".to_string(), json!(40));
        let mut state = BTreeMap::new();
        state.insert(MemberId(3), fields);
        unit.insert_drain_data(&DrainData::new(BTreeMap::new(), state)).unwrap();

        let (head, _tail) = wire(&unit, 16);
        head.write_all(items(0..2)).unwrap();
        unit.drain(DrainDataAction::SendBack, Box::new(|| {})).unwrap();
        for result in run_to_drain(&unit) {
            result.unwrap();
        }
        let data = unit.take_drain_data().unwrap();
        assert_eq!(data.get_state(MemberId(3), "processed"), Some(&json!(42)));
    }

    #[test]
    fn test_internal_initial_items_rejected() {
        let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1)).build(|v| v.clone()).unwrap();
        let mut data = BTreeMap::new();
        data.insert(t(-1, 0), vec![json!(1)]);
        let err = unit
            .insert_drain_data(&DrainData::new(data, BTreeMap::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            DrainflowError::Protocol(ProtocolError::UnsupportedInitialData { .. })
        ));
    }
}
