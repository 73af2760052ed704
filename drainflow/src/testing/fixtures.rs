//! Ready-made units and sources for tests.

use super::workers::MapWorker;
use crate::buffer::{Buffer, BufferMap};
use crate::config::UnitConfig;
use crate::core::{FieldMap, Item, MemberId, Token};
use crate::drainer::DrainKind;
use crate::errors::{ConfigurationError, DrainflowError};
use crate::runtime::InputSource;
use crate::unit::{
    BarrierUnit, CompiledSchedule, Interpreter, ReadInstruction, StatefulMember, Worker,
    WriteInstruction,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Builds a [`BarrierUnit`] that maps every item of one input onto one
/// output.
///
/// Each round reads `cores * batch` items; core `i` maps the `i`-th slice.
/// A stateful member, if set, counts processed items in the field
/// `processed`.
#[derive(Debug, Clone)]
pub struct MapUnitBuilder {
    input: Token,
    output: Token,
    cores: usize,
    batch: usize,
    member: Option<MemberId>,
    fallback: bool,
    config: UnitConfig,
}

impl MapUnitBuilder {
    /// One core, batch of one.
    #[must_use]
    pub fn new(input: Token, output: Token) -> Self {
        Self {
            input,
            output,
            cores: 1,
            batch: 1,
            member: None,
            fallback: false,
            config: UnitConfig::default(),
        }
    }

    /// Sets the number of cores.
    #[must_use]
    pub fn cores(mut self, cores: usize) -> Self {
        self.cores = cores.max(1);
        self
    }

    /// Sets the items each core maps per round.
    #[must_use]
    pub fn batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Adds a member that counts processed items.
    #[must_use]
    pub fn member(mut self, id: MemberId) -> Self {
        self.member = Some(id);
        self
    }

    /// Finishes residue with an interpreter when drained.
    #[must_use]
    pub fn with_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Sets the unit configuration.
    #[must_use]
    pub fn config(mut self, config: UnitConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the unit around `f`.
    pub fn build(
        self,
        f: impl Fn(&Item) -> Item + Send + Sync + 'static,
    ) -> Result<BarrierUnit, ConfigurationError> {
        let round = self.cores * self.batch;
        let processed = Arc::new(AtomicU64::new(0));
        let map = {
            let processed = processed.clone();
            let f = Arc::new(f);
            move |item: &Item| {
                let mapped = f(item);
                processed.fetch_add(1, Ordering::Relaxed);
                mapped
            }
        };

        let storage: Arc<Mutex<Vec<Item>>> = Arc::new(Mutex::new(Vec::with_capacity(round)));
        let slots: Arc<Vec<Mutex<Vec<Item>>>> =
            Arc::new((0..self.cores).map(|_| Mutex::new(Vec::new())).collect());

        let mut schedule = CompiledSchedule::new([self.input], [self.output])
            .with_read(BatchRead::new(self.input, round, storage.clone()))
            .with_write(SlotWrite::new(self.output, round, slots.clone()))
            .with_storage_adjust({
                let storage = storage.clone();
                move || {
                    storage.lock().clear();
                    Ok(())
                }
            });

        for core in 0..self.cores {
            let storage = storage.clone();
            let slots = slots.clone();
            let map = map.clone();
            let batch = self.batch;
            schedule = schedule.with_core(move || {
                let chunk: Vec<Item> = storage.lock().iter().skip(core * batch).take(batch).cloned().collect();
                let mapped: Vec<Item> = chunk.iter().map(&map).collect();
                if let Some(slot) = slots.get(core) {
                    *slot.lock() = mapped;
                }
                Ok(())
            });
        }

        if let Some(id) = self.member {
            schedule = schedule.with_stateful(Arc::new(ProcessedCounter {
                id,
                processed: processed.clone(),
            }));
        }

        if self.fallback {
            let (input, output, config) = (self.input, self.output, self.config.clone());
            let id = self.member.unwrap_or(MemberId(u32::MAX));
            schedule = schedule.with_fallback(move |residue| {
                Interpreter::with_initial(
                    vec![Box::new(MapWorker::new(id, input, output, 1, map)) as Box<dyn Worker>],
                    config,
                    residue,
                )
            });
        }

        BarrierUnit::new(schedule, self.config)
    }
}

fn bind(buffers: &BufferMap, unit: Token, token: Token) -> Result<Arc<dyn Buffer>, DrainflowError> {
    buffers
        .get(&token)
        .cloned()
        .ok_or_else(|| ConfigurationError::MissingBuffer { unit, token }.into())
}

/// Reads a fixed number of items into shared storage.
struct BatchRead {
    token: Token,
    count: usize,
    storage: Arc<Mutex<Vec<Item>>>,
    buffer: Option<Arc<dyn Buffer>>,
}

impl BatchRead {
    fn new(token: Token, count: usize, storage: Arc<Mutex<Vec<Item>>>) -> Self {
        Self {
            token,
            count,
            storage,
            buffer: None,
        }
    }
}

impl ReadInstruction for BatchRead {
    fn init(&mut self, buffers: &BufferMap) -> Result<(), DrainflowError> {
        self.buffer = Some(bind(buffers, self.token, self.token)?);
        Ok(())
    }

    fn minimum_buffer_capacity(&self) -> BTreeMap<Token, usize> {
        BTreeMap::from([(self.token, self.count)])
    }

    fn load(&mut self) -> bool {
        let Some(items) = self.buffer.as_ref().and_then(|b| b.read_exact(self.count)) else {
            return false;
        };
        *self.storage.lock() = items;
        true
    }

    fn unload(&mut self) -> BTreeMap<Token, Vec<Item>> {
        let items = std::mem::take(&mut *self.storage.lock());
        if items.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([(self.token, items)])
        }
    }
}

/// Collects per-core output slots and writes them in core order.
struct SlotWrite {
    token: Token,
    round: usize,
    slots: Arc<Vec<Mutex<Vec<Item>>>>,
    pending: VecDeque<Item>,
    buffer: Option<Arc<dyn Buffer>>,
}

impl SlotWrite {
    fn new(token: Token, round: usize, slots: Arc<Vec<Mutex<Vec<Item>>>>) -> Self {
        Self {
            token,
            round,
            slots,
            pending: VecDeque::new(),
            buffer: None,
        }
    }

    fn gather(&mut self) {
        for slot in self.slots.iter() {
            self.pending.extend(slot.lock().drain(..));
        }
    }
}

impl WriteInstruction for SlotWrite {
    fn init(&mut self, buffers: &BufferMap) -> Result<(), DrainflowError> {
        self.buffer = Some(bind(buffers, self.token, self.token)?);
        Ok(())
    }

    fn minimum_buffer_capacity(&self) -> BTreeMap<Token, usize> {
        BTreeMap::from([(self.token, self.round)])
    }

    fn write(&mut self) -> bool {
        self.gather();
        if let Some(buffer) = &self.buffer {
            buffer.write(&mut self.pending);
        }
        self.pending.is_empty()
    }

    fn take_pending(&mut self) -> BTreeMap<Token, Vec<Item>> {
        self.gather();
        if self.pending.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([(self.token, self.pending.drain(..).collect())])
        }
    }
}

struct ProcessedCounter {
    id: MemberId,
    processed: Arc<AtomicU64>,
}

impl StatefulMember for ProcessedCounter {
    fn member_id(&self) -> MemberId {
        self.id
    }

    fn capture_state(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("processed".to_string(), self.processed.load(Ordering::Relaxed).into());
        fields
    }

    fn restore_state(&self, fields: &FieldMap) -> Result<(), DrainflowError> {
        if let Some(value) = fields.get("processed") {
            let processed = value.as_u64().ok_or_else(|| {
                DrainflowError::execution(format!("member {}: processed is not a number", self.id))
            })?;
            self.processed.store(processed, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// An in-memory [`InputSource`] feeding one head token.
#[derive(Debug)]
pub struct VecSource {
    token: Token,
    queue: Mutex<VecDeque<Item>>,
    chunk: usize,
    stopped: AtomicBool,
    stopped_by: Mutex<Option<DrainKind>>,
    offered: AtomicUsize,
}

impl VecSource {
    /// Creates a source over `items`.
    #[must_use]
    pub fn new(token: Token, items: impl IntoIterator<Item = Item>) -> Self {
        Self {
            token,
            queue: Mutex::new(items.into_iter().collect()),
            chunk: usize::MAX,
            stopped: AtomicBool::new(false),
            stopped_by: Mutex::new(None),
            offered: AtomicUsize::new(0),
        }
    }

    /// Limits the items offered per pump.
    #[must_use]
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Items not yet offered.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.queue.lock().len()
    }

    /// Copies the items not yet offered.
    #[must_use]
    pub fn remaining_items(&self) -> Vec<Item> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Items handed to the head buffer so far.
    #[must_use]
    pub fn offered(&self) -> usize {
        self.offered.load(Ordering::Acquire)
    }

    /// The drain kind that stopped the source, if any.
    #[must_use]
    pub fn stopped_by(&self) -> Option<DrainKind> {
        *self.stopped_by.lock()
    }

    /// A fresh source over the items this one never offered.
    #[must_use]
    pub fn resume(&self) -> Self {
        Self::new(self.token, self.remaining_items()).with_chunk(self.chunk)
    }
}

impl InputSource for VecSource {
    fn pump(&self, head: &BufferMap) -> usize {
        let Some(buffer) = head.get(&self.token) else {
            return 0;
        };
        // Stop takes the queue lock, so no write lands after it returns.
        let mut queue = self.queue.lock();
        if self.stopped.load(Ordering::Acquire) {
            return 0;
        }
        let moved = if self.chunk >= queue.len() {
            buffer.write(&mut *queue)
        } else {
            let mut batch: VecDeque<Item> = queue.drain(..self.chunk).collect();
            let moved = buffer.write(&mut batch);
            while let Some(item) = batch.pop_back() {
                queue.push_front(item);
            }
            moved
        };
        self.offered.fetch_add(moved, Ordering::AcqRel);
        moved
    }

    fn stop(&self, kind: DrainKind) {
        let _queue = self.queue.lock();
        if !self.stopped.swap(true, Ordering::AcqRel) {
            *self.stopped_by.lock() = Some(kind);
        }
    }

    fn is_exhausted(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.queue.lock().is_empty()
    }
}
