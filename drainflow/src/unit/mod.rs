//! Execution units: partitions of the stream graph run by a fixed set of
//! parallel cores.
//!
//! A unit exposes one task per core, accepts its buffers once, and supports a
//! single arm-only drain trigger. After the drain completes the unit hands out
//! its [`DrainData`] exactly once.
//!
//! Two implementations live here:
//!
//! - [`BarrierUnit`] runs a [`CompiledSchedule`] on N cores joined by a
//!   [`PhaseBarrier`], switching phases through [`PhaseGates`].
//! - [`Interpreter`] runs a set of [`Worker`]s on a single core with a pull
//!   schedule. It also finishes the residue a compiled schedule cannot.

mod barrier;
mod gate;
mod host;
mod instructions;
mod interpreter;
mod worker;

pub use barrier::PhaseBarrier;
pub use gate::{Phase, PhaseGates};
pub use host::{BarrierUnit, CompiledSchedule, InterpreterFactory};
pub use instructions::{
    DrainInstruction, ReadInstruction, StatefulMember, SteadyStep, Step, WriteInstruction,
};
pub use interpreter::Interpreter;
pub use worker::{Rate, Worker};

use crate::buffer::BufferMap;
use crate::core::{DrainData, MemberId, Token};
use crate::errors::{ConfigurationError, DrainflowError, ProtocolError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// What a unit does with the residue it finds when it drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainDataAction {
    /// The stream is over; report whatever is left.
    Finish,
    /// Report the residue so a new configuration can resume from it.
    SendBack,
    /// Throw the residue away and report nothing.
    Discard,
}

impl DrainDataAction {
    /// Returns true if the unit should report its residue.
    #[must_use]
    pub const fn keeps_data(self) -> bool {
        !matches!(self, Self::Discard)
    }
}

/// Outcome of one invocation of a core's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    /// The core did work and should be called again.
    Progress,
    /// Nothing could be done right now; the caller may back off.
    Idle,
    /// The unit has drained. Further calls are no-ops.
    Drained,
}

/// The task run repeatedly by one core.
pub type CoreCode = Box<dyn FnMut() -> Result<CoreStatus, DrainflowError> + Send>;

/// Invoked once, on a core thread, when a unit completes its local drain.
pub type DrainCallback = Box<dyn FnOnce() + Send>;

/// Timings and counters recorded by a unit.
///
/// Times are only recorded when the unit was built with
/// `UnitConfig::collect_timings`; counters are always kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    /// Time spent in the init epilogue.
    pub init_time_ms: u64,
    /// Total time spent in steady-state adjust epilogues.
    pub adjust_time_ms: u64,
    /// Number of adjust epilogues run.
    pub adjust_count: u64,
    /// Time spent draining.
    pub drain_time_ms: u64,
    /// Number of steady steps executed across all cores.
    pub steady_steps: u64,
}

/// A partition of the stream graph executed by parallel cores.
///
/// Implementations are shared between the drainer, which arms the drain,
/// and the executor threads, which run the core code.
pub trait ExecutionUnit: Send + Sync {
    /// Stable identity: the smallest input token.
    fn id(&self) -> Token;

    /// Tokens the unit reads.
    fn inputs(&self) -> &BTreeSet<Token>;

    /// Tokens the unit writes.
    fn outputs(&self) -> &BTreeSet<Token>;

    /// Edges that live entirely inside the unit. Drain data may carry items
    /// for them.
    fn internal_tokens(&self) -> BTreeSet<Token> {
        BTreeSet::new()
    }

    /// Members whose state the unit captures on drain.
    fn members(&self) -> Vec<MemberId>;

    /// Smallest buffer the unit can run with on the given token.
    fn minimum_buffer_capacity(&self, token: Token) -> Result<usize, ConfigurationError>;

    /// Installs the buffers for every input and output token. Called once.
    fn install_buffers(&self, buffers: &BufferMap) -> Result<(), DrainflowError>;

    /// Number of parallel cores.
    fn core_count(&self) -> usize;

    /// Returns the code run by one core.
    fn core_code(&self, core: usize) -> Result<CoreCode, ProtocolError>;

    /// Arms the drain. The unit stops at its next safe point and then calls
    /// `callback` exactly once. Arming twice is an error.
    fn drain(&self, action: DrainDataAction, callback: DrainCallback) -> Result<(), DrainflowError>;

    /// Hands out the drain data. Available once, after the drain completed.
    fn take_drain_data(&self) -> Result<DrainData, ProtocolError>;

    /// Seeds the unit with state (and internal items) from a previous
    /// configuration. Must be called before any core runs.
    fn insert_drain_data(&self, initial: &DrainData) -> Result<(), DrainflowError>;

    /// Returns the unit's timings and counters.
    fn execution_statistics(&self) -> ExecutionStatistics;

    /// Returns true once the unit completed its local drain.
    fn is_drained(&self) -> bool;

    /// Makes every core return at its next check, draining or not.
    fn abort(&self);
}

/// Runs a step, turning a panic into an execution error.
pub(crate) fn guarded<T>(
    unit: Token,
    step: impl FnOnce() -> Result<T, DrainflowError>,
) -> Result<T, DrainflowError> {
    match catch_unwind(AssertUnwindSafe(step)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(DrainflowError::execution(format!(
                "step of unit {unit} panicked: {message}"
            )))
        }
    }
}

pub(crate) fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

const SLEEP_MICROS: u64 = 50;
const SLEEP_JITTER_MICROS: u64 = 25;

/// Waits on a condition: spins `limit` times, then yields, then sleeps
/// with a little jitter so idle cores do not wake in step.
#[derive(Debug)]
pub(crate) struct Backoff {
    limit: u32,
    attempts: u32,
}

impl Backoff {
    pub(crate) const fn new(limit: u32) -> Self {
        Self { limit, attempts: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts <= self.limit {
            std::hint::spin_loop();
        } else if self.attempts <= self.limit.saturating_mul(2) {
            std::thread::yield_now();
        } else {
            let jitter = rand::thread_rng().gen_range(0..=SLEEP_JITTER_MICROS);
            std::thread::sleep(Duration::from_micros(SLEEP_MICROS + jitter));
        }
    }
}

/// Where a unit parks its drain data until the drainer collects it.
#[derive(Debug, Default)]
pub(crate) enum DrainDataSlot {
    #[default]
    Pending,
    Ready(DrainData),
    Taken,
}

impl DrainDataSlot {
    pub(crate) fn fill(&mut self, data: DrainData) {
        *self = Self::Ready(data);
    }

    pub(crate) const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub(crate) fn take(&mut self, unit: Token) -> Result<DrainData, ProtocolError> {
        match std::mem::replace(self, Self::Taken) {
            Self::Ready(data) => Ok(data),
            Self::Pending => {
                *self = Self::Pending;
                Err(ProtocolError::DrainNotCompleted { unit })
            }
            Self::Taken => Err(ProtocolError::DrainDataAlreadyTaken { unit }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_data_action_keeps_data() {
        assert!(DrainDataAction::Finish.keeps_data());
        assert!(DrainDataAction::SendBack.keeps_data());
        assert!(!DrainDataAction::Discard.keeps_data());
    }

    #[test]
    fn test_guarded_converts_panic() {
        let result: Result<(), _> = guarded(Token::new(0, 1), || panic!("boom"));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_guarded_passes_result() {
        assert_eq!(guarded(Token::new(0, 1), || Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_slot_hands_out_once() {
        let unit = Token::new(0, 1);
        let mut slot = DrainDataSlot::default();
        assert_eq!(slot.take(unit).unwrap_err(), ProtocolError::DrainNotCompleted { unit });
        assert!(slot.is_pending());

        slot.fill(DrainData::empty());
        assert!(slot.take(unit).unwrap().is_empty());
        assert_eq!(slot.take(unit).unwrap_err(), ProtocolError::DrainDataAlreadyTaken { unit });
    }

    #[test]
    fn test_backoff_sleeps_after_spinning() {
        let mut backoff = Backoff::new(2);
        for _ in 0..4 {
            backoff.snooze();
        }
        let started = std::time::Instant::now();
        backoff.snooze();
        assert!(started.elapsed() >= Duration::from_micros(SLEEP_MICROS));
    }

    #[test]
    fn test_statistics_serde() {
        let stats = ExecutionStatistics {
            adjust_count: 3,
            ..ExecutionStatistics::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["adjust_count"], 3);
    }
}
