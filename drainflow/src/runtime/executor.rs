//! Runs a unit's cores on dedicated threads.

use super::StopToken;
use crate::core::Token;
use crate::errors::DrainflowError;
use crate::unit::{Backoff, CoreCode, CoreStatus, ExecutionUnit};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

const IDLE_SPIN: u32 = 64;

/// One thread per core, each calling its core code until the unit drains,
/// fails or the deployment stops.
///
/// Errors raised once the stop token has fired, and aborts, are expected
/// and dropped. Otherwise the first error is kept.
#[derive(Debug)]
pub struct UnitExecutor {
    unit: Token,
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicUsize>,
    error: Arc<Mutex<Option<DrainflowError>>>,
}

impl UnitExecutor {
    /// Starts the unit's cores. Aborts the unit when `stop` fires.
    pub fn spawn(unit: Arc<dyn ExecutionUnit>, stop: &Arc<StopToken>) -> Result<Self, DrainflowError> {
        let id = unit.id();
        let running = Arc::new(AtomicUsize::new(0));
        let error = Arc::new(Mutex::new(None));

        {
            let unit = unit.clone();
            stop.on_stop(move || unit.abort());
        }

        let mut handles = Vec::with_capacity(unit.core_count());
        for core in 0..unit.core_count() {
            let code = unit.core_code(core)?;
            let (stop, running, error) = (stop.clone(), running.clone(), error.clone());
            running.fetch_add(1, Ordering::AcqRel);
            let core_running = running.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("unit-{}-{}-core-{core}", id.upstream(), id.downstream()))
                .spawn(move || {
                    run_core(id, core, code, &stop, &error);
                    core_running.fetch_sub(1, Ordering::AcqRel);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    running.fetch_sub(1, Ordering::AcqRel);
                    unit.abort();
                    return Err(err.into());
                }
            }
        }
        debug!(unit = %id, cores = handles.len(), "Unit executor started");

        Ok(Self {
            unit: id,
            handles,
            running,
            error,
        })
    }

    /// The unit run by this executor.
    #[must_use]
    pub fn unit(&self) -> Token {
        self.unit
    }

    /// Returns true once every core thread returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.running.load(Ordering::Acquire) == 0
    }

    /// Returns true if a core failed.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.error.lock().is_some()
    }

    /// Waits for every core thread and returns the first failure.
    pub fn join(self) -> Result<(), DrainflowError> {
        for handle in self.handles {
            if handle.join().is_err() {
                error!(unit = %self.unit, "Core thread panicked outside a step");
            }
        }
        match self.error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn run_core(
    unit: Token,
    core: usize,
    mut code: CoreCode,
    stop: &StopToken,
    first_error: &Mutex<Option<DrainflowError>>,
) {
    let mut backoff = Backoff::new(IDLE_SPIN);
    loop {
        if stop.is_stopped() {
            break;
        }
        match code() {
            Ok(CoreStatus::Progress) => backoff = Backoff::new(IDLE_SPIN),
            Ok(CoreStatus::Idle) => backoff.snooze(),
            Ok(CoreStatus::Drained) => break,
            Err(DrainflowError::Aborted { .. }) => break,
            Err(_) if stop.is_stopped() => break,
            Err(err) => {
                error!(unit = %unit, core, error = %err, "Core failed");
                first_error.lock().get_or_insert(err);
                break;
            }
        }
    }
    debug!(unit = %unit, core, "Core finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StuckUnit;
    use std::time::{Duration, Instant};

    #[test]
    fn test_stop_aborts_idle_unit() {
        let unit = Arc::new(StuckUnit::new([Token::new(-1, 0)], [Token::new(0, -1)]));
        let stop = Arc::new(StopToken::new());
        let executor = UnitExecutor::spawn(unit, &stop).unwrap();
        assert!(!executor.is_finished());

        stop.stop("test");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !executor.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(executor.is_finished());
        assert!(!executor.has_failed());
        executor.join().unwrap();
    }

    #[test]
    fn test_released_unit_exits() {
        let unit = Arc::new(StuckUnit::new([Token::new(-1, 0)], [Token::new(0, -1)]));
        let stop = Arc::new(StopToken::new());
        let executor = UnitExecutor::spawn(unit.clone(), &stop).unwrap();
        unit.drain(crate::unit::DrainDataAction::Finish, Box::new(|| {})).unwrap();
        assert!(unit.release());
        executor.join().unwrap();
        assert!(!stop.is_stopped());
    }
}
