//! Reusable barrier with a single-runner epilogue.

use crate::core::Token;
use crate::errors::DrainflowError;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    broken: bool,
}

/// Joins the cores of one unit after every step.
///
/// When the last of `parties` cores arrives, that core alone runs the
/// epilogue passed to [`arrive`](Self::arrive); the others stay parked until
/// it returns. A failed epilogue or a call to [`terminate`](Self::terminate)
/// breaks the barrier for good and releases everyone with an error.
#[derive(Debug)]
pub struct PhaseBarrier {
    unit: Token,
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl PhaseBarrier {
    /// Creates a barrier for `parties` cores of `unit`.
    #[must_use]
    pub fn new(unit: Token, parties: usize) -> Self {
        Self {
            unit,
            parties: parties.max(1),
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        }
    }

    /// Number of cores joined.
    #[must_use]
    pub const fn parties(&self) -> usize {
        self.parties
    }

    /// Arrives and waits for the rest. The last arriver runs `epilogue`.
    pub fn arrive<F>(&self, epilogue: F) -> Result<(), DrainflowError>
    where
        F: FnOnce() -> Result<(), DrainflowError>,
    {
        let mut state = self.state.lock();
        if state.broken {
            return Err(DrainflowError::BarrierBroken { unit: self.unit });
        }
        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.parties {
            state.arrived = 0;
            drop(state);

            let result = epilogue();

            let mut state = self.state.lock();
            if result.is_err() {
                state.broken = true;
            } else {
                state.generation = state.generation.wrapping_add(1);
            }
            self.released.notify_all();
            return result;
        }

        while state.generation == generation && !state.broken {
            self.released.wait(&mut state);
        }
        if state.generation == generation {
            return Err(DrainflowError::BarrierBroken { unit: self.unit });
        }
        Ok(())
    }

    /// Breaks the barrier and releases every waiting core.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if !state.broken {
            debug!(unit = %self.unit, "Barrier terminated");
            state.broken = true;
        }
        self.released.notify_all();
    }

    /// Returns true once the barrier is broken.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_single_party_runs_epilogue_inline() {
        let barrier = PhaseBarrier::new(Token::new(0, 1), 1);
        let mut ran = 0;
        barrier.arrive(|| {
            ran += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(ran, 1);
    }

    #[test]
    fn test_epilogue_runs_once_per_round() {
        let barrier = Arc::new(PhaseBarrier::new(Token::new(0, 1), 4));
        let epilogues = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                let epilogues = epilogues.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        barrier
                            .arrive(|| {
                                epilogues.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(epilogues.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_failed_epilogue_breaks_barrier() {
        let barrier = PhaseBarrier::new(Token::new(0, 1), 1);
        let err = barrier
            .arrive(|| Err(DrainflowError::execution("adjust failed")))
            .unwrap_err();
        assert!(matches!(err, DrainflowError::Execution(_)));
        assert!(barrier.is_broken());

        let err = barrier.arrive(|| Ok(())).unwrap_err();
        assert!(matches!(err, DrainflowError::BarrierBroken { .. }));
    }

    #[test]
    fn test_terminate_releases_waiters() {
        let barrier = Arc::new(PhaseBarrier::new(Token::new(0, 1), 2));
        let waiter = {
            let barrier = barrier.clone();
            std::thread::spawn(move || barrier.arrive(|| Ok(())))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        barrier.terminate();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(DrainflowError::BarrierBroken { .. })));
    }
}
