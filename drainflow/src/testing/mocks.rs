//! Mock units.

use crate::buffer::BufferMap;
use crate::core::{DrainData, MemberId, Token};
use crate::errors::{ConfigurationError, DrainflowError, ProtocolError};
use crate::unit::{CoreCode, CoreStatus, DrainCallback, DrainDataAction, ExecutionStatistics, ExecutionUnit};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A unit that never reaches its drain point on its own.
///
/// Its core idles until [`release`](Self::release) is called, which
/// completes the armed drain with empty data.
pub struct StuckUnit {
    id: Token,
    inputs: BTreeSet<Token>,
    outputs: BTreeSet<Token>,
    state: Arc<StuckState>,
}

#[derive(Default)]
struct StuckState {
    callback: Mutex<Option<DrainCallback>>,
    armed: AtomicBool,
    released: AtomicBool,
    aborted: AtomicBool,
    data: Mutex<Option<Result<DrainData, ProtocolError>>>,
}

impl StuckUnit {
    /// Creates a stuck unit over the given edges.
    #[must_use]
    pub fn new(inputs: impl IntoIterator<Item = Token>, outputs: impl IntoIterator<Item = Token>) -> Self {
        let inputs: BTreeSet<Token> = inputs.into_iter().collect();
        Self {
            id: inputs.first().copied().unwrap_or_else(|| Token::new(-1, -1)),
            inputs,
            outputs: outputs.into_iter().collect(),
            state: Arc::new(StuckState::default()),
        }
    }

    /// Completes the armed drain. Returns false if no drain was armed or it
    /// was already released.
    pub fn release(&self) -> bool {
        let Some(callback) = self.state.callback.lock().take() else {
            return false;
        };
        *self.state.data.lock() = Some(Ok(DrainData::empty()));
        self.state.released.store(true, Ordering::Release);
        callback();
        true
    }

    /// Returns true once a drain was armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.armed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for StuckUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StuckUnit")
            .field("id", &self.id)
            .field("armed", &self.is_armed())
            .finish_non_exhaustive()
    }
}

impl ExecutionUnit for StuckUnit {
    fn id(&self) -> Token {
        self.id
    }

    fn inputs(&self) -> &BTreeSet<Token> {
        &self.inputs
    }

    fn outputs(&self) -> &BTreeSet<Token> {
        &self.outputs
    }

    fn members(&self) -> Vec<MemberId> {
        Vec::new()
    }

    fn minimum_buffer_capacity(&self, token: Token) -> Result<usize, ConfigurationError> {
        if self.inputs.contains(&token) || self.outputs.contains(&token) {
            Ok(1)
        } else {
            Err(ConfigurationError::UnknownToken { unit: self.id, token })
        }
    }

    fn install_buffers(&self, _buffers: &BufferMap) -> Result<(), DrainflowError> {
        Ok(())
    }

    fn core_count(&self) -> usize {
        1
    }

    fn core_code(&self, core: usize) -> Result<CoreCode, ProtocolError> {
        if core != 0 {
            return Err(ProtocolError::CoreIndexOutOfRange {
                unit: self.id,
                core,
                count: 1,
            });
        }
        let (state, unit) = (self.state.clone(), self.id);
        Ok(Box::new(move || {
            if state.aborted.load(Ordering::Acquire) {
                Err(DrainflowError::Aborted { unit })
            } else if state.released.load(Ordering::Acquire) {
                Ok(CoreStatus::Drained)
            } else {
                Ok(CoreStatus::Idle)
            }
        }))
    }

    fn drain(&self, _action: DrainDataAction, callback: DrainCallback) -> Result<(), DrainflowError> {
        if self.state.armed.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::DrainAlreadyRequested { unit: self.id }.into());
        }
        *self.state.callback.lock() = Some(callback);
        Ok(())
    }

    fn take_drain_data(&self) -> Result<DrainData, ProtocolError> {
        let mut slot = self.state.data.lock();
        match slot.take() {
            Some(result) => {
                *slot = Some(Err(ProtocolError::DrainDataAlreadyTaken { unit: self.id }));
                result
            }
            None => Err(ProtocolError::DrainNotCompleted { unit: self.id }),
        }
    }

    fn insert_drain_data(&self, _initial: &DrainData) -> Result<(), DrainflowError> {
        Ok(())
    }

    fn execution_statistics(&self) -> ExecutionStatistics {
        ExecutionStatistics::default()
    }

    fn is_drained(&self) -> bool {
        self.state.released.load(Ordering::Acquire)
    }

    fn abort(&self) {
        self.state.aborted.store(true, Ordering::Release);
    }
}
