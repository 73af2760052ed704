//! Async control surface for a reconfiguration or tuning driver.

use super::{DrainKind, Drainer};
use crate::core::DrainData;
use crate::errors::DrainflowError;
use async_trait::async_trait;

/// The calls a driver makes into the drainer, usable from async code.
#[async_trait]
pub trait DrainControl: Send + Sync {
    /// Starts a drain round. See [`Drainer::request_drain`].
    async fn request_drain(&self, kind: DrainKind) -> Result<bool, DrainflowError>;

    /// Resolves once every unit of the current round completed locally.
    async fn drain_completed(&self) -> Result<(), DrainflowError>;

    /// Resolves to the current round's merged drain data.
    async fn drain_data(&self) -> Result<Option<DrainData>, DrainflowError>;
}

#[async_trait]
impl DrainControl for Drainer {
    async fn request_drain(&self, kind: DrainKind) -> Result<bool, DrainflowError> {
        Drainer::request_drain(self, kind)
    }

    async fn drain_completed(&self) -> Result<(), DrainflowError> {
        self.wait_completion_async().await
    }

    async fn drain_data(&self) -> Result<Option<DrainData>, DrainflowError> {
        self.wait_data_async().await
    }
}
