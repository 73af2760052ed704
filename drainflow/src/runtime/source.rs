//! The outside world's end of the head buffers.

use crate::buffer::BufferMap;
use crate::drainer::DrainKind;

/// Feeds the head buffers of a deployment.
///
/// The deployment's feeder thread calls `pump` in a loop. At the start of a
/// drain round the drainer calls `stop`; from then on the source must not
/// offer more items, so the head units can drain on what they already have.
pub trait InputSource: Send + Sync {
    /// Moves as many items as fit into `head`, keyed by head token, and
    /// returns how many moved.
    fn pump(&self, head: &BufferMap) -> usize;

    /// Stops offering items.
    fn stop(&self, kind: DrainKind);

    /// Returns true once no more items will be offered.
    fn is_exhausted(&self) -> bool;
}
