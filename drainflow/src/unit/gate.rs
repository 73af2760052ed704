//! One-shot phase gates shared by all cores of a unit.

use std::sync::atomic::{AtomicU8, Ordering};

/// The phase a unit's cores are in, as seen through its gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    /// Neither gate open: run the init step.
    Init = 0,
    /// Past init: run steady steps.
    Steady = 1,
    /// Past drain: every call is a no-op.
    Drained = 2,
}

impl Phase {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Steady,
            _ => Self::Drained,
        }
    }
}

/// The two gates G1 ("past init") and G2 ("past drain") packed in one byte.
///
/// The byte only ever grows, so a gate that was seen open stays open and
/// every core observes the phases in the same order. Checking a gate is a
/// single atomic load.
#[derive(Debug, Default)]
pub struct PhaseGates {
    phase: AtomicU8,
}

impl PhaseGates {
    /// Creates closed gates.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Init as u8),
        }
    }

    /// Current phase.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Returns true once G1 is open.
    #[inline]
    #[must_use]
    pub fn past_init(&self) -> bool {
        self.phase() >= Phase::Steady
    }

    /// Returns true once G2 is open.
    #[inline]
    #[must_use]
    pub fn past_drain(&self) -> bool {
        self.phase() == Phase::Drained
    }

    /// Opens G1. Returns true if this call opened it.
    pub fn open_init(&self) -> bool {
        self.advance(Phase::Steady)
    }

    /// Opens G2, and with it G1. Returns true if this call opened it.
    pub fn open_drain(&self) -> bool {
        self.advance(Phase::Drained)
    }

    fn advance(&self, to: Phase) -> bool {
        self.phase.fetch_max(to as u8, Ordering::AcqRel) < to as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_gates_start_closed() {
        let gates = PhaseGates::new();
        assert_eq!(gates.phase(), Phase::Init);
        assert!(!gates.past_init());
        assert!(!gates.past_drain());
    }

    #[test]
    fn test_gates_are_monotonic() {
        let gates = PhaseGates::new();
        assert!(gates.open_init());
        assert!(!gates.open_init());
        assert!(gates.open_drain());
        assert!(!gates.open_init());
        assert_eq!(gates.phase(), Phase::Drained);
        assert!(gates.past_init());
    }

    #[test]
    fn test_drain_opens_both() {
        let gates = PhaseGates::new();
        assert!(gates.open_drain());
        assert!(gates.past_init());
        assert!(!gates.open_init());
    }

    #[test]
    fn test_exactly_one_opener_across_threads() {
        let gates = Arc::new(PhaseGates::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gates = gates.clone();
                std::thread::spawn(move || gates.open_drain())
            })
            .collect();
        let openers = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|opened| *opened)
            .count();
        assert_eq!(openers, 1);
    }
}
