//! Lamport logical clock.

use crate::message::Timestamp;

/// Monotonic logical counter owned by a single process.
///
/// Only ever mutated through [`LamportClock::tick`] and
/// [`LamportClock::observe`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LamportClock(Timestamp);

impl LamportClock {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn value(&self) -> Timestamp {
        self.0
    }

    /// Local send or internal event.
    pub fn tick(&mut self) -> Timestamp {
        self.0 = self.0.saturating_add(1);
        self.0
    }

    /// Receive event carrying `remote`. Must run once per inbound message.
    pub fn observe(&mut self, remote: Timestamp) -> Timestamp {
        self.0 = self.0.max(remote).saturating_add(1);
        self.0
    }
}
