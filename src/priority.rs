//! Request ordering and the grant-or-defer rule.

use crate::message::{NodeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Enum that tells where the local node is in its critical-section cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CsState {
    Idle,
    Requesting,
    Held,
}

/// The outstanding local request, alive while `Requesting` or `Held`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub timestamp: Timestamp,
    pub owner: NodeId,
}

impl RequestRecord {
    pub fn new(timestamp: Timestamp, owner: impl Into<NodeId>) -> Self {
        Self {
            timestamp,
            owner: owner.into(),
        }
    }

    /// Compares by `(timestamp, owner)`; `Less` means higher priority.
    pub fn cmp_priority(&self, timestamp: Timestamp, owner: &str) -> Ordering {
        self.timestamp
            .cmp(&timestamp)
            .then_with(|| self.owner.as_str().cmp(owner))
    }
}

/// Decides whether a request from `owner` at `timestamp` has to wait.
///
/// The receive rule must already have been applied to the local clock; the
/// comparison uses the timestamp carried by the message.
pub fn should_defer(
    local: Option<&RequestRecord>,
    state: CsState,
    owner: &str,
    timestamp: Timestamp,
) -> bool {
    match (state, local) {
        (CsState::Requesting | CsState::Held, Some(local)) => {
            local.cmp_priority(timestamp, owner) == Ordering::Less
        }
        _ => false,
    }
}
