//! State shared between the coordinator and the responder.

use crate::{
    clock::LamportClock,
    message::{NodeId, Timestamp},
    priority::{CsState, RequestRecord},
};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{Mutex, Notify};

/// A request whose reply is withheld until release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deferred {
    /// Timestamp of the withheld request, echoed back in the reply.
    pub request: Timestamp,
    pub address: String,
}

/// Everything the entry protocol mutates. Always accessed under one lock.
#[derive(Debug)]
pub struct ProtocolState {
    pub id: NodeId,
    pub clock: LamportClock,
    pub cs: CsState,
    pub request: Option<RequestRecord>,
    /// Peers whose reply is required this cycle, fixed at broadcast time.
    pub voters: BTreeSet<NodeId>,
    /// Voters that already replied this cycle.
    pub granted: BTreeSet<NodeId>,
    /// Peers owed a reply once the section is released, keyed by id.
    ///
    /// A newer request from the same peer replaces the older one.
    pub deferred: BTreeMap<NodeId, Deferred>,
}

impl ProtocolState {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            clock: LamportClock::new(),
            cs: CsState::Idle,
            request: None,
            voters: BTreeSet::new(),
            granted: BTreeSet::new(),
            deferred: BTreeMap::new(),
        }
    }

    pub fn quorum_reached(&self) -> bool {
        self.granted.len() >= self.voters.len()
    }

    pub fn missing(&self) -> Vec<NodeId> {
        self.voters.difference(&self.granted).cloned().collect()
    }

    /// Whether `request` is the timestamp of the outstanding local request.
    pub fn is_current(&self, request: Timestamp) -> bool {
        self.request
            .as_ref()
            .is_some_and(|record| record.timestamp == request)
    }

    /// Returns to `Idle`, handing back the drained deferred set and the
    /// timestamp the flushed replies must carry.
    pub fn reset(&mut self) -> (Vec<(NodeId, Deferred)>, Timestamp) {
        let timestamp = self.clock.tick();
        self.cs = CsState::Idle;
        self.request = None;
        self.voters.clear();
        self.granted.clear();
        let deferred: Vec<(NodeId, Deferred)> =
            std::mem::take(&mut self.deferred).into_iter().collect();
        (deferred, timestamp)
    }
}

#[derive(Debug)]
pub struct Shared {
    pub state: Mutex<ProtocolState>,
    /// Signalled by the responder when the reply threshold is reached.
    pub replies: Notify,
}

impl Shared {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            state: Mutex::new(ProtocolState::new(id)),
            replies: Notify::new(),
        }
    }
}
