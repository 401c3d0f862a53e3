//! Live view of the peers known through discovery.

use crate::{log, message::Peer};
use color_print::cformat;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{mpsc, RwLock};

/// Events emitted by the discovery collaborator.
///
/// There is no leave event: a peer stays in the view until the process exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Joined(Peer),
}

/// Read-mostly set of known peers, keyed by id.
///
/// Guarded independently from the coordinator state so reading a snapshot
/// never waits on protocol traffic.
#[derive(Debug, Clone, Default)]
pub struct MembershipView(Arc<RwLock<BTreeMap<String, Peer>>>);

impl MembershipView {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_peers(peers: impl IntoIterator<Item = Peer>) -> Self {
        let view = Self::new();
        for peer in peers {
            view.upsert(peer).await;
        }
        view
    }

    /// Returns the currently known peers ordered by id.
    pub async fn snapshot(&self) -> Vec<Peer> {
        self.0.read().await.values().cloned().collect()
    }

    /// Adds `peer` unless its id or its address is already known.
    ///
    /// Returns whether the view changed.
    pub async fn upsert(&self, peer: Peer) -> bool {
        let mut peers = self.0.write().await;

        if peers.contains_key(&peer.id) || peers.values().any(|p| p.address == peer.address) {
            return false;
        }

        log::debug(&cformat!("Discovered peer <bold>{peer}</bold>."));
        peers.insert(peer.id.clone(), peer);
        true
    }

    pub async fn get(&self, id: &str) -> Option<Peer> {
        self.0.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.0.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.0.read().await.is_empty()
    }

    /// Applies discovery events until the sender side is dropped.
    pub async fn run_discovery(&self, mut events: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Joined(peer) => {
                    self.upsert(peer).await;
                }
            }
        }
    }
}
