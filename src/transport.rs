//! Transport seam between the protocol core and the network.

use crate::{error::TransportError, message::Message, responder::Responder};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

/// Carries protocol messages to a peer address.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Delivers `message` and waits for the receiver's immediate answer.
    ///
    /// `Ok(None)` means the receiver accepted the message without answering,
    /// e.g. it deferred a request.
    fn request(
        &self,
        address: &str,
        message: Message,
    ) -> impl Future<Output = Result<Option<Message>, TransportError>> + Send;

    /// Delivers `message` without expecting an answer.
    fn notify(
        &self,
        address: &str,
        message: Message,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[derive(Debug, Default)]
struct Endpoints {
    responders: HashMap<String, Responder>,
    disconnected: HashSet<String>,
    delivered: Vec<(String, Message)>,
}

/// In-process network routing messages straight into peer responders.
///
/// Used by simulations: every delivery waits the configured latency on the
/// tokio clock, so a paused runtime gives a deterministic schedule.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<RwLock<Endpoints>>,
    latency: Duration,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub async fn register(&self, address: impl Into<String>, responder: Responder) {
        self.endpoints
            .write()
            .await
            .responders
            .insert(address.into(), responder);
    }

    /// Makes every later delivery to `address` fail as unreachable.
    pub async fn disconnect(&self, address: &str) {
        self.endpoints
            .write()
            .await
            .disconnected
            .insert(address.to_string());
    }

    pub async fn reconnect(&self, address: &str) {
        self.endpoints.write().await.disconnected.remove(address);
    }

    /// Every message that reached a responder, in delivery order.
    pub async fn delivered(&self) -> Vec<(String, Message)> {
        self.endpoints.read().await.delivered.clone()
    }

    async fn deliver(
        &self,
        address: &str,
        message: Message,
    ) -> Result<Option<Message>, TransportError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let responder = {
            let mut endpoints = self.endpoints.write().await;
            if endpoints.disconnected.contains(address) {
                return Err(TransportError::Unreachable(address.to_string()));
            }
            let responder = endpoints
                .responders
                .get(address)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(address.to_string()))?;
            endpoints
                .delivered
                .push((address.to_string(), message.clone()));
            responder
        };

        let answer = responder.handle(message).await;

        if let Some(answer) = answer {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            return Ok(Some(answer));
        }
        Ok(None)
    }
}

impl Transport for MemoryNetwork {
    async fn request(
        &self,
        address: &str,
        message: Message,
    ) -> Result<Option<Message>, TransportError> {
        self.deliver(address, message).await
    }

    async fn notify(&self, address: &str, message: Message) -> Result<(), TransportError> {
        self.deliver(address, message).await.map(|_| ())
    }
}
