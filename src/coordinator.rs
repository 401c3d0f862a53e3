//! Ricart-Agrawala entry protocol.
//!
//! A node broadcasts a timestamped request to every peer of a membership
//! snapshot and enters the critical section once each of them replied.
//! Replies owed to lower-priority requesters are withheld until release.
//!
//! # Invariants
//!
//! 1. **Single state lock**: clock, section state, request record, reply
//!    tracking and the deferred set only change under [`Shared::state`].
//! 2. **Fixed voters**: the peers waited on are fixed when the request is
//!    broadcast; later joiners are not waited on.
//! 3. **Empty when idle**: the deferred set is drained every time the node
//!    returns to `Idle`.
//! 4. **Replies name their request**: a reply only counts toward the
//!    request whose timestamp it carries, so a reply owed to an aborted
//!    request never grants a later one.

use crate::{
    config::{Config, TimeoutPolicy},
    error::MutexError,
    log,
    membership::MembershipView,
    message::{Message, NodeId, Peer, Timestamp},
    priority::{CsState, RequestRecord},
    responder::Responder,
    state::{Deferred, Shared},
    transport::Transport,
};
use color_print::cformat;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Coordinator<T: Transport> {
    id: NodeId,
    address: String,
    shared: Arc<Shared>,
    membership: MembershipView,
    transport: T,
    reply_timeout: Duration,
    policy: TimeoutPolicy,
    shutdown: CancellationToken,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(config: &Config, membership: MembershipView, transport: T) -> Self {
        Self {
            id: config.id.clone(),
            address: config.address.clone(),
            shared: Arc::new(Shared::new(config.id.clone())),
            membership,
            transport,
            reply_timeout: config.reply_timeout(),
            policy: config.timeout_policy,
            shutdown: CancellationToken::new(),
        }
    }

    /// Uses `shutdown` to cancel pending waits instead of a private token.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn membership(&self) -> &MembershipView {
        &self.membership
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handler for inbound messages, sharing this coordinator's state.
    pub fn responder(&self) -> Responder {
        Responder::new(Arc::clone(&self.shared))
    }

    pub async fn state(&self) -> CsState {
        self.shared.state.lock().await.cs
    }

    pub async fn clock(&self) -> Timestamp {
        self.shared.state.lock().await.clock.value()
    }

    /// The outstanding local request, if any.
    pub async fn request(&self) -> Option<RequestRecord> {
        self.shared.state.lock().await.request.clone()
    }

    pub async fn deferred(&self) -> Vec<NodeId> {
        self.shared.state.lock().await.deferred.keys().cloned().collect()
    }

    /// Broadcasts a request and waits until every voter replied.
    ///
    /// The wait ends early on shutdown, or when the reply timeout passes;
    /// what happens then depends on the configured [`TimeoutPolicy`].
    pub async fn request_entry(&self) -> Result<(), MutexError> {
        // read without holding the state lock
        let voters: Vec<Peer> = self
            .membership
            .snapshot()
            .await
            .into_iter()
            .filter(|peer| peer.id != self.id)
            .collect();

        let request = {
            let mut state = self.shared.state.lock().await;
            if state.cs != CsState::Idle {
                return Err(MutexError::InvalidState(state.cs));
            }

            let timestamp = state.clock.tick();
            state.request = Some(RequestRecord::new(timestamp, self.id.clone()));
            state.cs = CsState::Requesting;
            state.voters = voters.iter().map(|peer| peer.id.clone()).collect();
            state.granted.clear();

            Message::Request {
                owner: self.id.clone(),
                timestamp,
                address: self.address.clone(),
            }
        };

        log::info(&cformat!(
            "<bold>{}</bold> requests the critical section at ts <bold>{}</bold> from <bold>{}</bold> peer(s).",
            self.id,
            request.timestamp(),
            voters.len()
        ));

        self.broadcast(voters, request);
        self.await_replies().await
    }

    /// Runs `body` while holding the critical section.
    pub async fn execute_critical_section<F, Fut, R>(&self, body: F) -> Result<R, MutexError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let cs = self.state().await;
        if cs != CsState::Held {
            return Err(MutexError::InvalidState(cs));
        }
        Ok(body().await)
    }

    /// Leaves the critical section and sends every deferred reply.
    pub async fn release_entry(&self) -> Result<(), MutexError> {
        let (deferred, timestamp) = {
            let mut state = self.shared.state.lock().await;
            if state.cs != CsState::Held {
                return Err(MutexError::InvalidState(state.cs));
            }
            state.reset()
        };

        log::info(&cformat!(
            "<bold>{}</bold> released the critical section at ts <bold>{timestamp}</bold>.",
            self.id
        ));

        self.flush(deferred, timestamp).await;
        Ok(())
    }

    /// Request, run `body`, release.
    pub async fn run_exclusive<F, Fut, R>(&self, body: F) -> Result<R, MutexError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.request_entry().await?;
        let result = self.execute_critical_section(body).await;
        self.release_entry().await?;
        result
    }

    fn broadcast(&self, voters: Vec<Peer>, request: Message) {
        for peer in voters {
            let transport = self.transport.clone();
            let responder = self.responder();
            let request = request.clone();

            tokio::spawn(async move {
                match transport.request(&peer.address, request).await {
                    Ok(Some(reply)) => {
                        responder.handle(reply).await;
                    }
                    Ok(None) => {
                        log::debug(&cformat!("<bold>{}</bold> deferred its reply.", peer.id));
                    }
                    Err(e) => {
                        log::error(&cformat!(
                            "Couldn't send request to <bold>{}</bold>: {e}",
                            peer.id
                        ));
                    }
                }
            });
        }
    }

    /// Sends a reply to every drained peer, concurrently and without retry.
    ///
    /// Each reply goes to the address the request came with, so a requester
    /// not yet in the membership view still gets its grant.
    async fn flush(&self, deferred: Vec<(NodeId, Deferred)>, timestamp: Timestamp) {
        for (id, deferred) in deferred {
            let transport = self.transport.clone();
            let reply = Message::Reply {
                owner: self.id.clone(),
                timestamp,
                request: deferred.request,
            };

            tokio::spawn(async move {
                if let Err(e) = transport.notify(&deferred.address, reply).await {
                    log::error(&cformat!(
                        "Couldn't deliver deferred reply to <bold>{id}</bold>: {e}"
                    ));
                }
            });
        }
    }

    async fn await_replies(&self) -> Result<(), MutexError> {
        let deadline = Instant::now() + self.reply_timeout;

        loop {
            {
                let mut state = self.shared.state.lock().await;
                if state.quorum_reached() {
                    state.cs = CsState::Held;
                    log::info(&cformat!(
                        "<bold>{}</bold> <green>entered</green> the critical section.",
                        self.id
                    ));
                    return Ok(());
                }
            }

            tokio::select! {
                () = self.shared.replies.notified() => {}
                () = self.shutdown.cancelled() => {
                    self.withdraw().await;
                    return Err(MutexError::Cancelled);
                }
                () = tokio::time::sleep_until(deadline) => return self.on_timeout().await,
            }
        }
    }

    async fn on_timeout(&self) -> Result<(), MutexError> {
        let mut state = self.shared.state.lock().await;
        if state.quorum_reached() {
            state.cs = CsState::Held;
            return Ok(());
        }

        let missing = state.missing();
        match self.policy {
            TimeoutPolicy::ExcludeSilent => {
                log::warn(&cformat!(
                    "<bold>{}</bold> <yellow>excludes</yellow> silent peers {missing:?} and enters.",
                    self.id
                ));
                for id in &missing {
                    state.voters.remove(id);
                }
                state.cs = CsState::Held;
                Ok(())
            }
            TimeoutPolicy::Abort => {
                let (deferred, timestamp) = state.reset();
                drop(state);

                log::warn(&cformat!(
                    "<bold>{}</bold> <red>aborts</red> its request, no reply from {missing:?}.",
                    self.id
                ));
                self.flush(deferred, timestamp).await;
                Err(MutexError::Timeout { missing })
            }
        }
    }

    async fn withdraw(&self) {
        let (deferred, timestamp) = self.shared.state.lock().await.reset();
        log::info(&cformat!(
            "<bold>{}</bold> withdraws its request on shutdown.",
            self.id
        ));
        self.flush(deferred, timestamp).await;
    }
}
