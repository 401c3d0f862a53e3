//! Inbound message handler.

use crate::{
    log,
    message::Message,
    priority::{should_defer, CsState},
    state::{Deferred, Shared},
};
use color_print::cformat;
use std::sync::Arc;

/// Reacts to Request and Reply messages from any peer.
///
/// Cheap to clone; every clone drives the same coordinator state.
#[derive(Debug, Clone)]
pub struct Responder {
    shared: Arc<Shared>,
}

impl Responder {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Handles one inbound message, returning the reply to send back at once.
    ///
    /// `None` means either the request was deferred or the message was a
    /// reply, which never needs an answer.
    pub async fn handle(&self, message: Message) -> Option<Message> {
        let mut state = self.shared.state.lock().await;

        match message {
            Message::Request {
                owner,
                timestamp,
                address,
            } => {
                state.clock.observe(timestamp);

                if owner == state.id {
                    log::warn("Ignoring a request carrying our own identity.");
                    return None;
                }

                if should_defer(state.request.as_ref(), state.cs, &owner, timestamp) {
                    log::debug(&cformat!(
                        "Deferring <bold>{owner}</bold> (ts <bold>{timestamp}</bold>) while <yellow>{:?}</yellow>.",
                        state.cs
                    ));
                    state.deferred.insert(
                        owner,
                        Deferred {
                            request: timestamp,
                            address,
                        },
                    );
                    return None;
                }

                Some(Message::Reply {
                    owner: state.id.clone(),
                    timestamp: state.clock.value(),
                    request: timestamp,
                })
            }
            Message::Reply {
                owner,
                timestamp,
                request,
            } => {
                state.clock.observe(timestamp);

                if state.cs != CsState::Requesting {
                    log::debug(&cformat!(
                        "Ignoring stale reply from <bold>{owner}</bold> while <yellow>{:?}</yellow>.",
                        state.cs
                    ));
                    return None;
                }

                // a reply owed to an abandoned request grants nothing now
                if !state.is_current(request) {
                    log::debug(&cformat!(
                        "Ignoring reply from <bold>{owner}</bold> to old request <bold>{request}</bold>."
                    ));
                    return None;
                }

                if !state.voters.contains(&owner) {
                    log::debug(&cformat!(
                        "Ignoring reply from <bold>{owner}</bold>, not a voter this cycle."
                    ));
                    return None;
                }

                state.granted.insert(owner);
                if state.quorum_reached() {
                    self.shared.replies.notify_one();
                }
                None
            }
        }
    }
}
