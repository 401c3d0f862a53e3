use crate::{message::NodeId, priority::CsState};
use thiserror::Error;

/// Errors surfaced to the caller of the entry protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutexError {
    #[error("operation not allowed while {0:?}")]
    InvalidState(CsState),
    #[error("timed out waiting for replies from {missing:?}")]
    Timeout { missing: Vec<NodeId> },
    #[error("request cancelled by shutdown")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors reported by a [`Transport`](crate::transport::Transport).
///
/// These are logged by the core and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer at {0} is unreachable")]
    Unreachable(String),
    #[error("timed out talking to {0}")]
    Timeout(String),
    #[error("malformed frame: {0}")]
    Codec(String),
    #[error("connection to {0} closed")]
    Closed(String),
}
