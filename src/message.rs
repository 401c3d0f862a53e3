//! Module that contains all the different message types sent in the network.

use serde::{Deserialize, Serialize};
use std::{error::Error, fmt};

/// Identity of a process. Ordered lexicographically for tie-breaks.
pub type NodeId = String;

/// Value of a Lamport clock.
pub type Timestamp = u64;

/// Struct that represents a process known through discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub address: String,
}

/// Enum that represents the two protocol messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// `address` is where a deferred reply has to be delivered.
    Request {
        owner: NodeId,
        timestamp: Timestamp,
        address: String,
    },
    /// `request` is the timestamp of the request this reply grants.
    Reply {
        owner: NodeId,
        timestamp: Timestamp,
        request: Timestamp,
    },
}

/// Frame carried by the TCP transport.
///
/// Every `Deliver` is answered by exactly one `Ack`, holding the immediate
/// reply when the receiver granted a request on the spot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Deliver(Message),
    Ack(Option<Message>),
}

/// Frames exchanged with the discovery registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryMessage {
    Announce(Peer),
    Joined(Peer),
}

impl Peer {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

impl Message {
    pub fn owner(&self) -> &str {
        match self {
            Self::Request { owner, .. } | Self::Reply { owner, .. } => owner,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Request { timestamp, .. } | Self::Reply { timestamp, .. } => *timestamp,
        }
    }

    /// Function that returns the message as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses the message from a JSON formatted `String`.
    pub fn from_json_string(message: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(message)?)
    }
}

impl Envelope {
    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_string(envelope: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(envelope)?)
    }
}

impl RegistryMessage {
    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_string(message: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(message)?)
    }
}
