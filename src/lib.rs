//! Ricart-Agrawala distributed mutual exclusion.
//!
//! Requests are totally ordered by `(Lamport timestamp, node id)`. A node
//! enters the critical section once every peer of its membership snapshot
//! replied; peers with an older request withhold their reply until they
//! release.

pub use crate::config::{BackoffConfig, Config, TimeoutPolicy};
pub use crate::coordinator::Coordinator;
pub use crate::error::{MutexError, TransportError};
pub use crate::membership::{MembershipView, PeerEvent};
pub use crate::message::*;
pub use crate::priority::{should_defer, CsState, RequestRecord};
pub use crate::responder::Responder;
pub use crate::transport::{MemoryNetwork, Transport};

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod log;
pub mod membership;
pub mod message;
pub mod net;
pub mod node;
pub mod poisson;
pub mod priority;
pub mod registry;
pub mod responder;
pub mod state;
pub mod transport;

/// Default mean number of critical-section attempts per second.
pub const RATE: f64 = 1.;
