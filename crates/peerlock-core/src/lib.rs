//! Peerlock Core Library
//!
//! A testbed for a decentralized mutual-exclusion protocol. Every peer is an
//! independent tokio task with its own mailbox and timers; peers negotiate a
//! single process-wide lock purely by message passing, and a shared guard
//! checks that no two of them ever hold it at once.
//!
//! - [`message`] - peer identities and protocol messages
//! - [`mailbox`] - per-peer FIFO queue
//! - [`timer`] - deadline-ordered timer scheduler
//! - [`directory`] - membership registry and message bus
//! - [`negotiation`] - the lock negotiation state machine
//! - [`guard`] - mutual-exclusion oracle
//! - [`peer`] - the peer actor
//! - [`simulation`] - controller that spawns and stops peers
//! - [`config`] - simulation settings and TOML loading

pub mod config;
pub mod directory;
pub mod error;
pub mod guard;
pub mod mailbox;
pub mod message;
pub mod negotiation;
pub mod peer;
pub mod simulation;
pub mod timer;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{FaultPolicy, SimulationConfig};
    pub use crate::error::{Error, Result};
    pub use crate::message::{Message, MessageKind, PeerId};
    pub use crate::negotiation::LockState;
    pub use crate::peer::PeerStatus;
    pub use crate::simulation::{Simulation, SimulationStats};
}
