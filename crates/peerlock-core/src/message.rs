//! Protocol messages and peer identities
//!
//! Messages are small `Copy` values. A broadcast hands every recipient its
//! own copy, so nothing tracks shared ownership. The shape is serde-ready
//! in case a real transport is ever put underneath the directory.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a peer. Zero is reserved: as a sender it means "system",
/// as a recipient it means "broadcast".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u32);

impl PeerId {
    /// The reserved identity (system sender / broadcast recipient)
    pub const SYSTEM: PeerId = PeerId(0);

    /// Alias of [`PeerId::SYSTEM`] for use as a recipient
    pub const BROADCAST: PeerId = PeerId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// True for the reserved zero identity
    pub const fn is_reserved(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PeerId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Operation carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Stop the recipient's run loop (controller only)
    Shutdown,
    /// The sender is now a live peer
    PeerJoined,
    /// The sender is gone
    PeerLeft,
    /// The sender wants the lock
    RequestLock,
    /// The sender agrees that the recipient may hold the lock
    GrantLock,
    /// The sender no longer wants the lock
    WithdrawRequest,
}

impl MessageKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::PeerJoined => "peer_joined",
            Self::PeerLeft => "peer_left",
            Self::RequestLock => "request_lock",
            Self::GrantLock => "grant_lock",
            Self::WithdrawRequest => "withdraw_request",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message between peers, or from the system to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub from: PeerId,
    pub to: PeerId,
}

impl Message {
    pub fn new(kind: MessageKind, from: PeerId, to: PeerId) -> Self {
        Self { kind, from, to }
    }

    /// A message addressed to every peer except `from`
    pub fn broadcast(kind: MessageKind, from: PeerId) -> Self {
        Self::new(kind, from, PeerId::BROADCAST)
    }

    /// The controller's stop order for `to`
    pub fn shutdown(to: PeerId) -> Self {
        Self::new(MessageKind::Shutdown, PeerId::SYSTEM, to)
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_reserved()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} -> {})", self.kind, self.from, self.to)
    }
}
