//! Lock negotiation state machine
//!
//! Each peer owns one [`LockNegotiation`]. Handlers never touch the network
//! themselves: they mutate local bookkeeping and return an [`Outcome`]
//! listing the messages to route and whether the peer just reached
//! `Holding`. The peer actor does the routing, the guard bookkeeping and the
//! hold timer.
//!
//! # States
//!
//! ```text
//!          attempt (alone)
//!   Idle ─────────────────────────────► Holding
//!    │  attempt, nobody wanting             ▲
//!    ├──────────────────► Requesting ───────┤ last grant / last awaited peer left
//!    │  attempt, someone wanting  ▲         │
//!    └──────────► Listening ──────┘         │
//!                    │  wanting emptied     │
//!                    └──────────────────────┘ last known peer left
//!
//!   Holding ── release ──► Idle
//! ```
//!
//! Conflicts between two requesters are settled by identity: the higher
//! `PeerId` is granted at once, the lower one is deferred until release.
//!
//! A request stays in `wanting_lock` until its sender withdraws it, even
//! after this peer has granted it. Owed grants are tracked on their own in
//! `deferred_grants`, so every request is answered exactly once and a peer
//! that just released cannot start a competing episode against a requester
//! it has already granted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, trace, warn};

use crate::message::{Message, MessageKind, PeerId};

/// Negotiation state of a single peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Not interested in the lock
    #[default]
    Idle,
    /// Interested, but someone else is already asking
    Listening,
    /// Soliciting grants from every known peer
    Requesting,
    /// Exclusive access
    Holding,
}

impl LockState {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Requesting => "requesting",
            Self::Holding => "holding",
        }
    }

    /// True while the peer wants the lock but does not have it yet
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Listening | Self::Requesting)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a handler wants the runtime to do next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Messages to route, in send order
    pub outgoing: Vec<Message>,
    /// The peer entered `Holding` during this step
    pub acquired: bool,
}

impl Outcome {
    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && !self.acquired
    }
}

/// Per-peer bookkeeping of the mutual-exclusion handshake
#[derive(Debug, Clone)]
pub struct LockNegotiation {
    id: PeerId,
    state: LockState,
    /// Every other live peer this peer has heard of
    known_peers: BTreeSet<PeerId>,
    /// Peers sent `RequestLock` during the current episode
    requested_from: BTreeSet<PeerId>,
    /// Peers whose `GrantLock` is still outstanding
    awaiting_grant_from: BTreeSet<PeerId>,
    /// Peers with an outstanding request of their own
    wanting_lock: BTreeSet<PeerId>,
    /// Subset of `wanting_lock` still owed a `GrantLock`
    deferred_grants: BTreeSet<PeerId>,
}

/// Shared by the negotiation and its published snapshot
pub(crate) fn references_any(sets: [&BTreeSet<PeerId>; 5], peer: PeerId) -> bool {
    sets.iter().any(|set| set.contains(&peer))
}

impl LockNegotiation {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            state: LockState::Idle,
            known_peers: BTreeSet::new(),
            requested_from: BTreeSet::new(),
            awaiting_grant_from: BTreeSet::new(),
            wanting_lock: BTreeSet::new(),
            deferred_grants: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_holding(&self) -> bool {
        self.state == LockState::Holding
    }

    pub fn known_peers(&self) -> &BTreeSet<PeerId> {
        &self.known_peers
    }

    pub fn requested_from(&self) -> &BTreeSet<PeerId> {
        &self.requested_from
    }

    pub fn awaiting_grant_from(&self) -> &BTreeSet<PeerId> {
        &self.awaiting_grant_from
    }

    pub fn wanting_lock(&self) -> &BTreeSet<PeerId> {
        &self.wanting_lock
    }

    pub fn deferred_grants(&self) -> &BTreeSet<PeerId> {
        &self.deferred_grants
    }

    /// True if `peer` appears in any membership or negotiation set
    pub fn references(&self, peer: PeerId) -> bool {
        references_any(
            [
                &self.known_peers,
                &self.requested_from,
                &self.awaiting_grant_from,
                &self.wanting_lock,
                &self.deferred_grants,
            ],
            peer,
        )
    }

    fn send(&self, out: &mut Outcome, kind: MessageKind, to: PeerId) {
        out.outgoing.push(Message::new(kind, self.id, to));
    }

    fn enter_holding(&mut self, out: &mut Outcome) {
        debug!(peer = %self.id, from = %self.state, "Lock acquired");
        self.state = LockState::Holding;
        out.acquired = true;
    }

    /// Ask every known peer for the lock
    fn begin_episode(&mut self, out: &mut Outcome) {
        if self.known_peers.is_empty() {
            self.enter_holding(out);
            return;
        }

        self.awaiting_grant_from = self.known_peers.clone();
        self.requested_from = self.known_peers.clone();
        for &peer in &self.known_peers {
            self.send(out, MessageKind::RequestLock, peer);
        }
        self.state = LockState::Requesting;

        debug!(
            peer = %self.id,
            asked = self.requested_from.len(),
            "Request episode started"
        );
    }

    /// Start competing for the lock. Only acts from `Idle`.
    pub fn attempt_acquire(&mut self) -> Outcome {
        let mut out = Outcome::default();

        if self.state != LockState::Idle {
            trace!(peer = %self.id, state = %self.state, "Acquire attempt ignored");
            return out;
        }

        if self.known_peers.is_empty() {
            self.enter_holding(&mut out);
        } else if self.wanting_lock.is_empty() {
            self.begin_episode(&mut out);
        } else {
            debug!(
                peer = %self.id,
                wanting = self.wanting_lock.len(),
                "Someone else is asking, listening"
            );
            self.state = LockState::Listening;
        }

        out
    }

    /// Dispatch a peer message to its handler. `Shutdown` is the run loop's
    /// business and yields nothing here.
    pub fn on_message(&mut self, msg: &Message) -> Outcome {
        if msg.from.is_reserved() || msg.from == self.id {
            if msg.kind != MessageKind::Shutdown {
                warn!(peer = %self.id, msg = %msg, "Ignoring message with invalid sender");
            }
            return Outcome::default();
        }

        match msg.kind {
            MessageKind::Shutdown => Outcome::default(),
            MessageKind::PeerJoined => self.on_peer_joined(msg.from),
            MessageKind::PeerLeft => self.on_peer_left(msg.from),
            MessageKind::RequestLock => self.on_request_lock(msg.from),
            MessageKind::GrantLock => self.on_grant_lock(msg.from),
            MessageKind::WithdrawRequest => self.on_withdraw_request(msg.from),
        }
    }

    /// `from` wants the lock
    pub fn on_request_lock(&mut self, from: PeerId) -> Outcome {
        let mut out = Outcome::default();
        self.wanting_lock.insert(from);

        match self.state {
            LockState::Idle | LockState::Listening => {
                self.send(&mut out, MessageKind::GrantLock, from);
            }
            LockState::Requesting if from > self.id => {
                debug!(peer = %self.id, from = %from, "Yielding to higher priority requester");
                self.send(&mut out, MessageKind::GrantLock, from);
            }
            LockState::Requesting | LockState::Holding => {
                debug!(peer = %self.id, from = %from, state = %self.state, "Grant deferred");
                self.deferred_grants.insert(from);
            }
        }

        out
    }

    /// `from` agrees that this peer may hold the lock
    pub fn on_grant_lock(&mut self, from: PeerId) -> Outcome {
        let mut out = Outcome::default();

        if self.state != LockState::Requesting {
            // A withdrawal of ours may have crossed this grant in flight.
            warn!(
                peer = %self.id,
                from = %from,
                state = %self.state,
                "Rogue grant received outside of a request episode"
            );
            return out;
        }

        if !self.awaiting_grant_from.remove(&from) {
            warn!(peer = %self.id, from = %from, "Grant from a peer that was not awaited");
        }
        if self.awaiting_grant_from.is_empty() {
            self.enter_holding(&mut out);
        }

        out
    }

    /// `from` no longer wants the lock. Unknown senders are a no-op.
    pub fn on_withdraw_request(&mut self, from: PeerId) -> Outcome {
        let mut out = Outcome::default();

        self.deferred_grants.remove(&from);
        if self.wanting_lock.remove(&from)
            && self.state == LockState::Listening
            && self.wanting_lock.is_empty()
        {
            debug!(peer = %self.id, "Nobody else is asking, promoting to requester");
            self.begin_episode(&mut out);
        }

        out
    }

    /// Leave `Holding` (or abort a request episode) and settle debts:
    /// deferred grants go out, every asked peer is told to forget us.
    /// `wanting_lock` is kept; those requests end with their withdrawal.
    pub fn release(&mut self) -> Outcome {
        let mut out = Outcome::default();

        match self.state {
            LockState::Holding | LockState::Requesting => {
                for peer in std::mem::take(&mut self.deferred_grants) {
                    self.send(&mut out, MessageKind::GrantLock, peer);
                }
                for peer in std::mem::take(&mut self.requested_from) {
                    self.send(&mut out, MessageKind::WithdrawRequest, peer);
                }
                self.awaiting_grant_from.clear();
                debug!(peer = %self.id, from = %self.state, "Lock released");
            }
            LockState::Idle | LockState::Listening => {
                trace!(peer = %self.id, state = %self.state, "Release with nothing to settle");
            }
        }

        self.state = LockState::Idle;
        out
    }

    /// `peer` is live. A running episode is extended to it so a newcomer
    /// can never be left out of a competition it later enters.
    pub fn on_peer_joined(&mut self, peer: PeerId) -> Outcome {
        let mut out = Outcome::default();

        if !self.known_peers.insert(peer) {
            return out;
        }
        debug!(peer = %self.id, joined = %peer, "Peer joined");

        if self.state == LockState::Requesting && self.requested_from.insert(peer) {
            self.awaiting_grant_from.insert(peer);
            self.send(&mut out, MessageKind::RequestLock, peer);
        }

        out
    }

    /// `peer` is gone; forget it everywhere and re-evaluate
    pub fn on_peer_left(&mut self, peer: PeerId) -> Outcome {
        let mut out = Outcome::default();

        self.known_peers.remove(&peer);
        self.wanting_lock.remove(&peer);
        self.deferred_grants.remove(&peer);
        self.awaiting_grant_from.remove(&peer);
        self.requested_from.remove(&peer);
        debug!(peer = %self.id, left = %peer, state = %self.state, "Peer left");

        match self.state {
            LockState::Listening if self.known_peers.is_empty() => {
                self.enter_holding(&mut out);
            }
            LockState::Listening if self.wanting_lock.is_empty() => {
                self.begin_episode(&mut out);
            }
            LockState::Requesting if self.awaiting_grant_from.is_empty() => {
                self.enter_holding(&mut out);
            }
            _ => {}
        }

        out
    }
}
