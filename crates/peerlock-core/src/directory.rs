//! Peer directory and message bus
//!
//! Maps live identities to [`PeerHandle`]s. Registration, deregistration and
//! routing all take the same routing lock, so a broadcast always sees one
//! consistent membership and a peer can never appear or vanish halfway
//! through one. The lock is held for a single call only, never while a peer
//! processes a message.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::message::{Message, MessageKind, PeerId};
use crate::peer::PeerHandle;

/// Process-wide registry of live peers
#[derive(Debug, Default)]
pub struct Directory {
    peers: Mutex<BTreeMap<PeerId, PeerHandle>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, BTreeMap<PeerId, PeerHandle>> {
        // membership is a plain map, still consistent after a panic elsewhere
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a peer.
    ///
    /// The newcomer first receives one `PeerJoined` per existing peer, then
    /// every existing peer receives the newcomer's `PeerJoined`, so a peer
    /// always learns of everyone before anyone learns of it.
    pub fn register(&self, handle: PeerHandle) -> Result<()> {
        let id = handle.id();
        if id.is_reserved() {
            return Err(Error::InvalidPeerId);
        }

        let mut peers = self.peers();
        if peers.contains_key(&id) {
            return Err(Error::DuplicatePeer(id));
        }

        for &existing in peers.keys() {
            handle.deliver(Message::new(MessageKind::PeerJoined, existing, id));
        }
        let joined = Message::broadcast(MessageKind::PeerJoined, id);
        for existing in peers.values() {
            existing.deliver(joined);
        }
        peers.insert(id, handle);

        debug!(peer = %id, live = peers.len(), "Peer registered");
        Ok(())
    }

    /// Remove a peer, returning its handle
    pub fn deregister(&self, id: PeerId) -> Option<PeerHandle> {
        let mut peers = self.peers();
        let handle = peers.remove(&id);
        if handle.is_some() {
            debug!(peer = %id, live = peers.len(), "Peer deregistered");
        }
        handle
    }

    /// Deliver `msg` to its recipient, or to every peer but the sender when
    /// addressed to 0. Messages for unknown peers are dropped.
    pub fn route(&self, msg: Message) {
        let peers = self.peers();

        if msg.is_broadcast() {
            for (&id, handle) in peers.iter() {
                if id != msg.from {
                    handle.deliver(msg);
                }
            }
            return;
        }

        match peers.get(&msg.to) {
            Some(handle) => handle.deliver(msg),
            None => trace!(msg = %msg, "Recipient gone, message dropped"),
        }
    }

    /// Handle of a live peer
    pub fn get(&self, id: PeerId) -> Option<PeerHandle> {
        self.peers().get(&id).cloned()
    }

    /// Identities of every live peer, ascending
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers().keys().copied().collect()
    }

    /// Handles of every live peer, ascending by identity
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.peers().values().cloned().collect()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{Mailbox, Received};
    use crate::peer::PeerStatus;
    use tokio::sync::watch;

    fn p(raw: u32) -> PeerId {
        PeerId::new(raw)
    }

    /// A handle backed by a bare mailbox instead of a running peer
    fn mailbox_peer(id: u32) -> (PeerHandle, Mailbox) {
        let (mailbox, sender) = Mailbox::new();
        let (_tx, rx) = watch::channel(PeerStatus::initial(p(id)));
        (PeerHandle::new(p(id), sender, rx), mailbox)
    }

    fn drain(mailbox: &mut Mailbox) -> Vec<Message> {
        let mut out = Vec::new();
        while let Received::Message(msg) = mailbox.try_pop() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_register_announces_membership_both_ways() {
        let directory = Directory::new();
        let (h1, mut m1) = mailbox_peer(1);
        let (h2, mut m2) = mailbox_peer(2);
        let (h3, mut m3) = mailbox_peer(3);

        directory.register(h1).unwrap();
        assert!(drain(&mut m1).is_empty());

        directory.register(h2).unwrap();
        directory.register(h3).unwrap();

        assert_eq!(
            drain(&mut m3),
            vec![
                Message::new(MessageKind::PeerJoined, p(1), p(3)),
                Message::new(MessageKind::PeerJoined, p(2), p(3)),
            ]
        );
        assert_eq!(
            drain(&mut m1),
            vec![
                Message::broadcast(MessageKind::PeerJoined, p(2)),
                Message::broadcast(MessageKind::PeerJoined, p(3)),
            ]
        );
        assert_eq!(
            drain(&mut m2),
            vec![
                Message::new(MessageKind::PeerJoined, p(1), p(2)),
                Message::broadcast(MessageKind::PeerJoined, p(3)),
            ]
        );
        assert_eq!(directory.ids(), vec![p(1), p(2), p(3)]);
    }

    #[test]
    fn test_duplicate_and_reserved_identities_are_rejected() {
        let directory = Directory::new();
        let (h1, _m1) = mailbox_peer(1);
        let (again, _m) = mailbox_peer(1);
        let (zero, _z) = mailbox_peer(0);

        directory.register(h1).unwrap();
        assert!(matches!(directory.register(again), Err(Error::DuplicatePeer(id)) if id == p(1)));
        assert!(matches!(directory.register(zero), Err(Error::InvalidPeerId)));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_route_unicast_and_broadcast() {
        let directory = Directory::new();
        let (h1, mut m1) = mailbox_peer(1);
        let (h2, mut m2) = mailbox_peer(2);
        directory.register(h1).unwrap();
        directory.register(h2).unwrap();
        drain(&mut m1);
        drain(&mut m2);

        let request = Message::new(MessageKind::RequestLock, p(1), p(2));
        directory.route(request);
        assert_eq!(drain(&mut m2), vec![request]);
        assert!(drain(&mut m1).is_empty());

        let left = Message::broadcast(MessageKind::PeerLeft, p(2));
        directory.route(left);
        assert_eq!(drain(&mut m1), vec![left]);
        assert!(drain(&mut m2).is_empty());
    }

    #[test]
    fn test_route_to_departed_peer_is_dropped() {
        let directory = Directory::new();
        let (h1, mut m1) = mailbox_peer(1);
        let (h2, mut m2) = mailbox_peer(2);
        directory.register(h1).unwrap();
        directory.register(h2).unwrap();
        drain(&mut m1);

        let handle = directory.deregister(p(2)).expect("peer 2 registered");
        assert_eq!(handle.id(), p(2));
        assert!(directory.deregister(p(2)).is_none());
        drain(&mut m2);

        directory.route(Message::new(MessageKind::GrantLock, p(1), p(2)));
        assert!(drain(&mut m2).is_empty());

        // the departed peer can still broadcast its farewell
        directory.route(Message::broadcast(MessageKind::PeerLeft, p(2)));
        assert_eq!(drain(&mut m1), vec![Message::broadcast(MessageKind::PeerLeft, p(2))]);
    }

    #[test]
    fn test_route_survives_dropped_mailbox() {
        let directory = Directory::new();
        let (h1, m1) = mailbox_peer(1);
        directory.register(h1).unwrap();
        drop(m1);

        directory.route(Message::new(MessageKind::RequestLock, p(2), p(1)));
        assert!(directory.contains(p(1)));
    }
}
