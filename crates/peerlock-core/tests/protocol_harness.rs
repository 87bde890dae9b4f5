//! Randomized protocol harness
//!
//! Drives `LockNegotiation` state machines directly, without tokio. Every
//! ordered pair of peers gets its own FIFO channel and the harness picks
//! which channel to deliver from at random, which covers far more
//! interleavings than a real run. Peers join and leave along the way.

use peerlock_core::message::{Message, MessageKind, PeerId};
use peerlock_core::negotiation::{LockNegotiation, LockState, Outcome};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

const MAX_PEERS: usize = 7;

struct Network {
    rng: StdRng,
    peers: BTreeMap<PeerId, LockNegotiation>,
    channels: BTreeMap<(PeerId, PeerId), VecDeque<Message>>,
    /// (requester, granter) pairs with an unanswered `RequestLock`
    unanswered: BTreeSet<(PeerId, PeerId)>,
    /// Deregistered peers still draining their inbox; nothing new reaches them
    departing: BTreeSet<PeerId>,
    next_id: u32,
    /// Unicasts dropped because the recipient was deregistered but still running
    dropped_while_leaving: u64,
    acquisitions: u64,
}

impl Network {
    fn new(seed: u64, initial: usize) -> Self {
        let mut net = Self {
            rng: StdRng::seed_from_u64(seed),
            peers: BTreeMap::new(),
            channels: BTreeMap::new(),
            unanswered: BTreeSet::new(),
            departing: BTreeSet::new(),
            next_id: 1,
            dropped_while_leaving: 0,
            acquisitions: 0,
        };
        for _ in 0..initial {
            net.join();
        }
        net
    }

    fn push(&mut self, from: PeerId, to: PeerId, msg: Message) {
        self.channels.entry((from, to)).or_default().push_back(msg);
    }

    fn is_routable(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id) && !self.departing.contains(&id)
    }

    fn route(&mut self, msg: Message) {
        if msg.is_broadcast() {
            let others: Vec<_> = self
                .peers
                .keys()
                .copied()
                .filter(|&id| id != msg.from && self.is_routable(id))
                .collect();
            for id in others {
                self.push(msg.from, id, msg);
            }
            return;
        }
        if !self.is_routable(msg.to) {
            if self.departing.contains(&msg.to) {
                self.dropped_while_leaving += 1;
            }
            return;
        }

        match msg.kind {
            MessageKind::RequestLock => {
                assert!(
                    self.unanswered.insert((msg.from, msg.to)),
                    "second request from {} to {} before a grant",
                    msg.from,
                    msg.to
                );
            }
            MessageKind::GrantLock => {
                assert!(
                    self.unanswered.remove(&(msg.to, msg.from)),
                    "grant from {} to {} answers no request",
                    msg.from,
                    msg.to
                );
            }
            _ => {}
        }
        self.push(msg.from, msg.to, msg);
    }

    fn apply(&mut self, outcome: Outcome) {
        if outcome.acquired {
            self.acquisitions += 1;
        }
        for msg in outcome.outgoing {
            self.route(msg);
        }
        self.check_exclusion();
    }

    fn check_exclusion(&self) {
        let holders: Vec<_> = self
            .peers
            .values()
            .filter(|neg| neg.is_holding())
            .map(|neg| neg.id())
            .collect();
        assert!(holders.len() <= 1, "peers {:?} hold the lock together", holders);
    }

    /// Same ordering as the directory: the newcomer learns everyone first,
    /// then everyone learns the newcomer.
    fn join(&mut self) {
        let id = PeerId::new(self.next_id);
        self.next_id += 1;

        let existing: Vec<_> = self
            .peers
            .keys()
            .copied()
            .filter(|&other| self.is_routable(other))
            .collect();
        for &other in &existing {
            self.push(other, id, Message::new(MessageKind::PeerJoined, other, id));
        }
        for &other in &existing {
            self.push(id, other, Message::broadcast(MessageKind::PeerJoined, id));
        }
        self.peers.insert(id, LockNegotiation::new(id));
    }

    /// Same ordering as a removal: the peer is deregistered first, so new
    /// messages for it are dropped while everyone keeps running. It finishes
    /// once it has handled what was already queued for it.
    fn begin_leave(&mut self, id: PeerId) {
        self.departing.insert(id);
        self.reap_departed();
    }

    fn has_inbound(&self, id: PeerId) -> bool {
        self.channels
            .iter()
            .any(|((_, to), queue)| *to == id && !queue.is_empty())
    }

    /// Stop every departing peer with an empty inbox. `PeerLeft` is its
    /// final message.
    fn reap_departed(&mut self) {
        let done: Vec<_> = self
            .departing
            .iter()
            .copied()
            .filter(|&id| !self.has_inbound(id))
            .collect();
        for id in done {
            self.departing.remove(&id);
            self.peers.remove(&id);
            self.unanswered.retain(|&(a, b)| a != id && b != id);
            self.route(Message::broadcast(MessageKind::PeerLeft, id));
        }
    }

    fn deliver(&mut self, key: (PeerId, PeerId)) {
        let Some(msg) = self.channels.get_mut(&key).and_then(VecDeque::pop_front) else {
            return;
        };
        let Some(neg) = self.peers.get_mut(&key.1) else {
            return;
        };

        if msg.kind == MessageKind::GrantLock {
            assert_eq!(
                neg.state(),
                LockState::Requesting,
                "{} received {} outside of an episode",
                neg.id(),
                msg
            );
            assert!(neg.awaiting_grant_from().contains(&msg.from));
        }

        let outcome = neg.on_message(&msg);
        self.apply(outcome);
    }

    fn pending_channels(&self) -> Vec<(PeerId, PeerId)> {
        self.channels
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(&key, _)| key)
            .collect()
    }

    fn pick_peer<F>(&mut self, filter: F) -> Option<PeerId>
    where
        F: Fn(&LockNegotiation) -> bool,
    {
        self.peers
            .values()
            .filter(|&neg| filter(neg))
            .map(|neg| neg.id())
            .choose(&mut self.rng)
    }

    fn attempt(&mut self, id: PeerId) {
        let outcome = self
            .peers
            .get_mut(&id)
            .map(LockNegotiation::attempt_acquire)
            .unwrap_or_default();
        self.apply(outcome);
    }

    fn release(&mut self, id: PeerId) {
        let outcome = self
            .peers
            .get_mut(&id)
            .map(LockNegotiation::release)
            .unwrap_or_default();
        self.apply(outcome);
    }

    fn step(&mut self) {
        let roll = self.rng.gen_range(0..100);
        let pending = self.pending_channels();

        if roll < 60 && !pending.is_empty() {
            let key = pending[self.rng.gen_range(0..pending.len())];
            self.deliver(key);
        } else if roll < 75 {
            if let Some(id) = self.pick_peer(|neg| neg.state() == LockState::Idle) {
                self.attempt(id);
            }
        } else if roll < 90 {
            if let Some(id) = self.pick_peer(LockNegotiation::is_holding) {
                self.release(id);
            }
        } else if roll < 95 {
            if self.peers.len() < MAX_PEERS {
                self.join();
            }
        } else if self.peers.len() - self.departing.len() > 1 {
            let departing = self.departing.clone();
            if let Some(id) = self.pick_peer(|neg| !departing.contains(&neg.id())) {
                self.begin_leave(id);
            }
        }
        self.reap_departed();
    }

    /// Deliver everything and let every holder release, with no new
    /// attempts or membership changes.
    fn settle(&mut self) {
        for _ in 0..100_000 {
            self.reap_departed();
            let pending = self.pending_channels();
            if !pending.is_empty() {
                let key = pending[self.rng.gen_range(0..pending.len())];
                self.deliver(key);
            } else if let Some(id) = self.pick_peer(LockNegotiation::is_holding) {
                self.release(id);
            } else {
                return;
            }
        }
        panic!("network did not settle");
    }

    fn check_settled(&self) {
        assert!(self.departing.is_empty(), "still leaving: {:?}", self.departing);
        let live: BTreeSet<_> = self.peers.keys().copied().collect();
        for neg in self.peers.values() {
            assert_eq!(
                neg.state(),
                LockState::Idle,
                "peer {} still waiting with nothing in flight",
                neg.id()
            );
            assert!(neg.wanting_lock().is_empty());
            assert!(neg.deferred_grants().is_empty());
            assert!(neg.requested_from().is_empty());
            assert!(neg.awaiting_grant_from().is_empty());

            let mut expected = live.clone();
            expected.remove(&neg.id());
            assert_eq!(neg.known_peers(), &expected, "membership of {}", neg.id());
        }
        assert!(self.unanswered.is_empty(), "unanswered: {:?}", self.unanswered);
    }
}

#[test]
fn test_random_schedules_preserve_exclusion_and_progress() {
    let mut dropped = 0;
    for seed in 0..40 {
        let mut net = Network::new(seed, 3);
        for _ in 0..3_000 {
            net.step();
        }
        net.settle();
        net.check_settled();
        assert!(net.acquisitions > 0, "seed {} never acquired", seed);
        dropped += net.dropped_while_leaving;
    }
    assert!(dropped > 0, "no message ever reached a deregistered peer");
}

#[test]
fn test_heavy_contention_without_membership_changes() {
    for seed in 100..120 {
        let mut net = Network::new(seed, 5);
        for _ in 0..2_000 {
            let pending = net.pending_channels();
            if !pending.is_empty() && net.rng.gen_bool(0.7) {
                let key = pending[net.rng.gen_range(0..pending.len())];
                net.deliver(key);
            } else if let Some(id) = net.pick_peer(|neg| neg.state() == LockState::Idle) {
                net.attempt(id);
            } else if let Some(id) = net.pick_peer(LockNegotiation::is_holding) {
                net.release(id);
            }
        }
        net.settle();
        net.check_settled();
        assert!(net.acquisitions >= 5, "seed {} acquired {} times", seed, net.acquisitions);
    }
}

/// Everyone asks at once, then messages arrive in the worst order for the
/// lowest id. Each peer must still hold exactly once.
#[test]
fn test_simultaneous_attempts_each_hold_once() {
    for seed in 200..230 {
        let mut net = Network::new(seed, 4);
        let ids: Vec<_> = net.peers.keys().copied().collect();

        // deliver the join announcements first
        while !net.pending_channels().is_empty() {
            let key = net.pending_channels()[0];
            net.deliver(key);
        }
        for &id in &ids {
            net.attempt(id);
        }

        net.settle();
        net.check_settled();
        assert_eq!(net.acquisitions, ids.len() as u64, "seed {}", seed);
    }
}
