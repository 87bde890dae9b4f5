//! Peer actor
//!
//! A peer is one tokio task that owns its mailbox receiver, its timer
//! scheduler and its [`LockNegotiation`]. Nothing else can reach that state:
//! the rest of the process holds a [`PeerHandle`], which can only deliver
//! messages and read the status snapshot the peer publishes after every loop
//! iteration.
//!
//! # Run loop
//!
//! 1. Wait until a message arrives or the earliest timer is due.
//! 2. Handle at most one message.
//! 3. Fire every due timer.
//! 4. Publish a status snapshot.
//!
//! The loop ends on `Shutdown` from the system. Pending timers are dropped
//! unfired, the resource is left if held, and `PeerLeft` is broadcast as the
//! peer's final message.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{FaultPolicy, SimulationConfig};
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::guard::{ResourceGuard, ResourceTicket};
use crate::mailbox::{Mailbox, MailboxSender, Received};
use crate::message::{Message, MessageKind, PeerId};
use crate::negotiation::{references_any, LockNegotiation, LockState, Outcome};
use crate::timer::TimerScheduler;

/// Timers a peer schedules for itself. Each kind is also its own
/// correlation key, so at most one of each is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerTimer {
    /// Start competing for the lock
    AttemptAcquire,
    /// End the simulated critical section
    Release,
    /// The peer has waited too long for the lock
    Starvation,
}

/// Read-only snapshot of a peer, published after every loop iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: PeerId,
    pub state: LockState,
    pub acquisitions: u64,
    pub known_peers: BTreeSet<PeerId>,
    pub requested_from: BTreeSet<PeerId>,
    pub awaiting_grant_from: BTreeSet<PeerId>,
    pub wanting_lock: BTreeSet<PeerId>,
    pub deferred_grants: BTreeSet<PeerId>,
    /// False once the run loop has exited
    pub running: bool,
}

impl PeerStatus {
    pub(crate) fn initial(id: PeerId) -> Self {
        Self {
            id,
            state: LockState::Idle,
            acquisitions: 0,
            known_peers: BTreeSet::new(),
            requested_from: BTreeSet::new(),
            awaiting_grant_from: BTreeSet::new(),
            wanting_lock: BTreeSet::new(),
            deferred_grants: BTreeSet::new(),
            running: true,
        }
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
}

/// Message-passing handle to a running peer
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    mailbox: MailboxSender,
    status: watch::Receiver<PeerStatus>,
}

impl PeerHandle {
    pub(crate) fn new(id: PeerId, mailbox: MailboxSender, status: watch::Receiver<PeerStatus>) -> Self {
        Self { id, mailbox, status }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Put a message in the peer's mailbox. Silently dropped if the peer is
    /// gone.
    pub fn deliver(&self, msg: Message) {
        if !self.mailbox.push(msg) {
            debug!(peer = %self.id, msg = %msg, "Dropping message for terminated peer");
        }
    }

    /// Latest published snapshot
    pub fn status(&self) -> PeerStatus {
        self.status.borrow().clone()
    }

    /// How many times the peer has reached `Holding`
    pub fn acquisition_count(&self) -> u64 {
        self.status.borrow().acquisitions
    }

    /// Wait until the peer publishes a snapshot satisfying `predicate`
    pub async fn wait_for<F>(&mut self, predicate: F) -> Option<PeerStatus>
    where
        F: FnMut(&PeerStatus) -> bool,
    {
        self.status
            .wait_for(predicate)
            .await
            .ok()
            .map(|status| (*status).clone())
    }
}

/// A single participant in the protocol
pub struct Peer {
    id: PeerId,
    config: Arc<SimulationConfig>,
    directory: Arc<Directory>,
    guard: Arc<ResourceGuard>,
    mailbox: Mailbox,
    timers: TimerScheduler<PeerTimer>,
    negotiation: LockNegotiation,
    rng: StdRng,
    ticket: Option<ResourceTicket>,
    /// Start of the current episode, while waiting for the lock
    waiting_since: Option<Instant>,
    acquisitions: u64,
    status: watch::Sender<PeerStatus>,
}

impl Peer {
    /// Build a peer and the handle through which the rest of the process
    /// talks to it. Identity 0 is reserved and rejected.
    pub fn new(
        id: PeerId,
        config: Arc<SimulationConfig>,
        directory: Arc<Directory>,
        guard: Arc<ResourceGuard>,
    ) -> Result<(Peer, PeerHandle)> {
        if id.is_reserved() {
            return Err(Error::InvalidPeerId);
        }

        let (mailbox, sender) = Mailbox::new();
        let (status, status_rx) = watch::channel(PeerStatus::initial(id));
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ u64::from(id.get())),
            None => StdRng::from_entropy(),
        };

        let peer = Peer {
            id,
            config,
            directory,
            guard,
            mailbox,
            timers: TimerScheduler::new(),
            negotiation: LockNegotiation::new(id),
            rng,
            ticket: None,
            waiting_since: None,
            acquisitions: 0,
            status,
        };
        Ok((peer, PeerHandle::new(id, sender, status_rx)))
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Run until the controller sends `Shutdown`
    pub async fn run(mut self) {
        info!(peer = %self.id, "Peer started");

        let first_attempt = Instant::now() + self.config.initial_acquire_delay();
        self.timers
            .add_delayed_keyed(first_attempt, PeerTimer::AttemptAcquire, PeerTimer::AttemptAcquire);

        loop {
            let tick = Instant::now();
            let received = if self.timers.has_due(tick) {
                self.mailbox.try_pop()
            } else {
                let deadline = self.timers.time_until_next(tick).map(|delay| tick + delay);
                self.mailbox.pop_blocking(deadline).await
            };

            let now = Instant::now();
            match received {
                Received::Message(msg) if msg.kind == MessageKind::Shutdown => {
                    if msg.from.is_reserved() && msg.to == self.id {
                        break;
                    }
                    warn!(peer = %self.id, msg = %msg, "Ignoring shutdown not sent by the system");
                }
                Received::Message(msg) => self.handle_message(msg, now),
                Received::Empty => {}
                Received::Closed => {
                    warn!(peer = %self.id, "Mailbox closed without shutdown");
                    break;
                }
            }

            for timer in self.timers.take_due(now) {
                self.on_timer(timer, now);
            }

            self.publish_status(true);
        }

        self.stop();
    }

    fn handle_message(&mut self, msg: Message, now: Instant) {
        let outcome = self.negotiation.on_message(&msg);
        self.apply(outcome, now);
    }

    fn on_timer(&mut self, timer: PeerTimer, now: Instant) {
        match timer {
            PeerTimer::AttemptAcquire => {
                let outcome = self.negotiation.attempt_acquire();
                if self.negotiation.state().is_waiting() {
                    self.waiting_since = Some(now);
                    self.arm_watchdog(now);
                }
                self.apply(outcome, now);
            }
            PeerTimer::Release => {
                self.ticket = None;
                let outcome = self.negotiation.release();
                self.apply(outcome, now);

                let delay = self.random_delay(self.config.max_acquire_delay_ms);
                self.timers.add_delayed_keyed(
                    now + delay,
                    PeerTimer::AttemptAcquire,
                    PeerTimer::AttemptAcquire,
                );
            }
            PeerTimer::Starvation => {
                self.guard.record_starvation();
                let waited = self.waiting_since.map_or(Duration::ZERO, |since| now - since);
                error!(
                    peer = %self.id,
                    waited_ms = waited.as_millis() as u64,
                    state = %self.negotiation.state(),
                    awaiting = ?self.negotiation.awaiting_grant_from(),
                    wanting = ?self.negotiation.wanting_lock(),
                    "Starvation detected"
                );
                self.apply_fault_policy(self.config.watchdog.policy);
                // still stuck: keep reporting
                self.arm_watchdog(now);
            }
        }
    }

    /// Route outgoing messages, then take the lock if the step acquired it
    fn apply(&mut self, outcome: Outcome, now: Instant) {
        for msg in outcome.outgoing {
            self.directory.route(msg);
        }
        if outcome.acquired {
            self.on_acquired(now);
        }
    }

    fn on_acquired(&mut self, now: Instant) {
        self.timers.cancel(&PeerTimer::Starvation);
        self.waiting_since = None;
        self.acquisitions += 1;

        let ticket = self.guard.enter(self.id);
        let exclusive = ticket.is_exclusive();
        self.ticket = Some(ticket);
        if !exclusive {
            self.apply_fault_policy(self.config.exclusion_violation_policy);
        }

        let hold = self.random_delay(self.config.max_lock_hold_time_ms);
        debug!(peer = %self.id, hold_ms = hold.as_millis() as u64, "Holding the lock");
        self.timers
            .add_delayed_keyed(now + hold, PeerTimer::Release, PeerTimer::Release);
    }

    fn arm_watchdog(&mut self, now: Instant) {
        if !self.config.watchdog.enabled {
            return;
        }
        let peers = self.negotiation.known_peers().len() + 1;
        let bound = self.config.starvation_bound(peers);
        self.timers
            .add_delayed_keyed(now + bound, PeerTimer::Starvation, PeerTimer::Starvation);
    }

    fn apply_fault_policy(&self, policy: FaultPolicy) {
        if policy == FaultPolicy::Abort {
            error!(peer = %self.id, "Protocol invariant violated, aborting");
            std::process::abort();
        }
    }

    fn random_delay(&mut self, max_ms: u32) -> Duration {
        Duration::from_millis(self.rng.gen_range(0..=u64::from(max_ms)))
    }

    fn publish_status(&self, running: bool) {
        let neg = &self.negotiation;
        let status = PeerStatus {
            id: self.id,
            state: neg.state(),
            acquisitions: self.acquisitions,
            known_peers: neg.known_peers().clone(),
            requested_from: neg.requested_from().clone(),
            awaiting_grant_from: neg.awaiting_grant_from().clone(),
            wanting_lock: neg.wanting_lock().clone(),
            deferred_grants: neg.deferred_grants().clone(),
            running,
        };
        self.status.send_replace(status);
    }

    fn stop(mut self) {
        self.timers.clear();

        if self.ticket.take().is_some() {
            warn!(peer = %self.id, "Stopped while holding the lock, leaving the resource");
        }

        self.directory
            .route(Message::broadcast(MessageKind::PeerLeft, self.id));
        self.publish_status(false);

        info!(
            peer = %self.id,
            acquisitions = self.acquisitions,
            discarded = self.mailbox.len(),
            "Peer stopped"
        );
    }
}
