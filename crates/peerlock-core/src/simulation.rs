//! Simulation controller
//!
//! Owns the directory, the resource guard and the join handle of every
//! peer task. Peers get strictly increasing identities starting at 1, so
//! the oldest live peer is always the one with the smallest id.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::SimulationConfig;
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::guard::ResourceGuard;
use crate::message::{Message, PeerId};
use crate::negotiation::LockState;
use crate::peer::{Peer, PeerStatus};

/// Per-peer line of a statistics report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    pub id: PeerId,
    pub state: LockState,
    pub acquisitions: u64,
}

/// Point-in-time statistics of a running simulation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationStats {
    pub uptime_ms: u64,
    pub peers: Vec<PeerStats>,
    pub total_acquisitions: u64,
    pub violations: u64,
    pub starvations: u64,
}

impl SimulationStats {
    /// True if no invariant breach was observed
    pub fn is_clean(&self) -> bool {
        self.violations == 0 && self.starvations == 0
    }
}

/// Spawns, tracks and stops peer actors
pub struct Simulation {
    config: Arc<SimulationConfig>,
    directory: Arc<Directory>,
    guard: Arc<ResourceGuard>,
    tasks: BTreeMap<PeerId, JoinHandle<()>>,
    next_id: u32,
    started_at: Instant,
}

impl Simulation {
    /// Validate `config` and create an empty simulation
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            directory: Arc::new(Directory::new()),
            guard: Arc::new(ResourceGuard::new()),
            tasks: BTreeMap::new(),
            next_id: 1,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn guard(&self) -> &Arc<ResourceGuard> {
        &self.guard
    }

    /// Start a new peer and announce it to everyone. Must be called from
    /// within a tokio runtime.
    pub fn spawn_peer(&mut self) -> Result<PeerId> {
        let id = PeerId::new(self.next_id);
        let (peer, handle) = Peer::new(
            id,
            Arc::clone(&self.config),
            Arc::clone(&self.directory),
            Arc::clone(&self.guard),
        )?;

        // registered before the task runs so its seeds are queued first
        self.directory.register(handle)?;
        self.tasks.insert(id, tokio::spawn(peer.run()));
        self.next_id += 1;

        info!(peer = %id, live = self.tasks.len(), "Peer spawned");
        Ok(id)
    }

    /// Stop a peer and wait for its task to finish
    pub async fn remove_peer(&mut self, id: PeerId) -> Result<()> {
        let task = self.tasks.remove(&id).ok_or(Error::PeerNotFound(id))?;

        match self.directory.deregister(id) {
            Some(handle) => handle.deliver(Message::shutdown(id)),
            None => warn!(peer = %id, "Peer task had no directory entry"),
        }

        task.await.map_err(|e| Error::PeerTaskFailed {
            id,
            reason: e.to_string(),
        })?;

        info!(peer = %id, live = self.tasks.len(), "Peer removed");
        Ok(())
    }

    /// Remove the longest-lived peer, if any
    pub async fn remove_oldest(&mut self) -> Result<Option<PeerId>> {
        let Some(&id) = self.tasks.keys().next() else {
            return Ok(None);
        };
        self.remove_peer(id).await?;
        Ok(Some(id))
    }

    /// Acquisitions of a live peer so far
    pub fn acquisition_count(&self, id: PeerId) -> Option<u64> {
        self.directory.get(id).map(|handle| handle.acquisition_count())
    }

    /// Latest snapshot of every live peer, ascending by id
    pub fn statuses(&self) -> Vec<PeerStatus> {
        self.directory
            .handles()
            .iter()
            .map(|handle| handle.status())
            .collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.tasks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Mutual-exclusion violations observed by the guard
    pub fn violations(&self) -> u64 {
        self.guard.violations()
    }

    /// Starvation watchdog expiries reported so far
    pub fn starvations(&self) -> u64 {
        self.guard.starvations()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn stats(&self) -> SimulationStats {
        let peers: Vec<PeerStats> = self
            .statuses()
            .into_iter()
            .map(|status| PeerStats {
                id: status.id,
                state: status.state,
                acquisitions: status.acquisitions,
            })
            .collect();

        SimulationStats {
            uptime_ms: self.uptime().as_millis() as u64,
            total_acquisitions: peers.iter().map(|p| p.acquisitions).sum(),
            peers,
            violations: self.violations(),
            starvations: self.starvations(),
        }
    }

    /// Stop every peer, oldest first
    pub async fn shutdown(mut self) -> Result<SimulationStats> {
        let stats = self.stats();
        while self.remove_oldest().await?.is_some() {}
        info!(
            acquisitions = stats.total_acquisitions,
            violations = stats.violations,
            starvations = stats.starvations,
            "Simulation stopped"
        );
        Ok(stats)
    }
}
