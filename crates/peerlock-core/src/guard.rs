//! Shared resource guard
//!
//! The guard is not part of the protocol. It is an oracle: every peer that
//! reaches `Holding` enters it, and entering while someone else is inside
//! means mutual exclusion is broken. The guard records the overlap and lets
//! the caller decide what to do; it never blocks, since blocking would hide
//! the bug the simulation is looking for.
//!
//! The starvation watchdog reports here too, so the controller reads every
//! invariant breach from one place.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

use crate::message::PeerId;

/// Process-wide occupancy counter for the contended resource
#[derive(Debug, Default)]
pub struct ResourceGuard {
    occupants: AtomicU32,
    entries: AtomicU64,
    violations: AtomicU64,
    starvations: AtomicU64,
}

impl ResourceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the resource on behalf of `holder`.
    ///
    /// Always succeeds; the ticket tells whether the entry was exclusive.
    /// The resource is left when the ticket is dropped.
    pub fn enter(self: &Arc<Self>, holder: PeerId) -> ResourceTicket {
        let others = self.occupants.fetch_add(1, Ordering::AcqRel);
        self.entries.fetch_add(1, Ordering::Relaxed);

        if others != 0 {
            self.violations.fetch_add(1, Ordering::Relaxed);
            error!(
                peer = %holder,
                others = others,
                "Race detected: resource entered while already held"
            );
        }

        ResourceTicket {
            guard: Arc::clone(self),
            holder,
            others,
        }
    }

    /// Number of peers currently inside
    pub fn occupants(&self) -> u32 {
        self.occupants.load(Ordering::Acquire)
    }

    /// Total entries since creation
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Entries that found the resource already occupied
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Count one watchdog expiry. The reporting peer logs the details.
    pub fn record_starvation(&self) {
        self.starvations.fetch_add(1, Ordering::Relaxed);
    }

    /// Watchdog reports since creation
    pub fn starvations(&self) -> u64 {
        self.starvations.load(Ordering::Relaxed)
    }
}

/// Proof of having entered the resource. Leaves it on drop.
pub struct ResourceTicket {
    guard: Arc<ResourceGuard>,
    holder: PeerId,
    others: u32,
}

impl ResourceTicket {
    pub fn holder(&self) -> PeerId {
        self.holder
    }

    /// True if nobody else was inside at entry
    pub fn is_exclusive(&self) -> bool {
        self.others == 0
    }

    /// How many peers were already inside at entry
    pub fn overlapping(&self) -> u32 {
        self.others
    }
}

impl Drop for ResourceTicket {
    fn drop(&mut self) {
        self.guard.occupants.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ResourceTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTicket")
            .field("holder", &self.holder)
            .field("others", &self.others)
            .finish()
    }
}
