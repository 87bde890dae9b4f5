//! Per-peer timer scheduler
//!
//! Timers are either immediate (due on the next firing pass) or delayed
//! (due once the clock reaches their deadline). Both live in one ordered map
//! keyed by deadline and insertion sequence; immediate timers sort before
//! every delayed one. An optional correlation key lets a later call replace
//! or cancel a timer.
//!
//! Firing is two-phase: all due timers are collected and removed first,
//! then handed out. Anything scheduled while handling them waits for the
//! next pass.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Position of a timer in the ordered map
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    Immediate(u64),
    Delayed(Instant, u64),
}

#[derive(Debug)]
struct Entry<T, K> {
    payload: T,
    key: Option<K>,
}

/// Ordered set of pending timers owned by a single peer
#[derive(Debug)]
pub struct TimerScheduler<T, K = T> {
    slots: BTreeMap<Slot, Entry<T, K>>,
    keys: HashMap<K, Slot>,
    next_seq: u64,
}

impl<T, K> Default for TimerScheduler<T, K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> TimerScheduler<T, K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            keys: HashMap::new(),
            next_seq: 0,
        }
    }

    fn seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert(&mut self, slot: Slot, payload: T, key: Option<K>) {
        if let Some(key) = &key {
            self.cancel(key);
            self.keys.insert(key.clone(), slot);
        }
        self.slots.insert(slot, Entry { payload, key });
    }

    /// Schedule a timer for the next firing pass
    pub fn add_immediate(&mut self, payload: T) {
        let slot = Slot::Immediate(self.seq());
        self.insert(slot, payload, None);
    }

    /// Schedule a timer that fires no earlier than `deadline`
    pub fn add_delayed(&mut self, deadline: Instant, payload: T) {
        let slot = Slot::Delayed(deadline, self.seq());
        self.insert(slot, payload, None);
    }

    /// Schedule a keyed timer, replacing any pending timer with the same key
    pub fn add_delayed_keyed(&mut self, deadline: Instant, payload: T, key: K) {
        let slot = Slot::Delayed(deadline, self.seq());
        self.insert(slot, payload, Some(key));
    }

    /// Remove the timer registered under `key`, if any
    pub fn cancel(&mut self, key: &K) -> Option<T> {
        let slot = self.keys.remove(key)?;
        self.slots.remove(&slot).map(|entry| entry.payload)
    }

    /// True if a timer is registered under `key`
    pub fn is_scheduled(&self, key: &K) -> bool {
        self.keys.contains_key(key)
    }

    pub fn has_timers(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn is_due(slot: &Slot, now: Instant) -> bool {
        match slot {
            Slot::Immediate(_) => true,
            Slot::Delayed(deadline, _) => *deadline <= now,
        }
    }

    /// True if any immediate timer exists or any deadline has passed
    pub fn has_due(&self, now: Instant) -> bool {
        self.slots
            .keys()
            .next()
            .is_some_and(|slot| Self::is_due(slot, now))
    }

    /// Delay until the earliest timer is due; `None` when nothing is pending
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.slots.keys().next().map(|slot| match slot {
            Slot::Immediate(_) => Duration::ZERO,
            Slot::Delayed(deadline, _) => deadline.saturating_duration_since(now),
        })
    }

    /// Remove and return every due timer, immediate ones first, then
    /// delayed ones in deadline order
    pub fn take_due(&mut self, now: Instant) -> Vec<T> {
        let due: Vec<Slot> = self
            .slots
            .keys()
            .take_while(|slot| Self::is_due(slot, now))
            .copied()
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for slot in due {
            if let Some(entry) = self.slots.remove(&slot) {
                if let Some(key) = entry.key {
                    self.keys.remove(&key);
                }
                fired.push(entry.payload);
            }
        }
        fired
    }

    /// Fire every due timer through `f`.
    ///
    /// `f` gets the scheduler back so it can schedule follow-up timers;
    /// those are not fired in this pass. Returns how many timers fired.
    pub fn fire_due<F>(&mut self, now: Instant, mut f: F) -> usize
    where
        F: FnMut(T, &mut Self),
    {
        let fired = self.take_due(now);
        let count = fired.len();
        for payload in fired {
            f(payload, self);
        }
        count
    }

    /// Drop every pending timer without firing it
    pub fn clear(&mut self) {
        self.slots.clear();
        self.keys.clear();
    }
}
