// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stop::StopRegistration;
use core::fmt;
use std::collections::BTreeMap;
use std::time::Instant;

/// Orders entries by deadline; the sequence number breaks ties so entries
/// scheduled earlier complete earlier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(super) struct EntryKey {
    pub(super) at: Instant,
    pub(super) seq: u64,
}

pub(super) enum TimerFire {
    /// The deadline passed; carries the `now` observed by the firing batch.
    At(Instant),
    /// The entry's stop was requested before the deadline.
    Cancelled,
}

pub(super) struct TimerEntry {
    complete: Box<dyn FnOnce(TimerFire) + Send>,
    registration: Option<StopRegistration>,
}

/// The pending set of a timer, ordered by `(deadline, seq)`.
pub(super) struct TimerQueue {
    entries: BTreeMap<EntryKey, TimerEntry>,
}

// === impl TimerEntry ===

impl TimerEntry {
    pub(super) fn new(complete: impl FnOnce(TimerFire) + Send + 'static) -> Self {
        Self {
            complete: Box::new(complete),
            registration: None,
        }
    }

    pub(super) fn attach_registration(&mut self, registration: StopRegistration) {
        self.registration = Some(registration);
    }

    /// Completes the entry. Must be called without holding the timer lock.
    pub(super) fn fire(self, fire: TimerFire) {
        // deregister first; the entry has already left the queue
        drop(self.registration);
        (self.complete)(fire);
    }
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("cancellable", &self.registration.is_some())
            .finish_non_exhaustive()
    }
}

// === impl TimerQueue ===

impl TimerQueue {
    pub(super) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(super) fn insert(&mut self, key: EntryKey, entry: TimerEntry) {
        let evicted = self.entries.insert(key, entry);
        debug_assert!(evicted.is_none(), "timer entry key reused");
    }

    pub(super) fn remove(&mut self, key: &EntryKey) -> Option<TimerEntry> {
        self.entries.remove(key)
    }

    pub(super) fn get_mut(&mut self, key: &EntryKey) -> Option<&mut TimerEntry> {
        self.entries.get_mut(key)
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first_key_value().map(|(key, _)| key.at)
    }

    /// Removes up to `max` entries whose deadline is at or before `now`, in
    /// queue order.
    pub(super) fn pop_ready(&mut self, now: Instant, max: usize) -> Vec<TimerEntry> {
        let mut ready = Vec::new();
        while ready.len() < max {
            let due = self
                .next_deadline()
                .is_some_and(|deadline| deadline <= now);
            if !due {
                break;
            }
            let (_, entry) = self.entries.pop_first().unwrap();
            ready.push(entry);
        }
        ready
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("len", &self.len())
            .finish()
    }
}
