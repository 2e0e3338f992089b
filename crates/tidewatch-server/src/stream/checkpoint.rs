//! Process-wide position of the live poller.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// The live poller's position in the event log.
///
/// `after` is the timestamp boundary for the next poll and is only touched
/// by the poller. The two high-water ids are atomics so that a replay
/// session can read them while holding its subscriber's lock without
/// nesting locks:
///
/// - `announced` is raised to a batch's greatest id *before* the poller
///   snapshots the registry for that batch.
/// - `broadcast` is raised after each event has been handed to every
///   snapshotted subscriber.
///
/// `broadcast <= announced` always holds.
#[derive(Debug)]
pub struct StreamCheckpoint {
    after: Mutex<DateTime<Utc>>,
    announced: AtomicI64,
    broadcast: AtomicI64,
}

impl StreamCheckpoint {
    pub fn new(after: DateTime<Utc>) -> Self {
        Self {
            after: Mutex::new(after),
            announced: AtomicI64::new(0),
            broadcast: AtomicI64::new(0),
        }
    }

    /// The timestamp the next poll queries after.
    pub fn after(&self) -> DateTime<Utc> {
        *self.after.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the timestamp boundary to `after`, never backwards.
    pub fn advance_to(&self, after: DateTime<Utc>) {
        let mut current = self.after.lock().unwrap_or_else(|e| e.into_inner());
        if after > *current {
            *current = after;
        }
    }

    /// Sets the timestamp boundary unconditionally. Used when a poller starts.
    pub fn reset(&self, after: DateTime<Utc>) {
        *self.after.lock().unwrap_or_else(|e| e.into_inner()) = after;
    }

    /// Records that the poller is about to broadcast events up to `id`.
    pub fn announce(&self, id: i64) {
        self.announced.fetch_max(id, Ordering::SeqCst);
    }

    /// Greatest id the poller has started broadcasting.
    pub fn announced(&self) -> i64 {
        self.announced.load(Ordering::SeqCst)
    }

    /// Records that event `id` has been handed to every live subscriber.
    pub fn mark_broadcast(&self, id: i64) {
        self.broadcast.fetch_max(id, Ordering::SeqCst);
    }

    /// Greatest id broadcast so far (the high-water mark).
    pub fn high_water(&self) -> i64 {
        self.broadcast.load(Ordering::SeqCst)
    }
}
