//! Shared test support: an in-memory event log whose queries can be held
//! open and failed on demand, plus helpers for reading outbound frames.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use tidewatch_events::{EventLog, EventLogError, NewSystemEvent, SystemEvent};
use tidewatch_server::stream::{StreamHub, StreamSettings};
use tidewatch_types::SystemEventKind;
use tokio::sync::{mpsc, oneshot};

pub fn at_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().expect("valid timestamp")
}

struct Gate {
    entered: oneshot::Sender<()>,
    release: std_mpsc::Receiver<()>,
}

/// A query parked inside [`MemoryEventLog::events_after`].
///
/// The query's result is computed before it parks, so events appended while
/// it is held are not part of it.
pub struct HeldQuery {
    pub entered: oneshot::Receiver<()>,
    release: std_mpsc::Sender<()>,
}

impl HeldQuery {
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

#[derive(Default)]
struct Inner {
    events: Vec<SystemEvent>,
    next_id: i64,
}

/// In-memory [`EventLog`].
#[derive(Default)]
pub struct MemoryEventLog {
    inner: Mutex<Inner>,
    gate: Mutex<Option<Gate>>,
    failing: AtomicBool,
    queries: AtomicUsize,
}

impl MemoryEventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends an event at `created_at` and returns its id.
    pub fn push_at(&self, kind: SystemEventKind, created_at: DateTime<Utc>) -> i64 {
        self.append(&NewSystemEvent::at(kind, created_at))
            .expect("in-memory append cannot fail")
    }

    /// Appends an event stamped with the current time, kept strictly after
    /// every earlier event.
    pub fn push_now(&self, kind: SystemEventKind) -> i64 {
        let created_at = {
            let inner = self.inner.lock().unwrap();
            let now = NewSystemEvent::now(kind).created_at;
            match inner.events.last() {
                Some(last) if last.created_at >= now => last.created_at + Duration::microseconds(1),
                _ => now,
            }
        };
        self.push_at(kind, created_at)
    }

    /// Parks the next `events_after` call until the returned handle is
    /// released.
    pub fn hold_next_query(&self) -> HeldQuery {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        *self.gate.lock().unwrap() = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        HeldQuery {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl EventLog for MemoryEventLog {
    fn append(&self, event: &NewSystemEvent) -> Result<i64, EventLogError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.events.push(event.clone().into_event(id));
        Ok(id)
    }

    fn events_after(&self, after: DateTime<Utc>) -> Result<Vec<SystemEvent>, EventLogError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EventLogError::Database(rusqlite::Error::InvalidQuery));
        }

        let result: Vec<SystemEvent> = self
            .inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|event| event.created_at > after)
            .cloned()
            .collect();

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        Ok(result)
    }
}

pub fn test_settings() -> StreamSettings {
    StreamSettings {
        poll_interval: std::time::Duration::from_millis(10),
        outbound_queue_capacity: 256,
        max_concurrent_replays: 8,
    }
}

pub fn hub(log: &Arc<MemoryEventLog>) -> Arc<StreamHub> {
    hub_with(log, test_settings())
}

pub fn hub_with(log: &Arc<MemoryEventLog>, settings: StreamSettings) -> Arc<StreamHub> {
    let log: Arc<dyn EventLog> = log.clone();
    Arc::new(StreamHub::new(log, settings))
}

/// Waits for the next outbound frame and parses it.
pub async fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
    let frame = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("outbound queue closed");
    serde_json::from_str(&frame).expect("frame should be JSON")
}

/// Every frame currently queued, without waiting.
pub fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(|frame| serde_json::from_str(&frame).expect("frame should be JSON"))
        .collect()
}

/// The id of an `event` frame; panics on any other frame.
pub fn event_id(frame: &Value) -> i64 {
    assert_eq!(frame["type"], "event", "expected an event frame, got {frame}");
    frame["data"]["id"].as_i64().expect("event id")
}

pub fn is_confirmation(frame: &Value) -> bool {
    frame["type"] == "subscription_confirmed" && frame["data"]["channel"] == "system_events"
}
