//! Per-connection subscription state and the outbound delivery gate.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tidewatch_types::Channel;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::StreamCheckpoint;

/// Where a connection is in its subscribe lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Connected, nothing subscribed yet.
    Idle,
    /// Streaming history for a subscribe request.
    Replaying,
    /// History delivered; filling the gap up to the poller's high-water id.
    Reconciling,
    /// Receiving live broadcasts.
    Live,
}

impl Phase {
    /// Live broadcasts are withheld while this is true.
    pub fn is_replaying(self) -> bool {
        matches!(self, Self::Replaying | Self::Reconciling)
    }
}

/// Why a frame could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The outbound queue is full. The connection has been cancelled.
    #[error("outbound queue full")]
    QueueFull,
    /// The connection's writer has gone away.
    #[error("connection closed")]
    Closed,
}

/// Result of trying to hand a connection over to live delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handover {
    /// The connection is live and the confirmation has been queued.
    Live,
    /// The poller has announced events past what this connection has
    /// received; they must be delivered first.
    Behind { high_water: i64 },
}

/// How strictly [`Subscriber::hand_over`] checks the high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoverMode {
    /// No history was requested: everything already announced counts as
    /// seen.
    Fresh,
    /// Go live only once every announced event has been delivered.
    Reconciled,
    /// Go live regardless of the high-water mark.
    Force,
}

#[derive(Debug)]
struct SubscriberState {
    channels: HashSet<Channel>,
    phase: Phase,
    /// Greatest event id queued on this connection by any phase.
    last_event_id: i64,
}

/// One subscriber connection.
///
/// Every event frame passes through a gate that drops ids not greater than
/// the last one queued, so a connection sees strictly increasing ids no
/// matter which phase produced them.
#[derive(Debug)]
pub struct Subscriber {
    id: Uuid,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    state: Mutex<SubscriberState>,
    /// Held for the full duration of a replay.
    replay_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Subscriber {
    pub fn new(outbound: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            cancel,
            state: Mutex::new(SubscriberState {
                channels: HashSet::new(),
                phase: Phase::Idle,
                last_event_id: 0,
            }),
            replay_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancelled when the connection closes or overflows.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn replay_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.replay_lock)
    }

    fn state(&self) -> MutexGuard<'_, SubscriberState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn last_event_id(&self) -> i64 {
        self.state().last_event_id
    }

    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.state().channels.contains(&channel)
    }

    /// Subscribed to `channel` and not replaying.
    pub fn is_live_on(&self, channel: Channel) -> bool {
        let state = self.state();
        state.channels.contains(&channel) && !state.phase.is_replaying()
    }

    /// Subscribes to `channel` and enters [`Phase::Replaying`].
    ///
    /// Returns the phase and subscription status from before the call so an
    /// aborted replay can restore them.
    pub(crate) fn begin_replay(&self, channel: Channel) -> (Phase, bool) {
        let mut state = self.state();
        let was_subscribed = !state.channels.insert(channel);
        let previous = state.phase;
        state.phase = Phase::Replaying;
        (previous, was_subscribed)
    }

    /// Restores the state saved by [`begin_replay`](Self::begin_replay).
    pub(crate) fn abort_replay(&self, channel: Channel, previous: (Phase, bool)) {
        let (phase, was_subscribed) = previous;
        let mut state = self.state();
        if !was_subscribed {
            state.channels.remove(&channel);
        }
        state.phase = if phase.is_replaying() { Phase::Idle } else { phase };
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.state().phase = phase;
    }

    /// Queues a history or gap event.
    ///
    /// Returns `Ok(false)` when the gate dropped it as already delivered.
    pub(crate) fn enqueue_replayed(&self, event_id: i64, frame: String) -> Result<bool, DeliveryError> {
        let mut state = self.state();
        if event_id <= state.last_event_id {
            return Ok(false);
        }
        self.push(frame)?;
        state.last_event_id = event_id;
        Ok(true)
    }

    /// Marks everything up to `event_id` as handled without queuing anything.
    /// Used for events that cannot be encoded and for ids a history query
    /// already covered.
    pub(crate) fn skip_past(&self, event_id: i64) {
        let mut state = self.state();
        state.last_event_id = state.last_event_id.max(event_id);
    }

    /// Queues a live broadcast event.
    ///
    /// Returns `Ok(false)` when the connection is replaying (the replay's gap
    /// reconciliation will deliver it) or the gate dropped it.
    pub fn enqueue_live(&self, event_id: i64, frame: String) -> Result<bool, DeliveryError> {
        let mut state = self.state();
        if state.phase.is_replaying() || event_id <= state.last_event_id {
            return Ok(false);
        }
        self.push(frame)?;
        state.last_event_id = event_id;
        Ok(true)
    }

    /// Queues a frame that carries no event (errors).
    pub fn send_frame(&self, frame: String) -> Result<(), DeliveryError> {
        self.push(frame)
    }

    /// Switches to [`Phase::Live`] and queues `confirmation`, in one step
    /// under the state lock so no live event can be queued in between.
    pub(crate) fn hand_over(
        &self,
        checkpoint: &StreamCheckpoint,
        mode: HandoverMode,
        confirmation: String,
    ) -> Result<Handover, DeliveryError> {
        let mut state = self.state();
        let high_water = checkpoint.announced();

        match mode {
            HandoverMode::Fresh => {
                state.last_event_id = state.last_event_id.max(high_water);
            }
            HandoverMode::Reconciled if high_water > state.last_event_id => {
                return Ok(Handover::Behind { high_water });
            }
            HandoverMode::Reconciled | HandoverMode::Force => {}
        }

        self.push(confirmation)?;
        state.phase = Phase::Live;
        Ok(Handover::Live)
    }

    fn push(&self, frame: String) -> Result<(), DeliveryError> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    "outbound queue full, disconnecting slow subscriber"
                );
                self.cancel.cancel();
                Err(DeliveryError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(capacity: usize) -> (Subscriber, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Subscriber::new(tx, CancellationToken::new()), rx)
    }

    #[test]
    fn gate_drops_stale_and_duplicate_ids() {
        let (sub, mut rx) = subscriber(8);
        sub.begin_replay(Channel::SystemEvents);

        assert_eq!(sub.enqueue_replayed(2, "e2".into()), Ok(true));
        assert_eq!(sub.enqueue_replayed(2, "e2".into()), Ok(false));
        assert_eq!(sub.enqueue_replayed(1, "e1".into()), Ok(false));
        assert_eq!(sub.enqueue_replayed(3, "e3".into()), Ok(true));

        assert_eq!(rx.try_recv().unwrap(), "e2");
        assert_eq!(rx.try_recv().unwrap(), "e3");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn live_events_withheld_while_replaying() {
        let (sub, mut rx) = subscriber(8);
        sub.begin_replay(Channel::SystemEvents);
        assert!(!sub.is_live_on(Channel::SystemEvents));
        assert_eq!(sub.enqueue_live(1, "e1".into()), Ok(false));

        sub.set_phase(Phase::Reconciling);
        assert_eq!(sub.enqueue_live(1, "e1".into()), Ok(false));

        let checkpoint = StreamCheckpoint::new(chrono::Utc::now());
        let handover = sub.hand_over(&checkpoint, HandoverMode::Reconciled, "ok".into());
        assert_eq!(handover, Ok(Handover::Live));
        assert!(sub.is_live_on(Channel::SystemEvents));
        assert_eq!(sub.enqueue_live(1, "e1".into()), Ok(true));

        assert_eq!(rx.try_recv().unwrap(), "ok");
        assert_eq!(rx.try_recv().unwrap(), "e1");
    }

    #[test]
    fn reconciled_handover_waits_for_high_water() {
        let (sub, mut rx) = subscriber(8);
        sub.begin_replay(Channel::SystemEvents);
        sub.enqueue_replayed(1, "e1".into()).unwrap();

        let checkpoint = StreamCheckpoint::new(chrono::Utc::now());
        checkpoint.announce(2);

        assert_eq!(
            sub.hand_over(&checkpoint, HandoverMode::Reconciled, "ok".into()),
            Ok(Handover::Behind { high_water: 2 })
        );
        assert_eq!(sub.phase(), Phase::Replaying);

        sub.enqueue_replayed(2, "e2".into()).unwrap();
        assert_eq!(
            sub.hand_over(&checkpoint, HandoverMode::Reconciled, "ok".into()),
            Ok(Handover::Live)
        );

        let frames: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(frames, vec!["e1", "e2", "ok"]);
    }

    #[test]
    fn fresh_handover_skips_announced_events() {
        let (sub, _rx) = subscriber(8);
        sub.begin_replay(Channel::SystemEvents);

        let checkpoint = StreamCheckpoint::new(chrono::Utc::now());
        checkpoint.announce(9);

        assert_eq!(sub.hand_over(&checkpoint, HandoverMode::Fresh, "ok".into()), Ok(Handover::Live));
        assert_eq!(sub.last_event_id(), 9);
        assert_eq!(sub.enqueue_live(9, "e9".into()), Ok(false));
        assert_eq!(sub.enqueue_live(10, "e10".into()), Ok(true));
    }

    #[test]
    fn abort_restores_previous_state() {
        let (sub, _rx) = subscriber(8);
        let previous = sub.begin_replay(Channel::SystemEvents);
        assert_eq!(previous, (Phase::Idle, false));
        sub.abort_replay(Channel::SystemEvents, previous);
        assert_eq!(sub.phase(), Phase::Idle);
        assert!(!sub.is_subscribed(Channel::SystemEvents));

        let checkpoint = StreamCheckpoint::new(chrono::Utc::now());
        sub.begin_replay(Channel::SystemEvents);
        sub.hand_over(&checkpoint, HandoverMode::Fresh, "ok".into()).unwrap();

        let previous = sub.begin_replay(Channel::SystemEvents);
        assert_eq!(previous, (Phase::Live, true));
        sub.abort_replay(Channel::SystemEvents, previous);
        assert!(sub.is_live_on(Channel::SystemEvents));
    }

    #[test]
    fn overflow_cancels_connection() {
        let (sub, _rx) = subscriber(1);
        sub.send_frame("first".into()).unwrap();

        assert_eq!(sub.send_frame("second".into()), Err(DeliveryError::QueueFull));
        assert!(sub.cancellation().is_cancelled());
    }

    #[test]
    fn closed_queue_reports_closed() {
        let (sub, rx) = subscriber(1);
        drop(rx);
        assert_eq!(sub.send_frame("x".into()), Err(DeliveryError::Closed));
        assert!(!sub.cancellation().is_cancelled());
    }
}
