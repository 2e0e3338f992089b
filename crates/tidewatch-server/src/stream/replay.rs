//! Replay sessions: history from a `last_seen` cursor, gap reconciliation
//! against the live poller, then handover to live delivery.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tidewatch_events::SystemEvent;

use super::error::StreamError;
use super::hub::StreamHub;
use super::protocol::{self, SubscriptionRequest};
use super::subscriber::{DeliveryError, Handover, HandoverMode, Phase, Subscriber};

/// Sent to the client when its history cannot be replayed.
pub const HISTORY_FAILED: &str = "failed to get historical events";

/// Runs one subscribe request to completion.
///
/// Holds the connection's replay lock throughout, so two subscribes on the
/// same connection never interleave.
pub(crate) async fn run(hub: Arc<StreamHub>, subscriber: Arc<Subscriber>, request: SubscriptionRequest) {
    let connection_id = subscriber.id();
    let channel = request.channel;

    let _serialized = subscriber.replay_lock().lock_owned().await;
    let Ok(_permit) = hub.replay_pool().acquire_owned().await else {
        tracing::debug!(%connection_id, "replay pool closed");
        return;
    };

    let previous = subscriber.begin_replay(channel);
    let confirmation = protocol::encode_confirmation(channel);

    let Some(last_seen) = request.last_seen else {
        hand_over(&hub, &subscriber, HandoverMode::Fresh, confirmation);
        return;
    };

    let floor = match replay_history(&hub, &subscriber, last_seen).await {
        Ok(floor) => floor,
        Err(e) => {
            tracing::error!(%connection_id, %channel, "failed to replay history: {}", e);
            if let Err(e) = subscriber.send_frame(protocol::encode_error(HISTORY_FAILED)) {
                tracing::warn!(%connection_id, "failed to send replay error: {}", e);
            }
            subscriber.abort_replay(channel, previous);
            return;
        }
    };

    subscriber.set_phase(Phase::Reconciling);
    reconcile(&hub, &subscriber, last_seen, floor, confirmation).await;
}

/// Queues every event newer than `last_seen` and marks everything the
/// poller announced beforehand as handled.
///
/// Returns the floor for the first gap query: just below the newest
/// delivered timestamp, or `last_seen` when nothing was delivered.
async fn replay_history(
    hub: &StreamHub,
    subscriber: &Subscriber,
    last_seen: DateTime<Utc>,
) -> Result<DateTime<Utc>, StreamError> {
    // Anything announced before the query is already committed, so the
    // query either returns it or it predates `last_seen`. Only later
    // announcements can leave a gap.
    let covered = hub.checkpoint().announced();
    let events = hub.events_after(last_seen).await?;
    let newest = deliver_all(subscriber, events.iter())?;
    subscriber.skip_past(covered);

    tracing::debug!(
        connection_id = %subscriber.id(),
        count = events.len(),
        last_event_id = subscriber.last_event_id(),
        "replayed history"
    );
    Ok(floor_below(newest, last_seen))
}

/// Delivers whatever the poller announced while history was replaying,
/// then hands the connection over to live delivery.
async fn reconcile(
    hub: &StreamHub,
    subscriber: &Subscriber,
    last_seen: DateTime<Utc>,
    mut floor: DateTime<Utc>,
    confirmation: String,
) {
    let connection_id = subscriber.id();

    loop {
        let high_water = match subscriber.hand_over(
            hub.checkpoint(),
            HandoverMode::Reconciled,
            confirmation.clone(),
        ) {
            Ok(Handover::Live) => {
                tracing::debug!(
                    %connection_id,
                    last_event_id = subscriber.last_event_id(),
                    "subscription live"
                );
                return;
            }
            Ok(Handover::Behind { high_water }) => high_water,
            Err(e) => {
                tracing::warn!(%connection_id, "failed to confirm subscription: {}", e);
                return;
            }
        };

        let delivered = subscriber.last_event_id();
        let events = match hub.events_after(floor).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(%connection_id, "gap reconciliation query failed: {}", e);
                hand_over(hub, subscriber, HandoverMode::Force, confirmation);
                return;
            }
        };

        let gap = events
            .iter()
            .filter(|event| event.id > delivered && event.id <= high_water);
        let newest = match deliver_all(subscriber, gap) {
            Ok(newest) => newest,
            Err(e) => {
                tracing::warn!(%connection_id, "gap delivery failed: {}", e);
                return;
            }
        };

        if subscriber.last_event_id() > delivered {
            tracing::debug!(
                %connection_id,
                from = delivered,
                to = subscriber.last_event_id(),
                high_water,
                "filled replay gap"
            );
            floor = floor_below(newest, last_seen);
        } else if floor > last_seen {
            // A gap event carries an older timestamp than the floor.
            floor = last_seen;
        } else {
            tracing::warn!(
                %connection_id,
                high_water,
                last_event_id = delivered,
                "gap events missing from the event log, going live"
            );
            hand_over(hub, subscriber, HandoverMode::Force, confirmation);
            return;
        }
    }
}

fn hand_over(hub: &StreamHub, subscriber: &Subscriber, mode: HandoverMode, confirmation: String) {
    if let Err(e) = subscriber.hand_over(hub.checkpoint(), mode, confirmation) {
        tracing::warn!(connection_id = %subscriber.id(), "failed to confirm subscription: {}", e);
    }
}

/// Queues `events` in order. Returns the newest timestamp among events the
/// connection has now seen.
fn deliver_all<'a>(
    subscriber: &Subscriber,
    events: impl Iterator<Item = &'a SystemEvent>,
) -> Result<Option<DateTime<Utc>>, DeliveryError> {
    let mut newest: Option<DateTime<Utc>> = None;
    for event in events {
        match protocol::encode_event(event) {
            Ok(frame) => {
                subscriber.enqueue_replayed(event.id, frame)?;
            }
            Err(e) => {
                tracing::error!(event_id = event.id, "skipping undecodable system event: {}", e);
                subscriber.skip_past(event.id);
            }
        }
        newest = newest.max(Some(event.created_at));
    }
    Ok(newest)
}

/// One microsecond below `newest`, so a strict "after" query still returns
/// events sharing that timestamp.
fn floor_below(newest: Option<DateTime<Utc>>, last_seen: DateTime<Utc>) -> DateTime<Utc> {
    newest
        .map(|ts| (ts - Duration::microseconds(1)).max(last_seen))
        .unwrap_or(last_seen)
}
