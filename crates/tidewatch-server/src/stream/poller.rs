//! The live poller: tails the event log and fans new events out to every
//! live subscriber.

use std::sync::Arc;

use chrono::Duration;
use tidewatch_types::Channel;
use tokio::time::MissedTickBehavior;

use super::error::StreamError;
use super::hub::StreamHub;
use super::protocol;

/// Polls on the hub's interval until the hub shuts down.
pub(crate) async fn run(hub: Arc<StreamHub>) {
    let mut interval = tokio::time::interval(hub.settings().poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = hub.shutdown_token().clone();

    tracing::info!(
        interval_ms = hub.settings().poll_interval.as_millis() as u64,
        "live poller started"
    );

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = tick(&hub).await {
                    tracing::error!("failed to poll system events: {}", e);
                }
            }
        }
    }

    tracing::info!("live poller stopped");
}

/// One poll of the event log.
///
/// The batch's greatest id is announced before the registry is
/// snapshotted, so a replay finishing concurrently either appears in the
/// snapshot or sees the announcement and reconciles the batch itself.
pub(crate) async fn tick(hub: &StreamHub) -> Result<usize, StreamError> {
    let checkpoint = hub.checkpoint();
    let mut events = hub.events_after(checkpoint.after()).await?;

    if events.is_empty() {
        tracing::trace!("no new system events");
        return Ok(0);
    }
    events.sort_by_key(|event| event.id);
    let first_id = events[0].id;
    let last_id = events[events.len() - 1].id;

    checkpoint.announce(last_id);
    let live = hub
        .registry()
        .snapshot_live_subscribers(Channel::SystemEvents)
        .await;

    for event in &events {
        match protocol::encode_event(event) {
            Ok(frame) => {
                for subscriber in &live {
                    if let Err(e) = subscriber.enqueue_live(event.id, frame.clone()) {
                        tracing::warn!(
                            connection_id = %subscriber.id(),
                            event_id = event.id,
                            "failed to deliver live event: {}",
                            e
                        );
                    }
                }
            }
            Err(e) => {
                tracing::error!(event_id = event.id, "failed to encode system event: {}", e);
            }
        }
        checkpoint.mark_broadcast(event.id);
    }

    if let Some(newest) = events.iter().map(|event| event.created_at).max() {
        checkpoint.advance_to(newest + Duration::microseconds(1));
    }

    tracing::debug!(
        count = events.len(),
        first_id,
        last_id,
        subscribers = live.len(),
        "broadcast system events"
    );
    Ok(events.len())
}
