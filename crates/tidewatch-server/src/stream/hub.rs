//! The stream hub: owner of every piece of shared streaming state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tidewatch_events::{EventLog, SystemEvent};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::checkpoint::StreamCheckpoint;
use super::error::StreamError;
use super::protocol::SubscriptionRequest;
use super::registry::ConnectionRegistry;
use super::subscriber::Subscriber;
use super::{poller, replay};

/// Tuning knobs for the stream engine.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Delay between live poller ticks.
    pub poll_interval: Duration,
    /// Frames buffered per connection before it is treated as too slow and
    /// disconnected.
    pub outbound_queue_capacity: usize,
    /// Replay sessions allowed to run at once across all connections.
    pub max_concurrent_replays: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            outbound_queue_capacity: 256,
            max_concurrent_replays: 64,
        }
    }
}

/// Connection registry, poller checkpoint and replay pool for one server.
///
/// Constructed once at startup and shared as `Arc<StreamHub>`.
/// [`shutdown`](Self::shutdown) stops the poller and cancels every
/// connection and in-flight replay.
pub struct StreamHub {
    log: Arc<dyn EventLog>,
    registry: ConnectionRegistry,
    checkpoint: StreamCheckpoint,
    replay_pool: Arc<Semaphore>,
    settings: StreamSettings,
    shutdown: CancellationToken,
}

impl StreamHub {
    pub fn new(log: Arc<dyn EventLog>, settings: StreamSettings) -> Self {
        Self {
            log,
            registry: ConnectionRegistry::new(),
            checkpoint: StreamCheckpoint::new(Utc::now()),
            replay_pool: Arc::new(Semaphore::new(settings.max_concurrent_replays.max(1))),
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn checkpoint(&self) -> &StreamCheckpoint {
        &self.checkpoint
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub(crate) fn replay_pool(&self) -> Arc<Semaphore> {
        Arc::clone(&self.replay_pool)
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Registers a new connection.
    ///
    /// Returns the subscriber handle and the receiving end of its bounded
    /// outbound queue, which the caller drains into the socket.
    pub async fn connect(&self) -> (Arc<Subscriber>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.settings.outbound_queue_capacity.max(1));
        let subscriber = Arc::new(Subscriber::new(tx, self.shutdown.child_token()));
        self.registry.register(Arc::clone(&subscriber)).await;
        tracing::debug!(connection_id = %subscriber.id(), "subscriber connected");
        (subscriber, rx)
    }

    /// Cancels the connection's token (stopping any in-flight replay) and
    /// removes it from the registry.
    pub async fn disconnect(&self, subscriber: &Subscriber) {
        subscriber.cancellation().cancel();
        self.registry.deregister(subscriber.id()).await;
        tracing::debug!(connection_id = %subscriber.id(), "subscriber disconnected");
    }

    /// Starts a replay session for `request` on the replay pool.
    ///
    /// The session is dropped as soon as the connection is cancelled.
    pub fn subscribe(
        self: &Arc<Self>,
        subscriber: &Arc<Subscriber>,
        request: SubscriptionRequest,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let subscriber = Arc::clone(subscriber);
        let cancel = subscriber.cancellation().clone();
        let connection_id = subscriber.id();

        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(%connection_id, "replay cancelled");
                }
                () = replay::run(hub, subscriber, request) => {}
            }
        })
    }

    /// Resets the poller checkpoint to now and starts the live poller.
    pub fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        self.checkpoint.reset(Utc::now());
        tokio::spawn(poller::run(Arc::clone(self)))
    }

    /// Runs a single poller tick. Returns the number of events broadcast.
    ///
    /// # Errors
    ///
    /// Returns the event log error; the checkpoint is left untouched.
    pub async fn tick(&self) -> Result<usize, StreamError> {
        poller::tick(self).await
    }

    /// Stops the poller and cancels every connection.
    pub fn shutdown(&self) {
        tracing::info!("shutting down stream hub");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Reads the event log on the blocking pool.
    pub(crate) async fn events_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<SystemEvent>, StreamError> {
        let log = Arc::clone(&self.log);
        let events = tokio::task::spawn_blocking(move || log.events_after(after)).await??;
        Ok(events)
    }
}
