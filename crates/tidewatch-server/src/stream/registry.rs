//! Registry of connected subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use tidewatch_types::Channel;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::subscriber::Subscriber;

/// Every open subscriber connection, keyed by connection id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Arc<Subscriber>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `subscriber`. Registering the same connection twice is a no-op.
    pub async fn register(&self, subscriber: Arc<Subscriber>) {
        self.connections
            .write()
            .await
            .entry(subscriber.id())
            .or_insert(subscriber);
    }

    /// Removes the connection with `id`, if present.
    pub async fn deregister(&self, id: Uuid) -> Option<Arc<Subscriber>> {
        self.connections.write().await.remove(&id)
    }

    /// Connections subscribed to `channel` that are not replaying.
    ///
    /// Each subscriber's own lock is taken briefly under the registry read
    /// lock; that is the only place the two are nested.
    pub async fn snapshot_live_subscribers(&self, channel: Channel) -> Vec<Arc<Subscriber>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|subscriber| subscriber.is_live_on(channel))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Subscriber>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::checkpoint::StreamCheckpoint;
    use crate::stream::subscriber::HandoverMode;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn subscriber() -> (Arc<Subscriber>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(Subscriber::new(tx, CancellationToken::new())), rx)
    }

    #[tokio::test]
    async fn register_is_idempotent_and_deregister_tolerates_absence() {
        let registry = ConnectionRegistry::new();
        let (sub, _rx) = subscriber();

        registry.register(Arc::clone(&sub)).await;
        registry.register(Arc::clone(&sub)).await;
        assert_eq!(registry.len().await, 1);

        assert!(registry.deregister(sub.id()).await.is_some());
        assert!(registry.deregister(sub.id()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn snapshot_excludes_unsubscribed_and_replaying() {
        let registry = ConnectionRegistry::new();
        let checkpoint = StreamCheckpoint::new(chrono::Utc::now());

        let (idle, _rx1) = subscriber();
        let (replaying, _rx2) = subscriber();
        let (live, _rx3) = subscriber();

        replaying.begin_replay(Channel::SystemEvents);
        live.begin_replay(Channel::SystemEvents);
        live.hand_over(&checkpoint, HandoverMode::Fresh, "ok".into())
            .unwrap();

        for sub in [&idle, &replaying, &live] {
            registry.register(Arc::clone(sub)).await;
        }

        let snapshot = registry.snapshot_live_subscribers(Channel::SystemEvents).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), live.id());
    }
}
