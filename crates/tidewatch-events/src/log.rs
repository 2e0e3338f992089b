//! The event log interface consumed by the stream engine.

use chrono::{DateTime, Utc};
use tidewatch_db::DbPool;

use crate::error::EventLogError;
use crate::event::{NewSystemEvent, SystemEvent};
use crate::store::{append_event, query_events_after};

/// Append/query access to the system event log.
///
/// Implementations are blocking; async callers run them on the blocking
/// thread pool (`tokio::task::spawn_blocking`).
pub trait EventLog: Send + Sync + 'static {
    /// Appends `event` and returns its assigned id.
    fn append(&self, event: &NewSystemEvent) -> Result<i64, EventLogError>;

    /// Returns all events with `created_at` strictly greater than `after`,
    /// in ascending id order.
    fn events_after(&self, after: DateTime<Utc>) -> Result<Vec<SystemEvent>, EventLogError>;
}

/// [`EventLog`] backed by the SQLite `system_events` table.
#[derive(Clone)]
pub struct SqliteEventLog {
    pool: DbPool,
}

impl SqliteEventLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// The pool this log reads from and writes to.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl EventLog for SqliteEventLog {
    fn append(&self, event: &NewSystemEvent) -> Result<i64, EventLogError> {
        let conn = self.pool.get()?;
        let id = append_event(&conn, event)?;
        tracing::debug!(event_id = id, event_type = event.kind.as_str(), "appended system event");
        Ok(id)
    }

    fn events_after(&self, after: DateTime<Utc>) -> Result<Vec<SystemEvent>, EventLogError> {
        let conn = self.pool.get()?;
        query_events_after(&conn, after)
    }
}
