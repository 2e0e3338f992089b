//! SQLite connection pool for the event log.
//!
//! Producers append while the live poller and replay sessions read, each
//! holding a connection for a single statement. File databases therefore run
//! in WAL mode so readers never wait on the appender. A `:memory:` database
//! exists per connection, so an in-memory log is served by one connection.

use std::time::Duration;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Path that opens a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections. Ignored for `:memory:`.
    pub pool_max_size: u32,

    /// How long a caller waits for a free connection before the read or
    /// append fails, in milliseconds. Poll ticks and replays treat that
    /// failure as transient and retry.
    pub acquire_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            acquire_timeout_ms: 2_000,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid database settings: {0}")]
    InvalidSettings(&'static str),

    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Pragmas applied to every connection as the pool opens it.
#[derive(Debug)]
struct EventLogTuning {
    busy_timeout: Duration,
    in_memory: bool,
}

impl CustomizeConnection<Connection, rusqlite::Error> for EventLogTuning {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        let expected = if self.in_memory { "memory" } else { "wal" };
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if mode != expected {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("expected {expected} journal mode, got {mode}")),
            ));
        }

        // WAL keeps committed appends durable across crashes at NORMAL; only
        // a power loss can drop the last few.
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(self.busy_timeout)
    }
}

/// Opens a pool over the event log database at `db_path`.
///
/// # Errors
///
/// Returns `PoolError::InvalidSettings` for a zero pool size and
/// `PoolError::PoolInit` if the first connection cannot be opened.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    if settings.pool_max_size == 0 {
        return Err(PoolError::InvalidSettings("pool_max_size must be at least 1"));
    }

    let in_memory = db_path == IN_MEMORY;
    let max_size = if in_memory { 1 } else { settings.pool_max_size };
    if in_memory && settings.pool_max_size > 1 {
        tracing::debug!(
            requested = settings.pool_max_size,
            "in-memory event log uses a single connection"
        );
    }

    let manager = SqliteConnectionManager::file(db_path).with_flags(
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    );

    let mut builder = Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_millis(settings.acquire_timeout_ms));
    if in_memory {
        // Recycling the only connection would discard the database.
        builder = builder.max_lifetime(None).idle_timeout(None);
    }

    let pool = builder
        .connection_customizer(Box::new(EventLogTuning {
            busy_timeout: Duration::from_millis(settings.busy_timeout_ms),
            in_memory,
        }))
        .build(manager)?;

    Ok(pool)
}
