//! Database layer for Tidewatch.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. The event log table is created through the
//! versioned migrations managed by this crate.
//!
//! WAL mode lets the live poller and concurrent replay sessions read while a
//! producer appends.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
