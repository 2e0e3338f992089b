//! Schema migrations for the event log database.
//!
//! Migrations are SQL files compiled into the binary. Each one commits in the
//! same transaction as its row in `_tidewatch_migrations`, so a failure
//! leaves neither the schema change nor the record behind and the next
//! startup retries it.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

/// Ordered `(name, sql)` pairs. Append only; names are the identity.
type Migrations = [(&'static str, &'static str)];

const MIGRATIONS: &Migrations = &[
    ("000_init", include_str!("migrations/000_init.sql")),
    (
        "001_system_events",
        include_str!("migrations/001_system_events.sql"),
    ),
];

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _tidewatch_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Brings the event log schema up to date and returns how many migrations
/// this call applied.
///
/// # Errors
///
/// Returns `MigrationError` when the tracking table cannot be read or a
/// migration fails; earlier migrations in the same call stay applied.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply_pending(conn, MIGRATIONS)
}

fn apply_pending(conn: &Connection, migrations: &Migrations) -> Result<usize, MigrationError> {
    conn.execute_batch(TRACKING_TABLE)
        .map_err(MigrationError::StateQuery)?;
    let done = applied_names(conn)?;

    let mut applied = 0;
    for &(name, sql) in migrations.iter().filter(|(name, _)| !done.contains(*name)) {
        tracing::info!(migration = name, "applying migration");
        apply_one(conn, name, sql).map_err(|source| MigrationError::ExecutionFailed {
            name: name.to_string(),
            source,
        })?;
        applied += 1;
    }

    if applied == 0 {
        tracing::debug!(known = done.len(), "event log schema is current");
    }
    Ok(applied)
}

fn applied_names(conn: &Connection) -> Result<HashSet<String>, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT name FROM _tidewatch_migrations")
        .map_err(MigrationError::StateQuery)?;
    let names = stmt
        .query_map([], |row| row.get(0))
        .map_err(MigrationError::StateQuery)?
        .collect::<Result<HashSet<String>, _>>()
        .map_err(MigrationError::StateQuery)?;
    Ok(names)
}

fn apply_one(conn: &Connection, name: &str, sql: &str) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(sql)?;
    tx.execute("INSERT INTO _tidewatch_migrations (name) VALUES (?1)", [name])?;
    tx.commit()
}
