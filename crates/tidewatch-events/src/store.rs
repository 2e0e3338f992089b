//! Persistence operations for the system event log.
//!
//! All writes go through [`append_event`], which inserts a row and lets
//! SQLite assign the id. Reads go through [`query_events_after`] (the
//! stream engine's strict "newer than" query) or [`query_events`] (filtered,
//! bounded reads for the HTTP history endpoint).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tidewatch_types::{EventKind, SystemEventKind};
use uuid::Uuid;

use crate::error::EventLogError;
use crate::event::{from_epoch_micros, NewSystemEvent, SystemEvent};

const SELECT_COLUMNS: &str =
    "SELECT id, public_key, policy_id, event_type, event_data, created_at_us FROM system_events";

/// Appends a single event and returns the id the log assigned to it.
///
/// # Errors
///
/// Returns `EventLogError::Database` on SQL failure.
pub fn append_event(conn: &Connection, event: &NewSystemEvent) -> Result<i64, EventLogError> {
    let id = conn.query_row(
        "INSERT INTO system_events (public_key, policy_id, event_type, event_data, created_at_us)
         VALUES (?1, ?2, ?3, ?4, ?5)
         RETURNING id",
        params![
            event.public_key,
            event.policy_id.map(|id| id.to_string()),
            event.kind.as_str(),
            event.payload,
            event.created_at.timestamp_micros(),
        ],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(id)
}

/// Returns every event whose `created_at` is strictly greater than `after`,
/// in ascending id order.
///
/// # Errors
///
/// Returns `EventLogError::Database` on SQL failure or when a stored
/// timestamp is out of range.
pub fn query_events_after(
    conn: &Connection,
    after: DateTime<Utc>,
) -> Result<Vec<SystemEvent>, EventLogError> {
    let sql = format!("{SELECT_COLUMNS} WHERE created_at_us > ?1 ORDER BY id ASC");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![after.timestamp_micros()], read_event)?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

/// Filter criteria for bounded reads of the event log.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events created strictly after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only events of this kind.
    pub kind: Option<SystemEventKind>,
    /// Only events concerning this policy.
    pub policy_id: Option<Uuid>,
    /// Maximum number of events to return (default: 100).
    pub limit: Option<i64>,
}

/// Queries the event log with optional filters.
///
/// Results are returned in ascending id order, bounded by `filter.limit`
/// (default 100).
///
/// # Errors
///
/// Returns `EventLogError::Database` on SQL failure.
pub fn query_events(
    conn: &Connection,
    filter: &EventFilter,
) -> Result<Vec<SystemEvent>, EventLogError> {
    // Clauses and bind parameters are collected separately so nothing is
    // interpolated into the SQL text.
    let mut clauses: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    let mut idx = 1u32;

    if let Some(since) = filter.since {
        clauses.push(format!("created_at_us > ?{idx}"));
        param_values.push(Box::new(since.timestamp_micros()));
        idx += 1;
    }

    if let Some(kind) = filter.kind {
        clauses.push(format!("event_type = ?{idx}"));
        param_values.push(Box::new(kind.as_str()));
        idx += 1;
    }

    if let Some(policy_id) = filter.policy_id {
        clauses.push(format!("policy_id = ?{idx}"));
        param_values.push(Box::new(policy_id.to_string()));
        idx += 1;
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!("{SELECT_COLUMNS} {where_clause} ORDER BY id ASC LIMIT ?{idx}");
    param_values.push(Box::new(filter.limit.unwrap_or(100)));

    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| &**p).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), read_event)?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

/// Decodes one row. Labels and policy ids this build cannot interpret do
/// not fail the row: a query that errors on one row would never get past it.
fn read_event(row: &Row<'_>) -> rusqlite::Result<SystemEvent> {
    let id: i64 = row.get(0)?;

    let policy_id = row.get::<_, Option<String>>(2)?.and_then(|raw| {
        Uuid::parse_str(&raw)
            .inspect_err(|e| {
                tracing::warn!(event_id = id, policy_id = %raw, "ignoring malformed policy id: {}", e);
            })
            .ok()
    });

    let micros: i64 = row.get(5)?;
    let created_at =
        from_epoch_micros(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(5, micros))?;

    Ok(SystemEvent {
        id,
        public_key: row.get(1)?,
        policy_id,
        kind: EventKind::from_label(row.get(3)?),
        payload: row.get(4)?,
        created_at,
    })
}
