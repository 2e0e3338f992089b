//! HTTP read access to the system event log.

use crate::stream::protocol::EventMessage;
use crate::AppState;
use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tidewatch_events::{query_events, EventFilter};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1_000;

/// Query parameters for `GET /api/events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Epoch milliseconds; only events created strictly after this instant.
    pub since: Option<i64>,
    pub limit: Option<i64>,
}

/// Response body for `GET /api/events`.
#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<EventMessage>,
    pub count: usize,
}

/// `GET /api/events?since=<epoch-ms>&limit=<n>`: pages the event log in id
/// order using the same event shape as the WebSocket stream.
pub async fn list_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, StatusCode> {
    let since = params
        .since
        .map(|ms| DateTime::<Utc>::from_timestamp_millis(ms).ok_or(StatusCode::BAD_REQUEST))
        .transpose()?;
    let filter = EventFilter {
        since,
        limit: Some(params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)),
        ..Default::default()
    };

    let pool = state.pool.clone();
    let events = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| {
            tracing::error!("failed to get db connection: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        query_events(&conn, &filter).map_err(|e| {
            tracing::error!("failed to query system events: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    let events: Vec<EventMessage> = events
        .iter()
        .filter_map(|event| match EventMessage::try_from(event) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(event_id = event.id, "skipping undecodable system event: {}", e);
                None
            }
        })
        .collect();

    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}
