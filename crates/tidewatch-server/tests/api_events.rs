use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tidewatch_events::{EventLog, NewSystemEvent, SqliteEventLog};
use tidewatch_server::stream::{StreamHub, StreamSettings};
use tidewatch_server::{app, AppState};
use tidewatch_types::SystemEventKind;
use tower::ServiceExt;

fn setup() -> (axum::Router, SqliteEventLog) {
    let pool = tidewatch_db::create_pool(":memory:", tidewatch_db::DbRuntimeSettings::default())
        .unwrap();
    tidewatch_db::run_migrations(&pool.get().unwrap()).unwrap();

    let log = SqliteEventLog::new(pool.clone());
    let hub = Arc::new(StreamHub::new(
        Arc::new(log.clone()),
        StreamSettings::default(),
    ));
    (app(AppState { pool, hub }), log)
}

fn at_ms(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap()
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn health_check_returns_ok() {
    let (app, _log) = setup();
    let (status, json) = get(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn list_events_since_cursor() {
    let (app, log) = setup();
    log.append(&NewSystemEvent::at(SystemEventKind::VaultReshared, at_ms(100)))
        .unwrap();
    let second = log
        .append(&NewSystemEvent::at(SystemEventKind::PolicyCreated, at_ms(200)).with_public_key("02aa"))
        .unwrap();

    let (status, json) = get(app.clone(), "/api/events?since=100").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);
    assert_eq!(json["events"][0]["id"], second);
    assert_eq!(json["events"][0]["event_type"], "policy_created");
    assert_eq!(json["events"][0]["public_key"], "02aa");
    assert!(json["events"][0].get("policy_id").is_none());

    let (_, json) = get(app, "/api/events").await;
    assert_eq!(json["count"], 2);
}

#[tokio::test]
async fn list_events_limit_is_clamped() {
    let (app, log) = setup();
    for i in 0..5 {
        log.append(&NewSystemEvent::at(SystemEventKind::VaultDeleted, at_ms(i * 10)))
            .unwrap();
    }

    let (_, json) = get(app.clone(), "/api/events?limit=2").await;
    assert_eq!(json["count"], 2);
    assert_eq!(json["events"][0]["id"], 1);

    let (_, json) = get(app, "/api/events?limit=0").await;
    assert_eq!(json["count"], 1);
}

#[tokio::test]
async fn list_events_rejects_bad_cursor() {
    let (app, _log) = setup();

    let (status, _) = get(app.clone(), "/api/events?since=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(app, &format!("/api/events?since={}", i64::MAX)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
