use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use field_store::{
    FieldKey, FieldRecord, FieldStore, InMemoryFieldStore, ManualClock, StoreError,
};
use field_sync_server::{routes, state::AppState};
use serde_json::{json, Value};
use tower::util::ServiceExt;

const TTL: u64 = 30_000;
const START_MS: u64 = 1_700_000_000_000;

fn app() -> (Router, Arc<ManualClock>) {
    let clock = ManualClock::starting_at(START_MS);
    let state = AppState::with_clock(InMemoryFieldStore::new(), clock.clone(), TTL);
    (routes::router(state), clock)
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn post(app: &Router, path: &str, payload: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    call(app, request).await
}

async fn get(app: &Router, path: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(path).body(Body::empty()).unwrap();
    call(app, request).await
}

/// Backend whose every call fails, as when the database is unreachable.
struct UnavailableStore;

fn unavailable() -> StoreError {
    StoreError::Backend("connection refused".into())
}

#[async_trait]
impl FieldStore for UnavailableStore {
    fn backend(&self) -> &'static str {
        "unavailable"
    }

    async fn load(&self, _key: &FieldKey) -> Result<Option<FieldRecord>, StoreError> {
        Err(unavailable())
    }

    async fn compare_and_swap(
        &self,
        _expected_revision: Option<u64>,
        _next: &FieldRecord,
    ) -> Result<bool, StoreError> {
        Err(unavailable())
    }

    async fn session_rows(&self, _session_code: &str) -> Result<Vec<FieldRecord>, StoreError> {
        Err(unavailable())
    }

    async fn changed_since(
        &self,
        _session_code: &str,
        _since_ms: u64,
    ) -> Result<Vec<FieldRecord>, StoreError> {
        Err(unavailable())
    }
}

fn broken_app() -> Router {
    let clock = ManualClock::starting_at(START_MS);
    routes::router(AppState::with_clock(Arc::new(UnavailableStore), clock, TTL))
}

fn lock_body(field: &str, user: &str) -> Value {
    json!({ "sessionCode": "ABC123", "fieldId": field, "userId": user })
}

fn update_body(field: &str, value: &str, user: &str) -> Value {
    json!({ "sessionCode": "ABC123", "fieldId": field, "value": value, "userId": user })
}

#[tokio::test]
async fn simple_edit_flow_is_visible_to_other_clients() {
    let (app, clock) = app();

    let (status, body) = post(&app, "/fields/lock", lock_body("activityName", "user-a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "message": "Field locked" }));

    clock.advance(Duration::from_secs(1));
    let (_, body) = post(
        &app,
        "/fields/update",
        update_body("activityName", "Lunar Lander", "user-a"),
    )
    .await;
    assert_eq!(body, json!({ "success": true, "message": "Field updated" }));

    let (_, body) = post(&app, "/fields/unlock", lock_body("activityName", "user-a")).await;
    assert_eq!(body, json!({ "success": true, "message": "Field unlocked" }));

    let (status, body) = get(&app, "/fields/ABC123/updates?since=0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["values"]["activityName"], "Lunar Lander");
    assert_eq!(body["fields"]["activityName"]["lockedBy"], Value::Null);
    assert_eq!(body["fields"]["activityName"]["userId"], "user-a");
    assert!(body["lastUpdate"].as_u64().unwrap() > START_MS);
}

#[tokio::test]
async fn contending_client_is_denied_until_release() {
    let (app, _) = app();

    let (_, body) = post(&app, "/fields/lock", lock_body("activityName", "user-a")).await;
    assert_eq!(body["success"], true);

    let (status, body) = post(&app, "/fields/lock", lock_body("activityName", "user-b")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": false, "message": "Field is locked by another user" })
    );

    let (_, body) = post(
        &app,
        "/fields/update",
        update_body("activityName", "sneaky", "user-b"),
    )
    .await;
    assert_eq!(body["success"], false);

    // A non-holder unlock still reports success and changes nothing.
    let (_, body) = post(&app, "/fields/unlock", lock_body("activityName", "user-b")).await;
    assert_eq!(body["success"], true);
    let (_, body) = get(&app, "/fields/ABC123/updates?since=0").await;
    assert_eq!(body["fields"]["activityName"]["lockedBy"], "user-a");
    assert_eq!(body["values"]["activityName"], "");

    post(&app, "/fields/unlock", lock_body("activityName", "user-a")).await;
    let (_, body) = post(&app, "/fields/lock", lock_body("activityName", "user-b")).await;
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn abandoned_lease_is_reclaimed_after_ttl() {
    let (app, clock) = app();

    post(&app, "/fields/lock", lock_body("activityName", "user-a")).await;
    clock.advance(Duration::from_millis(TTL - 1));
    let (_, body) = post(&app, "/fields/lock", lock_body("activityName", "user-b")).await;
    assert_eq!(body["success"], false);

    clock.advance(Duration::from_millis(1));
    let (_, body) = post(&app, "/fields/lock", lock_body("activityName", "user-b")).await;
    assert_eq!(body["success"], true);

    // The original holder lost the lease and cannot write over the new one.
    let (_, body) = post(
        &app,
        "/fields/update",
        update_body("activityName", "late", "user-a"),
    )
    .await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn poll_sweeps_expired_leases() {
    let (app, clock) = app();

    post(&app, "/fields/lock", lock_body("activityName", "user-a")).await;
    let (_, first) = get(&app, "/fields/ABC123/updates?since=0").await;
    assert_eq!(first["fields"]["activityName"]["lockedBy"], "user-a");
    let cursor = first["lastUpdate"].as_u64().unwrap();

    clock.advance(Duration::from_millis(TTL));
    let (_, body) = get(&app, &format!("/fields/ABC123/updates?since={cursor}")).await;
    assert_eq!(body["fields"]["activityName"]["lockedBy"], Value::Null);

    // The sweep's own change is not handed out a second time.
    let cursor = body["lastUpdate"].as_u64().unwrap();
    clock.advance(Duration::from_secs(5));
    let (_, again) = get(&app, &format!("/fields/ABC123/updates?since={cursor}")).await;
    assert!(again["fields"].as_object().unwrap().is_empty());
    assert_eq!(again["lastUpdate"].as_u64().unwrap(), cursor);
}

#[tokio::test]
async fn watermark_only_moves_forward() {
    let (app, clock) = app();

    post(&app, "/fields/update", update_body("q1", "one", "user-a")).await;
    clock.advance(Duration::from_millis(1));
    let (_, first) = get(&app, "/fields/ABC123/updates?since=0").await;
    let cursor = first["lastUpdate"].as_u64().unwrap();
    assert_eq!(first["values"]["q1"], "one");

    let (_, idle) = get(&app, &format!("/fields/ABC123/updates?since={cursor}")).await;
    assert_eq!(idle["lastUpdate"].as_u64().unwrap(), cursor);
    assert!(idle["fields"].as_object().unwrap().is_empty());
    assert!(idle["values"].as_object().unwrap().is_empty());

    clock.advance(Duration::from_millis(250));
    post(&app, "/fields/update", update_body("q2", "two", "user-b")).await;
    let (_, next) = get(&app, &format!("/fields/ABC123/updates?since={cursor}")).await;
    assert!(next["lastUpdate"].as_u64().unwrap() > cursor);
    assert_eq!(next["values"]["q2"], "two");
    assert!(next["values"].get("q1").is_none());
}

#[tokio::test]
async fn unknown_session_and_bad_since_yield_empty_delta() {
    let (app, _) = app();

    let (status, body) = get(&app, "/fields/NOPE/updates").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lastUpdate"], 0);
    assert!(body["fields"].as_object().unwrap().is_empty());

    let (_, body) = get(&app, "/fields/NOPE/updates?since=garbage").await;
    assert_eq!(body["lastUpdate"], 0);

    let (_, body) = get(&app, "/fields/NOPE/updates?since=1234:7").await;
    assert_eq!(body["lastUpdate"], 1234);
}

#[tokio::test]
async fn missing_or_malformed_input_is_a_bad_request() {
    let (app, _) = app();

    let (status, body) = post(
        &app,
        "/fields/lock",
        json!({ "sessionCode": "ABC123", "fieldId": "activityName" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({ "success": false, "message": "Missing required fields" })
    );

    let (status, _) = post(&app, "/fields/unlock", json!({ "fieldId": "x", "userId": "u" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(
        &app,
        "/fields/update",
        json!({ "sessionCode": "ABC123", "fieldId": "", "value": "v", "userId": "u" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/fields/lock")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Missing required fields");
}

#[tokio::test]
async fn routes_are_also_served_under_api_prefix() {
    let (app, _) = app();

    let (status, body) = post(&app, "/api/fields/lock", lock_body("q1", "user-a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = post(&app, "/fields/lock", lock_body("q1", "user-b")).await;
    assert_eq!(body["success"], false);

    let (status, body) = get(&app, "/api/fields/ABC123/updates?since=0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fields"]["q1"]["lockedBy"], "user-a");
}

#[tokio::test]
async fn health_and_readiness() {
    let (app, _) = app();

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, body) = get(&app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store_backend"], "memory");
    assert_eq!(body["lock_ttl_ms"], TTL);
}

#[tokio::test]
async fn metrics_expose_lock_decisions() {
    let (app, _) = app();
    post(&app, "/fields/lock", lock_body("q1", "user-a")).await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("field_lock_decision_total"));
}

#[tokio::test]
async fn cleanup_clears_expired_leases_only() {
    let (app, clock) = app();

    post(&app, "/fields/lock", lock_body("stale", "user-a")).await;
    clock.advance(Duration::from_millis(TTL - 1_000));
    post(&app, "/fields/lock", lock_body("fresh", "user-b")).await;
    clock.advance(Duration::from_millis(1_000));

    let (status, body) = post(&app, "/fields/ABC123/cleanup", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "removed": 1, "message": "Cleaned up 1 stale locks" })
    );

    let (_, body) = get(&app, "/fields/ABC123/updates?since=0").await;
    assert_eq!(body["fields"]["stale"]["lockedBy"], Value::Null);
    assert_eq!(body["fields"]["fresh"]["lockedBy"], "user-b");

    let (status, body) = post(&app, "/api/fields/ABC123/cleanup", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 0);
}

#[tokio::test]
async fn storage_failures_map_to_protocol_answers() {
    let app = broken_app();

    let (status, body) = post(&app, "/fields/lock", lock_body("q1", "user-a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": false, "message": "Failed to lock field" })
    );

    let (status, body) = post(&app, "/fields/unlock", lock_body("q1", "user-a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": true, "message": "Unlock attempted despite error" })
    );

    let (status, body) = post(&app, "/fields/update", update_body("q1", "v", "user-a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": false, "message": "Failed to update field" })
    );

    let (status, body) = get(&app, "/fields/ABC123/updates?since=1234").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lastUpdate"], 1234);
    assert!(body["fields"].as_object().unwrap().is_empty());
    assert!(body["values"].as_object().unwrap().is_empty());

    let (status, body) = post(&app, "/fields/ABC123/cleanup", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["removed"], 0);
}
