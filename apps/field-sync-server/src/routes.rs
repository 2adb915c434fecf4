use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use field_store::FieldKey;
use field_sync_proto::{
    parse_since, FieldAck, FieldUpdates, LockRequest, UpdateRequest, MSG_FIELD_LOCKED,
    MSG_FIELD_UNLOCKED, MSG_FIELD_UPDATED, MSG_LOCKED_BY_OTHER, MSG_LOCK_FAILED,
    MSG_MISSING_FIELDS, MSG_UNLOCK_DESPITE_ERROR, MSG_UPDATE_FAILED,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::lease::{LeaseDecision, ReleaseOutcome};
use crate::metrics;
use crate::state::AppState;
use crate::writer::WriteOutcome;

type AckResponse = (StatusCode, Json<FieldAck>);

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    uptime_secs: u64,
    store_backend: &'static str,
    lock_ttl_ms: u64,
}

#[derive(Serialize)]
struct CleanupResponse {
    removed: usize,
    message: String,
}

#[derive(Deserialize)]
pub struct UpdatesQuery {
    since: Option<String>,
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        store_backend: state.backend(),
        lock_ttl_ms: state.leases().ttl_ms(),
    })
}

fn ack(message: &str) -> AckResponse {
    (StatusCode::OK, Json(FieldAck::ok(message)))
}

fn rejected(message: &str) -> AckResponse {
    (StatusCode::OK, Json(FieldAck::rejected(message)))
}

fn missing_fields() -> AckResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(FieldAck::rejected(MSG_MISSING_FIELDS)),
    )
}

/// POST /fields/lock
async fn lock_field(
    State(state): State<AppState>,
    body: Result<Json<LockRequest>, JsonRejection>,
) -> AckResponse {
    let Ok(Json(req)) = body else {
        return missing_fields();
    };
    let Some((session_code, field_id, user_id)) = req.required() else {
        return missing_fields();
    };
    let key = FieldKey::new(session_code, field_id);

    match state.leases().acquire(&key, user_id).await {
        Ok(LeaseDecision::Granted { reclaimed_from, .. }) => {
            let label = if reclaimed_from.is_some() {
                "reclaimed"
            } else {
                "granted"
            };
            metrics::LOCK_DECISIONS.with_label_values(&[label]).inc();
            ack(MSG_FIELD_LOCKED)
        }
        Ok(LeaseDecision::Denied { holder }) => {
            metrics::LOCK_DECISIONS.with_label_values(&["denied"]).inc();
            info!(field = %key, client = %user_id, %holder, "field is locked by another user");
            rejected(MSG_LOCKED_BY_OTHER)
        }
        Err(err) => {
            metrics::LOCK_DECISIONS.with_label_values(&["error"]).inc();
            metrics::STORE_ERRORS.with_label_values(&["lock"]).inc();
            error!(field = %key, client = %user_id, error = %err, "lock field error");
            rejected(MSG_LOCK_FAILED)
        }
    }
}

/// POST /fields/unlock - always reports success once validated.
async fn unlock_field(
    State(state): State<AppState>,
    body: Result<Json<LockRequest>, JsonRejection>,
) -> AckResponse {
    let Ok(Json(req)) = body else {
        return missing_fields();
    };
    let Some((session_code, field_id, user_id)) = req.required() else {
        return missing_fields();
    };
    let key = FieldKey::new(session_code, field_id);

    match state.leases().release(&key, user_id).await {
        Ok(outcome) => {
            let label = match outcome {
                ReleaseOutcome::Released => "released",
                ReleaseOutcome::NotHolder => "noop",
            };
            metrics::UNLOCKS.with_label_values(&[label]).inc();
            ack(MSG_FIELD_UNLOCKED)
        }
        Err(err) => {
            metrics::UNLOCKS.with_label_values(&["error"]).inc();
            metrics::STORE_ERRORS.with_label_values(&["unlock"]).inc();
            error!(field = %key, client = %user_id, error = %err, "unlock field error");
            ack(MSG_UNLOCK_DESPITE_ERROR)
        }
    }
}

/// POST /fields/update
async fn update_field(
    State(state): State<AppState>,
    body: Result<Json<UpdateRequest>, JsonRejection>,
) -> AckResponse {
    let Ok(Json(req)) = body else {
        return missing_fields();
    };
    let Some((session_code, field_id, user_id)) = req.required() else {
        return missing_fields();
    };
    let key = FieldKey::new(session_code, field_id);
    let value = req.value.as_deref().unwrap_or_default();

    match state.writer().write(&key, value, user_id).await {
        Ok(WriteOutcome::Written { .. }) => {
            metrics::UPDATES.with_label_values(&["written"]).inc();
            ack(MSG_FIELD_UPDATED)
        }
        Ok(WriteOutcome::Denied { holder }) => {
            metrics::UPDATES.with_label_values(&["denied"]).inc();
            info!(field = %key, client = %user_id, %holder, "update rejected; field held by another user");
            rejected(MSG_LOCKED_BY_OTHER)
        }
        Err(err) => {
            metrics::UPDATES.with_label_values(&["error"]).inc();
            metrics::STORE_ERRORS.with_label_values(&["update"]).inc();
            error!(field = %key, client = %user_id, error = %err, "update field error");
            rejected(MSG_UPDATE_FAILED)
        }
    }
}

/// GET /fields/:session_code/updates?since=<unixMillis>
async fn field_updates(
    State(state): State<AppState>,
    Path(session_code): Path<String>,
    Query(query): Query<UpdatesQuery>,
) -> Json<FieldUpdates> {
    let since = parse_since(query.since.as_deref());
    match state.feed().poll(&session_code, since).await {
        Ok(updates) => Json(updates),
        Err(err) => {
            metrics::STORE_ERRORS.with_label_values(&["poll"]).inc();
            warn!(session = %session_code, since, error = %err, "get field updates error");
            Json(FieldUpdates::empty(since))
        }
    }
}

/// POST /fields/:session_code/cleanup - clears every expired lease of the
/// session right away instead of waiting for the next lock or poll.
async fn cleanup_session(
    State(state): State<AppState>,
    Path(session_code): Path<String>,
) -> (StatusCode, Json<CleanupResponse>) {
    match state.leases().sweep_expired(&session_code).await {
        Ok(removed) => {
            info!(session = %session_code, removed, "stale field locks cleaned up");
            (
                StatusCode::OK,
                Json(CleanupResponse {
                    removed,
                    message: format!("Cleaned up {removed} stale locks"),
                }),
            )
        }
        Err(err) => {
            metrics::STORE_ERRORS.with_label_values(&["cleanup"]).inc();
            error!(session = %session_code, error = %err, "cleanup stale locks error");
            (
                StatusCode::BAD_REQUEST,
                Json(CleanupResponse {
                    removed: 0,
                    message: "Failed to cleanup stale locks".into(),
                }),
            )
        }
    }
}

/// The field-sync calls, mounted both at the root and under `/api`.
fn field_routes() -> Router<AppState> {
    Router::new()
        .route("/fields/lock", post(lock_field))
        .route("/fields/unlock", post(unlock_field))
        .route("/fields/update", post(update_field))
        .route("/fields/:session_code/updates", get(field_updates))
        .route("/fields/:session_code/cleanup", post(cleanup_session))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(ready))
        .route("/metrics", get(metrics_handler))
        .merge(field_routes())
        .nest("/api", field_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        metrics::gather(),
    )
}
