// =============================================================================
// REST API — Axum 0.7
// =============================================================================
//
// Thin adapter over the command surface. No authentication: the deployment
// assumes trusted users behind the edge.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::density::Side;

/// Build the full router: REST endpoints plus the two WebSocket surfaces.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/alerts", get(list_alerts).post(create_alert).delete(delete_all_alerts))
        .route("/alerts/all", get(list_all_alerts))
        // GET upgrades the per-user alert socket; DELETE unsubscribes by
        // alert id. Same path shape, distinguished by method.
        .route(
            "/alerts/:id",
            get(crate::api::ws::alerts_ws_handler).delete(delete_alert),
        )
        .route("/ws/densities", get(crate::api::densities::densities_ws_handler))
        .route("/densities/stats", get(densities_stats))
        .layer(cors)
        .with_state(state)
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: i64,
}

/// Alert descriptor as listed to a user, with their connection state.
#[derive(Serialize)]
struct AlertView {
    alert_id: String,
    expression: String,
    subscribers_count: usize,
    cooldown_sec: u64,
    connected: bool,
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "alerts": state.engine.len(),
        "densities": state.density_book.len(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Alerts
// =============================================================================

/// `GET /alerts?user_id=U` — the user's subscriptions.
async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    let connected = state.user_hub.is_connected(query.user_id);
    let alerts: Vec<AlertView> = state
        .commands
        .list_alerts(query.user_id)
        .into_iter()
        .map(|a| AlertView {
            alert_id: a.alert_id,
            expression: a.expression,
            subscribers_count: a.subscribers_count,
            cooldown_sec: a.cooldown_sec,
            connected,
        })
        .collect();
    Json(alerts)
}

/// `GET /alerts/all` — the system-wide inventory.
async fn list_all_alerts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.commands.list_all())
}

#[derive(Deserialize)]
struct CreateAlertRequest {
    expression: String,
    user_id: i64,
}

/// `POST /alerts` — create or join an alert.
async fn create_alert(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateAlertRequest>,
) -> impl IntoResponse {
    match state.commands.create_alert(&request.expression, request.user_id) {
        Ok(descriptor) => {
            info!(user_id = request.user_id, alert = %descriptor.alert_id, "alert registered via REST");
            (StatusCode::CREATED, Json(descriptor)).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// `DELETE /alerts/{id}?user_id=U` — unsubscribe from one alert.
async fn delete_alert(
    State(state): State<Arc<AppState>>,
    Path(alert_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    match state.commands.unsubscribe(&alert_id, query.user_id) {
        Ok(()) => Json(json!({ "unsubscribed": true, "alert_id": alert_id })).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// `DELETE /alerts?user_id=U` — unsubscribe from everything.
async fn delete_all_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    let removed = state.commands.unsubscribe_all(query.user_id);
    Json(json!({ "unsubscribed_count": removed }))
}

// =============================================================================
// Densities
// =============================================================================

/// `GET /densities/stats` — aggregate counts over the live book.
async fn densities_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut long = 0usize;
    let mut short = 0usize;
    let mut small = 0usize;
    let mut medium = 0usize;
    let mut large = 0usize;
    let mut touched = 0usize;
    let mut normal = 0usize;

    let records = state.density_book.snapshot();
    for record in &records {
        match record.side {
            Side::Long => long += 1,
            Side::Short => short += 1,
        }
        match record.current_size_usd {
            s if s < 500_000.0 => small += 1,
            s if s < 1_000_000.0 => medium += 1,
            _ => large += 1,
        }
        if record.touched && record.reduction_usd > 0.0 {
            touched += 1;
        } else {
            normal += 1;
        }
    }

    Json(json!({
        "total": records.len(),
        "by_type": { "LONG": long, "SHORT": short },
        "by_size": { "small": small, "medium": medium, "large": large },
        "by_status": { "normal": normal, "touched": touched },
        "connected_clients": state.density_feed.consumer_count(),
    }))
}
