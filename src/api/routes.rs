//! API Routes
//!
//! Operator endpoints: health, stats, peer inspection, alerts, metrics and
//! the admin ban/unban/whitelist actions.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::Metrics;
use crate::error::ReputationError;
use crate::monitor::ReputationMonitor;
use crate::registry::ReputationManager;
use crate::types::{current_timestamp, PeerId, PeerRecord, Timestamp};

/// Peers returned by list endpoints when no `n` is given
const DEFAULT_PEER_LIMIT: usize = 25;

/// Hard cap on list endpoints
const MAX_PEER_LIMIT: usize = 500;

/// Shared API state
pub struct ApiState {
    pub manager: Arc<ReputationManager>,
    pub monitor: Arc<ReputationMonitor>,
    pub metrics: Arc<Metrics>,
}

/// Build the HTTP router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))

        // Peers
        .route("/peers/top", get(get_top_peers))
        .route("/peers/diverse", get(get_diverse_peers))
        .route("/peers/:id", get(get_peer))

        // Alerts
        .route("/alerts", get(get_alerts))

        // Metrics
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))

        // Admin
        .route("/admin/ban", post(admin_ban))
        .route("/admin/unban", post(admin_unban))
        .route("/admin/whitelist", post(admin_whitelist))

        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_api_server(port: u16, state: Arc<ApiState>) -> anyhow::Result<()> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("🌐 HTTP API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn rfc3339(ts: Timestamp) -> Option<String> {
    chrono::DateTime::<chrono::Utc>::from_timestamp(ts as i64, 0).map(|t| t.to_rfc3339())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn reputation_error(err: ReputationError) -> Response {
    let status = match &err {
        ReputationError::PeerNotFound(_) => StatusCode::NOT_FOUND,
        ReputationError::Whitelisted(_) => StatusCode::CONFLICT,
        ReputationError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
        ReputationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

/// Short listing entry
fn peer_summary(record: &PeerRecord) -> serde_json::Value {
    serde_json::json!({
        "peer_id": record.peer_id,
        "address": record.address,
        "score": record.score,
        "trust_level": record.trust_level(),
        "subnet": record.network.subnet.map(|n| n.to_string()),
        "country": record.network.country,
        "last_seen": rfc3339(record.last_seen),
    })
}

/// Full peer view
fn peer_detail(record: &PeerRecord, now: Timestamp) -> serde_json::Value {
    let m = &record.metrics;
    serde_json::json!({
        "peer_id": record.peer_id,
        "address": record.address,
        "score": record.score,
        "trust_level": record.trust_level(),
        "penalty_points": record.penalty_points,
        "whitelisted": record.whitelisted,
        "ban": {
            "state": record.ban.label(),
            "active": record.ban.is_active(now),
            "reason": record.ban.reason(),
            "expires_at": record.ban.expires_at().and_then(rfc3339),
            "temp_ban_count": record.temp_ban_count,
        },
        "first_seen": rfc3339(record.first_seen),
        "last_seen": rfc3339(record.last_seen),
        "network": {
            "ip": record.network.ip,
            "subnet": record.network.subnet.map(|n| n.to_string()),
            "asn": record.network.asn,
            "country": record.network.country,
        },
        "metrics": {
            "connected": m.is_connected(),
            "connections": m.connection_count,
            "uptime_secs": m.uptime_until(now.max(record.last_seen)),
            "valid_messages": m.valid_message_count,
            "invalid_messages": m.invalid_message_count,
            "validity_ratio": m.validity_ratio(),
            "bytes_received": m.bytes_received,
            "avg_latency_ms": m.avg_latency_ms,
            "blocks_propagated": m.blocks_propagated,
            "avg_block_propagation_ms": m.avg_block_propagation_ms,
            "evidence": m.evidence,
        },
        "violations": m.violations,
        "recent_violations": record.violation_log.len(),
        "score_history": record.score_history,
    })
}

/// GET /health - Latest health check
async fn health_check(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let health = state.monitor.health();
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// GET /stats - Aggregate peer statistics
async fn get_stats(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let stats = state.manager.stats();
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.metrics.uptime_secs(),
        "stats": stats,
        "storage_degraded": state.manager.storage_degraded(),
    }))
}

#[derive(Debug, Deserialize)]
struct PeerListQuery {
    n: Option<usize>,
    min_score: Option<f64>,
}

impl PeerListQuery {
    fn limit(&self) -> usize {
        self.n.unwrap_or(DEFAULT_PEER_LIMIT).min(MAX_PEER_LIMIT)
    }

    fn min_score(&self) -> f64 {
        self.min_score.unwrap_or(0.0)
    }
}

/// GET /peers/:id - Full record of one peer
async fn get_peer(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.manager.get_peer(&PeerId::new(id.clone())) {
        Some(record) => Json(peer_detail(&record, current_timestamp())).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown peer {}", id)),
    }
}

/// GET /peers/top - Highest-scoring unbanned peers
async fn get_top_peers(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PeerListQuery>,
) -> impl IntoResponse {
    let peers: Vec<_> = state
        .manager
        .get_top_peers(query.limit(), query.min_score())
        .iter()
        .map(peer_summary)
        .collect();

    Json(serde_json::json!({
        "count": peers.len(),
        "peers": peers,
    }))
}

/// GET /peers/diverse - Unbanned peers spread across subnets and countries
async fn get_diverse_peers(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PeerListQuery>,
) -> impl IntoResponse {
    let peers: Vec<_> = state
        .manager
        .get_diverse_peers(query.limit(), query.min_score())
        .iter()
        .map(peer_summary)
        .collect();

    Json(serde_json::json!({
        "count": peers.len(),
        "peers": peers,
    }))
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    since: Option<Timestamp>,
}

/// GET /alerts - Alerts raised since a timestamp
async fn get_alerts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AlertQuery>,
) -> impl IntoResponse {
    let alerts = state.monitor.alerts_since(query.since.unwrap_or(0));
    Json(serde_json::json!({
        "count": alerts.len(),
        "alerts": alerts,
    }))
}

/// GET /metrics - Prometheus format metrics
async fn get_metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.metrics.update_from_stats(&state.manager.stats());

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.to_prometheus(),
    )
}

/// GET /metrics/json - JSON format metrics
async fn get_metrics_json(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.metrics.update_from_stats(&state.manager.stats());
    Json(state.metrics.to_json())
}

#[derive(Debug, Deserialize)]
struct BanRequest {
    peer_id: String,
    /// Omitted for a permanent ban
    duration_secs: Option<u64>,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct PeerRequest {
    peer_id: String,
}

#[derive(Debug, Deserialize)]
struct WhitelistRequest {
    peer_id: String,
    #[serde(default)]
    remove: bool,
}

/// POST /admin/ban
async fn admin_ban(State(state): State<Arc<ApiState>>, Json(req): Json<BanRequest>) -> Response {
    let peer_id = PeerId::new(req.peer_id);
    let reason = if req.reason.trim().is_empty() { "operator" } else { req.reason.as_str() };

    match state.manager.ban_peer(&peer_id, req.duration_secs, reason) {
        Ok(ban) => Json(serde_json::json!({
            "peer_id": peer_id,
            "ban": ban.label(),
            "reason": ban.reason(),
            "expires_at": ban.expires_at().and_then(rfc3339),
        }))
        .into_response(),
        Err(e) => reputation_error(e),
    }
}

/// POST /admin/unban
async fn admin_unban(State(state): State<Arc<ApiState>>, Json(req): Json<PeerRequest>) -> Response {
    let peer_id = PeerId::new(req.peer_id);
    match state.manager.unban_peer(&peer_id) {
        Ok(()) => Json(serde_json::json!({ "peer_id": peer_id, "ban": "none" })).into_response(),
        Err(e) => reputation_error(e),
    }
}

/// POST /admin/whitelist
async fn admin_whitelist(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<WhitelistRequest>,
) -> Response {
    let peer_id = PeerId::new(req.peer_id);
    let result = if req.remove {
        state.manager.remove_from_whitelist(&peer_id)
    } else {
        state.manager.add_to_whitelist(&peer_id)
    };

    match result {
        Ok(()) => Json(serde_json::json!({
            "peer_id": peer_id,
            "whitelisted": !req.remove,
        }))
        .into_response(),
        Err(e) => reputation_error(e),
    }
}
