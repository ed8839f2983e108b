use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use briefwire_archive::ArticleStore;
use briefwire_common::StateDimension;
use briefwire_engine::Runner;
use briefwire_graph::EntityStore;
use briefwire_scout::FeedRegistry;
use briefwire_telemetry::{CallFilter, Recorder};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Hard cap on simultaneous WebSocket connections.
const MAX_WS_CONNECTIONS: usize = 100;
const WS_HEARTBEAT_SECS: u64 = 15;
const WS_READ_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<Runner>,
    pub registry: Arc<FeedRegistry>,
    pub articles: ArticleStore,
    pub entities: EntityStore,
    pub recorder: Option<Arc<Recorder>>,
    pub mode: String,
    pub logs_tx: broadcast::Sender<String>,
    pub progress_tx: broadcast::Sender<String>,
    pub ws_connections: Arc<AtomicUsize>,
}

pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    // Explicit allowlist only. An empty list means same-origin, never a
    // wildcard.
    let origins: Vec<axum::http::HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/api/status", get(status))
        .route("/api/run", post(trigger_run))
        .route("/api/digest", post(trigger_digest))
        .route("/api/articles", get(list_articles))
        .route("/api/articles/{id}", delete(delete_article))
        .route("/api/feeds", get(list_feeds).post(add_feed).delete(remove_feed))
        .route("/api/feeds/{id}", axum::routing::patch(toggle_feed))
        .route("/api/progress/state", get(progress_state))
        .route("/api/entities/hot", get(hot_entities))
        .route("/api/entities/{id}/timeline", get(entity_timeline))
        .route("/api/entities/{id}/network", get(entity_network))
        .route("/api/telemetry/aggregate", get(telemetry_aggregate))
        .route("/api/telemetry/calls", get(telemetry_calls))
        .route("/ws/logs", get(ws_logs))
        .route("/ws/progress", get(ws_progress))
        .layer(cors)
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.runner.last_stats().await;
    Json(json!({
        "running": state.runner.is_running().await,
        "mode": state.mode,
        "stats": stats,
        "last_error": state.runner.last_error().await,
    }))
}

#[derive(Debug, Deserialize, Default)]
struct RunRequest {
    limit: Option<usize>,
    #[serde(default)]
    dry_run: bool,
    #[allow(dead_code)]
    concurrency: Option<usize>,
}

async fn trigger_run(
    State(state): State<AppState>,
    body: Option<Json<RunRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    if state.runner.is_running().await {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "already_running"})),
        );
    }

    let runner = state.runner.clone();
    tokio::spawn(async move {
        match runner.run_cycle(request.limit).await {
            Ok(stats) => info!(analyzed = stats.analyzed, "Admin-triggered cycle finished"),
            Err(e) => warn!(error = %e, "Admin-triggered cycle failed"),
        }
        if request.dry_run {
            info!("dry_run requested: digest left unsent");
        }
    });

    (StatusCode::OK, Json(json!({"status": "started"})))
}

async fn trigger_digest(State(state): State<AppState>) -> impl IntoResponse {
    if state.runner.is_running().await {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "already_running"})),
        );
    }

    let runner = state.runner.clone();
    tokio::spawn(async move {
        match runner.run_digest(false).await {
            Ok(sent) => info!(sent, "Admin-triggered digest finished"),
            Err(e) => warn!(error = %e, "Admin-triggered digest failed"),
        }
    });

    (StatusCode::OK, Json(json!({"status": "started"})))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_articles(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> impl IntoResponse {
    let limit = page.limit.unwrap_or(50).clamp(1, 500);
    let offset = page.offset.unwrap_or(0).max(0);
    match state.articles.list(limit, offset).await {
        Ok(rows) => {
            let items: Vec<_> = rows
                .into_iter()
                .map(|row| {
                    json!({
                        "id": row.id,
                        "url": row.url,
                        "title": row.title,
                        "source": row.source_name,
                        "category": row.category,
                        "published_at": row.published_at,
                        "fetched_at": row.fetched_at,
                        "sent_at": row.sent_at,
                        "overall_score": row.overall_score,
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!({"articles": items})))
        }
        Err(e) => storage_error(e),
    }
}

async fn delete_article(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.articles.delete(id).await {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "deleted"}))),
        Ok(false) => (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))),
        Err(e) => storage_error(e),
    }
}

async fn list_feeds(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"feeds": state.registry.list().await}))
}

#[derive(Debug, Deserialize)]
struct AddFeedRequest {
    name: String,
    url: String,
    #[serde(default)]
    category: String,
}

async fn add_feed(
    State(state): State<AppState>,
    Json(request): Json<AddFeedRequest>,
) -> impl IntoResponse {
    match state
        .registry
        .add(&request.name, &request.url, &request.category)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "added"}))),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))),
    }
}

#[derive(Debug, Deserialize)]
struct RemoveFeedRequest {
    identifier: String,
}

async fn remove_feed(
    State(state): State<AppState>,
    Json(request): Json<RemoveFeedRequest>,
) -> impl IntoResponse {
    match state.registry.remove(&request.identifier).await {
        Ok(removed) => (StatusCode::OK, Json(json!({"status": "removed", "feed": removed}))),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))),
    }
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_feed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ToggleRequest>,
) -> impl IntoResponse {
    match state.registry.set_enabled(&id, request.enabled).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "updated"}))),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))),
    }
}

#[derive(Debug, Deserialize)]
struct HotQuery {
    days: Option<i64>,
    limit: Option<i64>,
}

async fn hot_entities(
    State(state): State<AppState>,
    Query(query): Query<HotQuery>,
) -> impl IntoResponse {
    let days = query.days.unwrap_or(7).clamp(1, 365);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    match state.entities.get_hot_entities(days, limit).await {
        Ok(hot) => (StatusCode::OK, Json(json!({"entities": hot}))),
        Err(e) => storage_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    limit: Option<i64>,
    /// Comma-separated state dimensions, e.g. "TECH,CAPITAL".
    dimensions: Option<String>,
}

async fn entity_timeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TimelineQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let dimensions: Vec<StateDimension> = query
        .dimensions
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter_map(StateDimension::parse)
        .collect();
    match state
        .entities
        .get_entity_timeline(&id, None, None, &dimensions, limit)
        .await
    {
        Ok(timeline) => (StatusCode::OK, Json(json!({"timeline": timeline}))),
        Err(e) => storage_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct NetworkQuery {
    depth: Option<u32>,
}

async fn entity_network(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<NetworkQuery>,
) -> impl IntoResponse {
    let depth = query.depth.unwrap_or(2).clamp(1, 4);
    match state.entities.get_entity_network(&id, depth).await {
        Ok(network) => (StatusCode::OK, Json(json!({"network": network}))),
        Err(e) => storage_error(e),
    }
}

async fn telemetry_aggregate(State(state): State<AppState>) -> impl IntoResponse {
    let Some(recorder) = &state.recorder else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "telemetry_disabled"})),
        );
    };
    match recorder.aggregate(None, None, None).await {
        Ok(report) => (StatusCode::OK, Json(json!({"aggregate": report}))),
        Err(e) => storage_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct CallsQuery {
    session_id: Option<String>,
    agent_name: Option<String>,
    call_type: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn telemetry_calls(
    State(state): State<AppState>,
    Query(query): Query<CallsQuery>,
) -> impl IntoResponse {
    let Some(recorder) = &state.recorder else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "telemetry_disabled"})),
        );
    };
    let filter = CallFilter {
        session_id: query.session_id,
        agent_name: query.agent_name,
        call_type: query.call_type,
        ..Default::default()
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    match recorder.query(&filter, limit, offset).await {
        Ok(calls) => (StatusCode::OK, Json(json!({"calls": calls}))),
        Err(e) => storage_error(e),
    }
}

/// Snapshot for page-refresh recovery.
async fn progress_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "running": state.runner.is_running().await,
        "stats": state.runner.last_stats().await,
    }))
}

async fn ws_logs(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    serve_stream(state.logs_tx.subscribe(), state.ws_connections.clone(), upgrade)
}

async fn ws_progress(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    serve_stream(state.progress_tx.subscribe(), state.ws_connections.clone(), upgrade)
}

/// Shared WS discipline: connection cap, heartbeat ping, read timeout.
fn serve_stream(
    rx: broadcast::Receiver<String>,
    connections: Arc<AtomicUsize>,
    upgrade: WebSocketUpgrade,
) -> axum::response::Response {
    // Reserve the slot atomically; back out when over the cap.
    if connections.fetch_add(1, Ordering::SeqCst) >= MAX_WS_CONNECTIONS {
        connections.fetch_sub(1, Ordering::SeqCst);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "connection_limit"})),
        )
            .into_response();
    }

    upgrade
        .on_upgrade(move |socket| async move {
            stream_to_socket(socket, rx).await;
            connections.fetch_sub(1, Ordering::SeqCst);
        })
        .into_response()
}

async fn stream_to_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    let mut heartbeat = tokio::time::interval(Duration::from_secs(WS_HEARTBEAT_SECS));
    let read_timeout = Duration::from_secs(WS_READ_TIMEOUT_SECS);
    let mut last_read = tokio::time::Instant::now();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(line) => {
                        if socket.send(WsMessage::Text(line.into())).await.is_err() {
                            break;
                        }
                    }
                    // Fell behind the broadcast buffer: keep going.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_read.elapsed() > read_timeout {
                    info!("WebSocket read timeout, closing");
                    break;
                }
                if socket.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(_)) => last_read = tokio::time::Instant::now(),
                    _ => break,
                }
            }
        }
    }
}

fn storage_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    warn!(error = %e, "Storage error in admin surface");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "storage"})),
    )
}
