use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use tether_core::ids::{SubChatId, ToolUseId};
use tether_engine::{ApprovalDecision, TurnRequest};

use crate::bridge::TurnStream;
use crate::control::{CancelResult, ControlSurface, ResolveResult};
use crate::error::ServerError;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bound on producing response headers. Turn streams themselves are not
    /// limited by it.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 4317,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub control: ControlSurface,
}

pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/turns", post(start_turn_handler))
        .route("/sub-chats/{id}/cancel", post(cancel_handler))
        .route("/sub-chats/{id}/active", get(active_handler))
        .route("/sub-chats/{id}/retry", post(retry_handler))
        .route("/sub-chats/{id}/messages", get(messages_handler))
        .route("/approvals/{tool_use_id}", post(approval_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Port 0 picks a free port.
pub async fn start(config: ServerConfig, control: ControlSurface) -> Result<ServerHandle, ServerError> {
    let router = build_router(AppState { control }, config.request_timeout);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "tether server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        addr: local_addr,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight ones to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            warn!(error = %e, "server task failed");
        }
    }
}

fn sse(stream: TurnStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream.filter_map(|frame| async move {
        match frame.to_json() {
            Ok(data) => Some(Ok(Event::default().event(frame.event_name()).data(data))),
            Err(e) => {
                warn!(error = %e, event = frame.event_name(), "failed to serialize frame");
                None
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn start_turn_handler(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    Ok(sse(state.control.start_turn(request)?))
}

async fn retry_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    Ok(sse(state.control.retry(&SubChatId::from_raw(id))?))
}

async fn cancel_handler(State(state): State<AppState>, Path(id): Path<String>) -> Json<CancelResult> {
    Json(state.control.cancel(&SubChatId::from_raw(id)))
}

async fn active_handler(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let active = state.control.is_active(&SubChatId::from_raw(id));
    Json(json!({ "active": active }))
}

async fn messages_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let loaded = state.control.messages(&SubChatId::from_raw(id))?;
    Ok(Json(json!({
        "messages": loaded.messages,
        "sessionId": loaded.session_id,
    })))
}

async fn approval_handler(
    State(state): State<AppState>,
    Path(tool_use_id): Path<String>,
    Json(decision): Json<ApprovalDecision>,
) -> Json<ResolveResult> {
    Json(
        state
            .control
            .resolve_approval(&ToolUseId::from_raw(tool_use_id), decision),
    )
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let orchestrator = state.control.bridge().orchestrator();
    Json(json!({
        "status": "healthy",
        "activeTurns": orchestrator.registry().active_count(),
        "pendingApprovals": orchestrator.broker().pending_count(),
    }))
}
