//! HTTP façade and push channel

use crate::bridge::Bridge;
use crate::registry::ExecutionRegistry;
use agenticqa_common::{Error, ExecuteRequest, Result, TestDefinition, VERSION};
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    bridge: Arc<Bridge>,
    registry: Arc<ExecutionRegistry>,
    permits: Option<Arc<Semaphore>>,
}

impl AppState {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        let http = &bridge.config().http;
        let registry = Arc::new(ExecutionRegistry::new(http.max_retained_executions));
        let permits = http.max_concurrent_runs.map(|n| Arc::new(Semaphore::new(n)));
        Self {
            bridge,
            registry,
            permits,
        }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    async fn admit(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.permits {
            Some(permits) => permits
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| Error::Internal("run limiter closed".to_string())),
            None => Ok(None),
        }
    }
}

/// Façade routes, including the push channel at `/ws`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/api/status", get(api_status_handler))
        .route("/execute", post(execute_handler))
        .route("/api/execute-test", post(execute_handler))
        .route("/api/executions", post(submit_handler))
        .route("/api/executions/:execution_id", get(execution_handler))
        .route("/execution/:execution_id", get(execution_handler))
        .route("/tools", get(tools_handler))
        .route("/api/tools", get(tools_handler))
        .route("/ws", get(ws_handler))
        .fallback(not_found_handler)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Dedicated push-channel listener, served at `/`.
pub fn push_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve a router until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn error_response(e: &Error) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": e.to_string(),
            "status": "failed",
        })),
    )
        .into_response()
}

fn parse_test(body: std::result::Result<Json<ExecuteRequest>, JsonRejection>) -> Result<TestDefinition> {
    let Json(request) = body.map_err(|rejection| Error::Validation(rejection.body_text()))?;
    request.into_definition()
}

// ============================================================================
// Handlers
// ============================================================================

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.bridge.state();
    Json(json!({
        "status": if current.is_ready() { "connected" } else { "disconnected" },
        "state": current,
        "server": format!("agenticqa-bridge {}", VERSION),
    }))
}

async fn api_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.bridge.state();
    Json(json!({
        "status": "running",
        "mcpReady": current.is_ready(),
        "state": current,
        "subscribers": state.bridge.notifier().subscriber_count(),
        "pendingCommands": state.bridge.pending_commands(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Run a test and answer with its report.
///
/// The run lives in its own task so it finishes (and is broadcast) even if
/// the caller goes away.
async fn execute_handler(
    State(state): State<AppState>,
    body: std::result::Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let test = match parse_test(body) {
        Ok(test) => test,
        Err(e) => {
            debug!("Rejected execute request: {}", e);
            return error_response(&e);
        }
    };
    let permit = match state.admit().await {
        Ok(permit) => permit,
        Err(e) => return error_response(&e),
    };

    let bridge = state.bridge.clone();
    let run = tokio::spawn(async move {
        let _permit = permit;
        bridge.execute(&test).await
    });

    match run.await {
        Ok(Ok(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            error!("Execution task failed: {}", e);
            error_response(&Error::Internal(e.to_string()))
        }
    }
}

/// Accept a test for background execution; poll the returned execution id.
async fn submit_handler(
    State(state): State<AppState>,
    body: std::result::Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let test = match parse_test(body) {
        Ok(test) => test,
        Err(e) => return error_response(&e),
    };

    let execution_id = state.registry.submit(&test.id);
    let response = json!({
        "executionId": execution_id,
        "testId": test.id,
        "status": "in_progress",
    });

    let execution = execution_id.clone();
    tokio::spawn(async move {
        let outcome = match state.admit().await {
            Ok(_permit) => state.bridge.execute(&test).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(report) => state.registry.complete(&execution, report),
            Err(e) => {
                warn!(execution_id = %execution, "Execution failed: {}", e);
                state.registry.fail(&execution, &test.id, e);
            }
        }
    });

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

async fn execution_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Response {
    match state.registry.get(&execution_id) {
        Some(entry) => Json(entry.to_json(&execution_id)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("unknown execution {}", execution_id),
                "status": "failed",
            })),
        )
            .into_response(),
    }
}

/// Tool list as reported by the agent.
async fn tools_handler(State(state): State<AppState>) -> Response {
    match state.bridge.list_tools().await {
        Ok(tools) => Json(tools).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let notifier = state.bridge.notifier().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, notifier))
}

/// Pump notifier events to one push subscriber until either side closes.
async fn handle_socket(socket: WebSocket, notifier: crate::notify::Notifier) {
    let mut subscription = notifier.subscribe();
    let id = subscription.id;
    info!(subscriber = %id, "Push subscriber connected");

    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = subscription.rx.recv().await {
            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            message = stream.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(text))) => {
                    debug!(subscriber = %id, "Ignoring client message: {}", text);
                }
                Some(Ok(_)) => trace!(subscriber = %id, "control frame"),
                Some(Err(e)) => {
                    debug!(subscriber = %id, "Push channel receive error: {}", e);
                    break;
                }
            },
        }
    }

    notifier.unsubscribe(&id);
    send_task.abort();
    info!(subscriber = %id, "Push subscriber disconnected");
}
