use std::future::Future;
use std::time::Duration;

use axum::{
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::connection::SasSigner;
use crate::domains::gateway::{
    AcceptRequest, CompleteRequest, ErrorResponse, FetchRequest, FetchResponse, HealthResponse,
    SendRequest,
};
use crate::domains::queue::QueueDescription;
use crate::error::{ProbeError, Result};
use crate::interfaces::broker::{Broker, MAX_WAIT};
use crate::providers::local::LocalBroker;

#[derive(Clone)]
pub struct AppState {
    pub broker: LocalBroker,
    pub signer: SasSigner,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/queues/:queue",
            get(get_queue).put(put_queue).delete(delete_queue),
        )
        .route("/queues/:queue/messages", post(send_messages))
        .route("/queues/:queue/sessions/accept", post(accept_session))
        .route("/receivers/:receiver_id", delete(release_receiver))
        .route("/receivers/:receiver_id/messages", post(fetch_messages))
        .route("/receivers/:receiver_id/complete", post(complete_message))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(queue): Path<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.signer) {
        return err;
    }
    match state.broker.get_queue(&queue).await {
        Ok(description) => (StatusCode::OK, Json(description)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn put_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(queue): Path<String>,
    Json(mut description): Json<QueueDescription>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.signer) {
        return err;
    }
    if description.name.is_empty() {
        description.name = queue.clone();
    }
    if description.name != queue {
        return error_response(ProbeError::Broker(format!(
            "body names queue '{}' but the path names '{queue}'",
            description.name
        )));
    }
    match state.broker.create_queue(&description).await {
        Ok(created) => {
            tracing::info!(queue = %created.name, "queue created");
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn delete_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(queue): Path<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.signer) {
        return err;
    }
    match state.broker.delete_queue(&queue).await {
        Ok(()) => {
            tracing::info!(queue = %queue, "queue deleted");
            StatusCode::OK.into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn send_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(queue): Path<String>,
    Json(payload): Json<SendRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.signer) {
        return err;
    }
    match state.broker.send(&queue, &payload.messages).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => error_response(err),
    }
}

async fn accept_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(queue): Path<String>,
    Json(payload): Json<AcceptRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.signer) {
        return err;
    }
    let max_wait = Duration::from_millis(payload.max_wait_ms).min(MAX_WAIT);
    match state.broker.accept_session(&queue, max_wait).await {
        Ok(accepted) => (StatusCode::OK, Json(accepted)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn fetch_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(receiver_id): Path<Uuid>,
    Json(payload): Json<FetchRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.signer) {
        return err;
    }
    let max_wait = Duration::from_millis(payload.max_wait_ms).min(MAX_WAIT);
    match state
        .broker
        .fetch(receiver_id, payload.max_messages.max(1), max_wait)
        .await
    {
        Ok(messages) => (StatusCode::OK, Json(FetchResponse { messages })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn complete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(receiver_id): Path<Uuid>,
    Json(payload): Json<CompleteRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.signer) {
        return err;
    }
    match state.broker.complete(receiver_id, payload.lock_token).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

async fn release_receiver(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(receiver_id): Path<Uuid>,
) -> Response {
    if let Err(err) = authorize(&headers, &state.signer) {
        return err;
    }
    match state.broker.release(receiver_id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

fn status_for(err: &ProbeError) -> StatusCode {
    match err {
        ProbeError::EntityNotFound(_) => StatusCode::NOT_FOUND,
        ProbeError::EntityAlreadyExists(_) => StatusCode::CONFLICT,
        ProbeError::SessionLockLost(_) => StatusCode::GONE,
        ProbeError::NoSessionAvailable(_) => StatusCode::REQUEST_TIMEOUT,
        ProbeError::QuotaExceeded(_) => StatusCode::FORBIDDEN,
        ProbeError::Config(_) | ProbeError::Serialization(_) | ProbeError::Broker(_) => {
            StatusCode::BAD_REQUEST
        }
        ProbeError::Setup(_) | ProbeError::Http(_) | ProbeError::Runtime(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: ProbeError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    } else {
        tracing::debug!(error = %err, "request rejected");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
        }),
    )
        .into_response()
}

fn authorize(headers: &HeaderMap, signer: &SasSigner) -> std::result::Result<(), Response> {
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    signer.verify(token, now).map_err(|err| {
        tracing::warn!(error = %err, "rejected request");
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Unauthorized".to_string(),
                code: "Unauthorized".to_string(),
            }),
        )
            .into_response()
    })
}

pub async fn run(host: &str, port: u16, state: AppState) -> Result<()> {
    run_with_shutdown(host, port, state, futures::future::pending::<()>()).await
}

pub async fn run_with_shutdown<F>(host: &str, port: u16, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ProbeError::Runtime(e.to_string()))?;
    serve(listener, state, shutdown).await
}

pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map_err(|e| ProbeError::Runtime(e.to_string()))?;
    tracing::info!(
        %addr,
        lease_policy = ?state.broker.policy(),
        key_name = state.signer.key_name(),
        "broker gateway listening"
    );
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ProbeError::Runtime(e.to_string()))?;
    Ok(())
}
