use crate::coordinator::{Coordinator, DeviceIdentity, Operator};
use crate::errors::{Error, ErrorKind};
use crate::model::{
    AckRequest, AckResponse, CommandListResponse, Command, DeliveredCommand, HeartbeatRequest,
    HeartbeatResponse, PollQuery, PollResponse, QueueCommandRequest, QueueCommandResponse,
    ReadingsRequest, ReadingsResponse, StatusResponse,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

pub const DEVICE_KEY_HEADER: &str = "x-device-key";
pub const ORGANIZATION_HEADER: &str = "x-organization-id";

const DEFAULT_POLL_BATCH: usize = 10;

#[derive(Clone)]
struct AppState {
    coordinator: Arc<Coordinator>,
}

pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    let state = AppState { coordinator };

    Router::new()
        .route("/api/v1/device/readings", post(post_readings))
        .route("/api/v1/device/heartbeat", post(post_heartbeat))
        .route("/api/v1/device/commands", get(poll_commands))
        .route("/api/v1/device/commands/:id", put(acknowledge_command))
        .route(
            "/api/v1/devices/:id/commands",
            post(queue_command).get(pending_commands),
        )
        .route("/api/v1/devices/:id/commands/:command_id", get(get_command))
        .route("/api/v1/devices/:id/status", get(device_status))
        .with_state(state)
}

async fn device_caller(state: &AppState, headers: &HeaderMap) -> Result<DeviceIdentity, AppError> {
    let key = headers
        .get(DEVICE_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Forbidden("missing device credential".to_string()))?;
    Ok(state.coordinator.authenticate_device(key).await?)
}

fn operator_caller(headers: &HeaderMap) -> Result<Operator, AppError> {
    // set by the authenticating proxy in front of this service
    let org = headers
        .get(ORGANIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Forbidden("missing organization".to_string()))?;
    Ok(Operator::new(org))
}

async fn post_readings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReadingsRequest>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let caller = device_caller(&state, &headers).await?;
    let accepted = state
        .coordinator
        .post_readings(&caller, &req.device_id, req.batch)
        .await?;
    Ok(Json(ReadingsResponse { accepted }))
}

async fn post_heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let caller = device_caller(&state, &headers).await?;
    let status = state
        .coordinator
        .post_heartbeat(&caller, &req.device_id, req.observed_at)
        .await?;
    Ok(Json(HeartbeatResponse { status }))
}

async fn poll_commands(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PollQuery>,
) -> Result<Json<PollResponse>, AppError> {
    let caller = device_caller(&state, &headers).await?;
    let commands = state
        .coordinator
        .poll_commands(
            &caller,
            &params.device_id,
            params.max_batch.unwrap_or(DEFAULT_POLL_BATCH),
        )
        .await?;
    Ok(Json(PollResponse {
        commands: commands.into_iter().map(DeliveredCommand::from).collect(),
    }))
}

async fn acknowledge_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(command_id): Path<Uuid>,
    Json(req): Json<AckRequest>,
) -> Result<Json<AckResponse>, AppError> {
    let caller = device_caller(&state, &headers).await?;
    let command = state
        .coordinator
        .acknowledge_command(&caller, &req.device_id, command_id, req.result)
        .await?;
    Ok(Json(AckResponse {
        id: command.id,
        state: command.state,
    }))
}

async fn queue_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
    Json(req): Json<QueueCommandRequest>,
) -> Result<(StatusCode, Json<QueueCommandResponse>), AppError> {
    let caller = operator_caller(&headers)?;
    let ttl = Duration::try_seconds(req.ttl_secs)
        .ok_or_else(|| Error::InvalidArgument(format!("ttl_secs {} out of range", req.ttl_secs)))?;
    let command_id = state
        .coordinator
        .queue_command(&caller, &device_id, req.payload, ttl)
        .await?;
    Ok((StatusCode::CREATED, Json(QueueCommandResponse { command_id })))
}

async fn pending_commands(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Result<Json<CommandListResponse>, AppError> {
    let caller = operator_caller(&headers)?;
    let commands = state
        .coordinator
        .get_pending_commands(&caller, &device_id)
        .await?;
    Ok(Json(CommandListResponse { commands }))
}

async fn get_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((device_id, command_id)): Path<(String, Uuid)>,
) -> Result<Json<Command>, AppError> {
    let caller = operator_caller(&headers)?;
    let command = state
        .coordinator
        .get_command(&caller, &device_id, command_id)
        .await?;
    Ok(Json(command))
}

async fn device_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let caller = operator_caller(&headers)?;
    let status = state
        .coordinator
        .get_device_status(&caller, &device_id)
        .await?;
    Ok(Json(status))
}

struct AppError(Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match self.0.kind() {
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ErrorKind::InvalidArgument => (StatusCode::BAD_REQUEST, "invalid_argument"),
            ErrorKind::InvalidState => (StatusCode::CONFLICT, "invalid_state"),
            ErrorKind::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        };

        if status == StatusCode::SERVICE_UNAVAILABLE {
            error!("API error: {}", self.0);
        } else {
            debug!("API error: {}", self.0);
        }

        (
            status,
            Json(json!({ "error": code, "message": self.0.to_string() })),
        )
            .into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}
