use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use kiln_process::ErrorPayload;
use serde::Serialize;

use crate::{
    control_channel,
    error::SupervisorError,
    error_payload,
    recovery::{self, EXIT_RESTART, EXIT_UPDATE},
    state::AppState,
};

pub struct ApiError(SupervisorError);

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            SupervisorError::InvalidName(_) | SupervisorError::NotRunning => StatusCode::BAD_REQUEST,
            SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body: ErrorPayload = error_payload::from_supervisor(&self.0);
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
struct ActiveServer {
    name: String,
    players: u32,
}

#[derive(Debug, Serialize)]
struct SystemStatus {
    running: bool,
    servers: Vec<ActiveServer>,
}

async fn system_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let servers: Vec<ActiveServer> = state
        .manager
        .snapshot()
        .await
        .into_iter()
        .filter(|s| s.running)
        .map(|s| ActiveServer {
            name: s.name,
            players: s.last_occupancy.unwrap_or(0),
        })
        .collect();
    Json(SystemStatus {
        running: !servers.is_empty(),
        servers,
    })
}

#[derive(Debug, Serialize)]
struct Ack {
    success: bool,
    message: &'static str,
}

async fn system_restart(State(state): State<AppState>) -> Result<Json<Ack>, ApiError> {
    recovery::restart_supervisor(&state.manager, &state.exit, EXIT_RESTART).await?;
    Ok(Json(Ack {
        success: true,
        message: "Restarting...",
    }))
}

async fn update(State(state): State<AppState>) -> Result<Json<Ack>, ApiError> {
    recovery::restart_supervisor(&state.manager, &state.exit, EXIT_UPDATE).await?;
    Ok(Json(Ack {
        success: true,
        message: "Updating and restarting...",
    }))
}

async fn schedule_restart(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    state.manager.schedule_restart(&name).await?;
    Ok(Json(Ack {
        success: true,
        message: "Restart scheduled",
    }))
}

async fn cancel_restart(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    state.manager.cancel_restart(&name).await?;
    Ok(Json(Ack {
        success: true,
        message: "Restart cancelled",
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(control_channel::observer_ws))
        .route("/api/system/status", get(system_status))
        .route("/api/system/restart", post(system_restart))
        .route("/api/update", post(update))
        .route(
            "/api/server/:name/schedule-restart",
            post(schedule_restart),
        )
        .route("/api/server/:name/cancel-restart", post(cancel_restart))
        .with_state(state)
}
