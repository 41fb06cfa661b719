//! Control API for inspecting and driving the backend lifecycle.
//!
//! Provides HTTP endpoints for operator actions outside of the normal
//! request-driven flow. Every action runs through the orchestrator, so it is
//! serialized with lazy setup. Intended to run on a separate admin port.
//!
//! ## Endpoints
//!
//! | Method | Path                | Description                                      |
//! |--------|---------------------|--------------------------------------------------|
//! | GET    | `/control/status`   | Gate, backend address, pin, token totals         |
//! | POST   | `/control/restart`  | Stop, rotate credentials, open access, start     |
//! | POST   | `/control/reset`    | Delete, rotate credentials, re-provision         |
//! | POST   | `/control/stop`     | Stop and remove the access rule                  |
//! | POST   | `/control/start`    | Open access and start if stopped                 |
//! | POST   | `/control/ensure`   | Run a full setup pass now                        |
//! | POST   | `/control/rotate`   | Rotate credentials, restarting a running backend |

use crate::context::AppContext;
use crate::credentials::hex;
use crate::orchestrator::{AdminAction, GateState};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;

/// Build the control API router.
pub fn control_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/control/status", get(get_status))
        .route("/control/{action}", post(run_action))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    instance: String,
    gate: GateState,
    backend_address: Option<String>,
    access_rule_active: bool,
    pinned_fingerprint: Option<String>,
    tokens: TokenCounts,
    last_activity_unix: Option<i64>,
}

#[derive(Serialize)]
struct TokenCounts {
    input: u64,
    output: u64,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_status(State(ctx): State<Arc<AppContext>>) -> Json<StatusResponse> {
    let (input, output) = ctx.token_counts();
    Json(StatusResponse {
        instance: ctx.config.instance.clone(),
        gate: ctx.orchestrator.gate_state(),
        backend_address: ctx.backend.cached_address().map(|a| a.to_string()),
        access_rule_active: ctx.access.is_active(),
        pinned_fingerprint: ctx.credentials.pinned_fingerprint().map(|d| hex(&d)),
        tokens: TokenCounts { input, output },
        last_activity_unix: ctx.last_activity_unix(),
    })
}

async fn run_action(
    State(ctx): State<Arc<AppContext>>,
    Path(action): Path<String>,
) -> Result<Json<MessageResponse>, (StatusCode, Json<ErrorResponse>)> {
    let action: AdminAction = action
        .parse()
        .map_err(|e: String| (StatusCode::NOT_FOUND, Json(ErrorResponse { error: e })))?;

    match ctx.orchestrator.admin(action).await {
        Ok(()) => Ok(Json(MessageResponse {
            message: format!("{} completed", action),
        })),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("{} failed: {}", action, e),
            }),
        )),
    }
}
