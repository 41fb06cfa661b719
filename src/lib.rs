//! # llmgate
//!
//! Lazy-activation mTLS gateway for a power-cycled GPU LLM backend.
//!
//! The backend instance stays stopped until a request arrives. The first
//! request opens network access, rotates the per-boot credentials, starts the
//! instance and waits for it to serve; every request is then forwarded over
//! mutually authenticated TLS with a pinned server certificate, and the
//! streamed responses are metered for tokens.
//!
//! This crate provides:
//! - **CredentialManager**: CA, per-boot leaf certificates, bearer token, pin
//! - **BackendController**: start/stop/delete and readiness via the control plane
//! - **AccessGate**: the single network rule admitting this host
//! - **Orchestrator**: single-writer actor owning the lifecycle and the gate
//! - **Proxy**: gate-aware forwarding with retries and streaming
//! - **TokenAccountant**: per-dialect streaming token counts and rates
//! - **HeartbeatReporter**: activity timestamps for idle shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          llmgate                             │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Proxy                                                  │  │
//! │  │ - ensure_setup() + wait on gate                        │  │
//! │  │ - mTLS forward, bearer token, 12 attempts              │  │
//! │  │ - tee response body ──▶ TokenAccountant ──▶ events      │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                │ signal                ▲ gate               │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Orchestrator (actor)                                   │  │
//! │  │ AccessGate ─▶ CredentialManager ─▶ BackendController    │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │       │ rules        │ secrets           │ compute           │
//! └───────┼──────────────┼───────────────────┼───────────────────┘
//!         ▼              ▼                   ▼
//!    [firewall]    [secret store]    [GPU backend :443 mTLS]
//! ```

pub mod access;
pub mod backend;
pub mod collaborators;
mod config;
pub mod context;
pub mod control;
pub mod credentials;
pub mod events;
pub mod heartbeat;
pub mod hooks;
pub mod orchestrator;
pub mod proxy;
pub mod store;
pub mod telemetry;
pub mod tokens;

pub use config::{Config, HooksConfig, TimingConfig};
pub use context::{AppContext, Collaborators};
pub use orchestrator::{AdminAction, GateState, Orchestrator, OrchestratorError};
pub use tokens::{Dialect, TokenAccountant};

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Build the complete llmgate stack
///
/// Returns:
/// - The application context (for shutdown and status)
/// - The main Axum router (proxy)
/// - An optional metrics router (when `config.metrics_port > 0`)
/// - The control API router (for the admin port)
pub async fn build_app(
    config: Config,
    collaborators: Collaborators,
    cancel: CancellationToken,
) -> Result<(Arc<AppContext>, axum::Router, Option<axum::Router>, axum::Router)> {
    info!(instance = %config.instance, "Building llmgate");

    let metrics_router = if config.metrics_port > 0 {
        telemetry::install().map(telemetry::metrics_router)
    } else {
        None
    };

    let ctx = AppContext::start(config, collaborators, cancel)?;
    let app = proxy::proxy_router(Arc::clone(&ctx));
    let control = control::control_router(Arc::clone(&ctx));

    Ok((ctx, app, metrics_router, control))
}
