//! Orchestrator: the single writer of lifecycle state.
//!
//! One actor task owns every mutation of the credentials, the access rule,
//! the backend and the readiness gate. Everything else talks to it through
//! an [`Orchestrator`] handle:
//!
//! ```text
//!   proxy requests ──ensure_setup()──▶ signal queue (depth 1, coalescing) ─┐
//!   proxy retries ──request_recovery()─▶ close gate + signal ──────────────┤
//!   control API ────admin(action)─────▶ command queue ─────────────────────┤
//!                                                                          ▼
//!                                                               OrchestratorActor
//!                                                                          │
//!                        gate (watch) ◀── open / close / fail ─────────────┘
//! ```
//!
//! A lazily triggered boot and an explicit admin action can therefore never
//! interleave. A failed transition marks the gate failed so that waiting
//! requests return promptly; the next [`Orchestrator::ensure_setup`] clears the
//! failure and retries from scratch.

use crate::access::{AccessError, AccessGate};
use crate::backend::{BackendController, BackendError, BackendState};
use crate::collaborators::{CollaboratorError, Provisioner, StateStore, StateUpdate};
use crate::credentials::{CredentialError, CredentialManager};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Readiness gate. Requests wait while it is `Closed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum GateState {
    Closed,
    Open,
    /// The last setup attempt failed; waiters give up instead of blocking.
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("re-provisioning failed: {0}")]
    Provision(#[source] CollaboratorError),

    #[error("setup failed: {0}")]
    SetupFailed(String),

    #[error("timed out waiting for the backend to become ready")]
    SetupTimeout,

    #[error("orchestrator is not running")]
    Stopped,
}

impl OrchestratorError {
    /// True when the failure needs the operator to re-authenticate with the
    /// cloud control plane.
    pub fn is_auth_error(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_auth_error(),
            Self::Access(e) => e.is_unauthorized(),
            Self::Provision(e) => e.is_unauthorized(),
            _ => false,
        }
    }
}

/// Explicit operator actions, serialized with lazy setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminAction {
    /// Stop, rotate credentials, start
    Restart,
    /// Delete, rotate credentials, re-provision
    Reset,
    /// Stop and remove the access rule
    Stop,
    /// Start if stopped
    Start,
    /// Run setup now and report the outcome
    Ensure,
    /// Rotate credentials, restarting a running backend so it picks them up
    Rotate,
}

impl AdminAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Reset => "reset",
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Ensure => "ensure",
            Self::Rotate => "rotate",
        }
    }
}

impl fmt::Display for AdminAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdminAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(Self::Restart),
            "reset" => Ok(Self::Reset),
            "stop" => Ok(Self::Stop),
            "start" => Ok(Self::Start),
            "ensure" => Ok(Self::Ensure),
            "rotate" => Ok(Self::Rotate),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

struct AdminCommand {
    action: AdminAction,
    reply: oneshot::Sender<Result<(), OrchestratorError>>,
}

/// Cloneable handle to the orchestrator actor.
#[derive(Clone)]
pub struct Orchestrator {
    gate: Arc<watch::Sender<GateState>>,
    signal_tx: mpsc::Sender<()>,
    admin_tx: mpsc::Sender<AdminCommand>,
    reset_pending: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        credentials: Arc<CredentialManager>,
        backend: Arc<BackendController>,
        access: Arc<AccessGate>,
        provisioner: Option<Arc<dyn Provisioner>>,
        state: Arc<dyn StateStore>,
    ) -> (Self, OrchestratorActor) {
        let (gate, _) = watch::channel(GateState::Closed);
        let gate = Arc::new(gate);
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (admin_tx, admin_rx) = mpsc::channel(16);
        let reset_pending = Arc::new(AtomicBool::new(false));

        let handle = Self {
            gate: Arc::clone(&gate),
            signal_tx,
            admin_tx,
            reset_pending: Arc::clone(&reset_pending),
        };
        let actor = OrchestratorActor {
            credentials,
            backend,
            access,
            provisioner,
            state,
            gate,
            reset_pending,
            signal_rx,
            admin_rx,
            rotated: false,
        };
        (handle, actor)
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        *self.gate.borrow() == GateState::Open
    }

    fn signal(&self) {
        // A full queue already holds a pending transition
        let _ = self.signal_tx.try_send(());
    }

    /// Ask for the backend to be made ready. No-op while the gate is open.
    pub fn ensure_setup(&self) {
        if self.is_open() {
            return;
        }
        self.gate.send_if_modified(|state| {
            if matches!(state, GateState::Failed(_)) {
                *state = GateState::Closed;
                true
            } else {
                false
            }
        });
        self.signal();
    }

    /// Close the gate and force a fresh setup pass. Used when a request
    /// finds the backend unreachable.
    pub fn request_recovery(&self) {
        info!("Backend unreachable, forcing recovery");
        self.gate.send_replace(GateState::Closed);
        metrics::gauge!("llmgate_gate_open").set(0.0);
        self.reset_pending.store(true, Ordering::Release);
        self.signal();
    }

    /// Wait until the gate opens. Fails if setup fails or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), OrchestratorError> {
        let mut rx = self.gate.subscribe();
        let state = tokio::time::timeout(timeout, rx.wait_for(|s| *s != GateState::Closed))
            .await
            .map_err(|_| OrchestratorError::SetupTimeout)?
            .map_err(|_| OrchestratorError::Stopped)?
            .clone();

        match state {
            GateState::Failed(message) => Err(OrchestratorError::SetupFailed(message)),
            _ => Ok(()),
        }
    }

    /// Run an admin action and wait for its outcome.
    pub async fn admin(&self, action: AdminAction) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.admin_tx
            .send(AdminCommand { action, reply })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)?
    }
}

/// The task that owns lifecycle state. Created by [`Orchestrator::new`] and
/// driven by [`OrchestratorActor::run`].
pub struct OrchestratorActor {
    credentials: Arc<CredentialManager>,
    backend: Arc<BackendController>,
    access: Arc<AccessGate>,
    provisioner: Option<Arc<dyn Provisioner>>,
    state: Arc<dyn StateStore>,
    gate: Arc<watch::Sender<GateState>>,
    reset_pending: Arc<AtomicBool>,
    signal_rx: mpsc::Receiver<()>,
    admin_rx: mpsc::Receiver<AdminCommand>,
    /// Credentials were rotated for the boot cycle in progress
    rotated: bool,
}

impl OrchestratorActor {
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(instance = %self.backend.instance(), "Orchestrator started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = self.admin_rx.recv() => {
                    let result = self.handle_admin(command.action).await;
                    let _ = command.reply.send(result);
                }
                Some(()) = self.signal_rx.recv() => self.handle_signal().await,
                else => break,
            }
        }
        info!("Orchestrator stopped");
    }

    fn open_gate(&self) {
        self.gate.send_replace(GateState::Open);
        metrics::gauge!("llmgate_gate_open").set(1.0);
    }

    fn close_gate(&self) {
        self.gate.send_replace(GateState::Closed);
        metrics::gauge!("llmgate_gate_open").set(0.0);
    }

    async fn handle_signal(&mut self) {
        if *self.gate.borrow() == GateState::Open && !self.reset_pending.load(Ordering::Acquire) {
            debug!("Gate already open, dropping setup signal");
            return;
        }

        let started = Instant::now();
        let result = self.do_setup().await;
        metrics::histogram!("llmgate_setup_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!("llmgate_setup_total", "result" => "ok").increment(1);
            }
            Err(e) => {
                metrics::counter!("llmgate_setup_total", "result" => "error").increment(1);
                if e.is_auth_error() {
                    error!(error = %e, "Setup failed: control plane credentials need re-authentication");
                } else {
                    error!(error = %e, "Setup failed");
                }
                self.gate.send_replace(GateState::Failed(e.to_string()));
                metrics::gauge!("llmgate_gate_open").set(0.0);
            }
        }
    }

    /// Forget everything cached about the running backend.
    async fn reset_cached_state(&mut self) {
        self.backend.clear_cache();
        self.credentials.invalidate().await;
    }

    async fn rotate(&mut self) -> Result<(), OrchestratorError> {
        self.credentials.rotate().await?;
        self.rotated = true;
        metrics::counter!("llmgate_rotations_total").increment(1);
        Ok(())
    }

    async fn do_setup(&mut self) -> Result<(), OrchestratorError> {
        if self.reset_pending.swap(false, Ordering::AcqRel) {
            self.reset_cached_state().await;
        }

        if self.backend.cached_address().is_some() {
            match self.backend.state().await? {
                BackendState::Running => {
                    debug!("Backend still running, reopening gate");
                    self.open_gate();
                    return Ok(());
                }
                BackendState::Stopped => {
                    info!("Backend stopped since it was last seen, starting a new boot cycle");
                    self.reset_cached_state().await;
                    self.rotated = false;
                }
                _ => {}
            }
        }

        self.access.ensure_open().await?;

        if self.backend.settled_state().await? == BackendState::Stopped && !self.rotated {
            self.rotate().await?;
        }

        let address = self.backend.ensure_running().await?;
        // The next stop observed starts a new boot cycle
        self.rotated = false;

        info!(%address, "Backend ready, opening gate");
        self.open_gate();
        Ok(())
    }

    async fn handle_admin(&mut self, action: AdminAction) -> Result<(), OrchestratorError> {
        info!(%action, "Running admin action");
        let result = match action {
            AdminAction::Restart => self.restart().await,
            AdminAction::Reset => self.reset().await,
            AdminAction::Stop => self.stop().await,
            AdminAction::Start => self.start().await,
            AdminAction::Ensure => {
                self.reset_pending.store(true, Ordering::Release);
                self.close_gate();
                let result = self.do_setup().await;
                if let Err(e) = &result {
                    self.gate.send_replace(GateState::Failed(e.to_string()));
                }
                result
            }
            AdminAction::Rotate => self.rotate_action().await,
        };

        match &result {
            Ok(()) => info!(%action, "Admin action completed"),
            Err(e) => warn!(%action, error = %e, "Admin action failed"),
        }
        result
    }

    async fn restart(&mut self) -> Result<(), OrchestratorError> {
        self.close_gate();
        self.backend.stop().await?;
        self.rotate().await?;
        self.access.ensure_open().await?;
        self.backend.ensure_running().await?;
        self.reset_cached_state().await;
        self.rotated = false;
        Ok(())
    }

    /// The backend only reads its credentials at boot, so a running backend
    /// is cycled through a restart to pick up the new bundle.
    async fn rotate_action(&mut self) -> Result<(), OrchestratorError> {
        if self.backend.settled_state().await? == BackendState::Stopped {
            return self.rotate().await;
        }
        self.restart().await
    }

    async fn reset(&mut self) -> Result<(), OrchestratorError> {
        self.close_gate();
        self.backend.delete().await?;
        self.rotate().await?;

        let provisioner = self.provisioner.as_ref().ok_or_else(|| {
            OrchestratorError::Provision(CollaboratorError::Failed(
                "no provisioner configured".to_string(),
            ))
        })?;
        provisioner
            .reconcile(self.backend.instance())
            .await
            .map_err(OrchestratorError::Provision)?;

        let update = StateUpdate {
            provisioned: Some(true),
            ..Default::default()
        };
        if let Err(e) = self.state.merge(self.backend.instance(), &update).await {
            warn!(error = %e, "Failed to record provisioned state");
        }

        self.reset_cached_state().await;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), OrchestratorError> {
        self.close_gate();
        self.backend.stop().await?;
        self.reset_cached_state().await;
        self.rotated = false;
        self.access.remove().await?;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), OrchestratorError> {
        self.access.ensure_open().await?;
        if self.backend.settled_state().await? == BackendState::Stopped {
            if !self.rotated {
                self.rotate().await?;
            }
            self.backend.ensure_running().await?;
            self.rotated = false;
        }
        self.reset_cached_state().await;
        Ok(())
    }
}
