//! Backend lifecycle controller.
//!
//! Drives the backend instance through the compute control plane by issuing
//! start/stop/delete commands and polling for the resulting state. Nothing
//! transitions locally; the only local state is the cached address.

use crate::collaborators::{CollaboratorError, ComputeApi, Instance, InstanceStatus};
use crate::config::TimingConfig;
use crate::credentials::{ClientTls, CredentialError, CredentialManager};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Coarse classification of the control plane's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    Running,
    /// STOPPED, TERMINATED or SUSPENDED
    Stopped,
    /// STOPPING, STAGING or SUSPENDING
    Transitional,
    Unknown(String),
}

impl From<&InstanceStatus> for BackendState {
    fn from(status: &InstanceStatus) -> Self {
        match status {
            InstanceStatus::Running => Self::Running,
            InstanceStatus::Stopped | InstanceStatus::Terminated | InstanceStatus::Suspended => {
                Self::Stopped
            }
            InstanceStatus::Stopping | InstanceStatus::Staging | InstanceStatus::Suspending => {
                Self::Transitional
            }
            InstanceStatus::Other(s) => Self::Unknown(s.clone()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("control plane error: {0}")]
    ControlPlane(#[from] CollaboratorError),

    #[error("instance {0} does not exist")]
    NotFound(String),

    #[error("instance {instance} is in unexpected state {state}")]
    UnexpectedState { instance: String, state: String },

    #[error("timed out waiting for instance {instance} to become {awaited}")]
    Timeout {
        instance: String,
        awaited: &'static str,
    },

    #[error("failed to load credentials: {0}")]
    Credentials(#[from] CredentialError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl BackendError {
    /// True when the control plane rejected our cloud credentials, which
    /// needs re-authentication rather than a retry.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::ControlPlane(e) if e.is_unauthorized())
    }
}

/// Readiness check against the backend's inference endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok(true)` once the backend answers, `Ok(false)` while it does not yet.
    /// Errors are fatal to the wait.
    async fn probe(&self, address: IpAddr) -> Result<bool, BackendError>;
}

/// Build an HTTPS client that reaches `service_name` at `address` using the
/// given mTLS configuration.
pub(crate) fn upstream_client(
    tls: &ClientTls,
    service_name: &str,
    address: IpAddr,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .use_preconfigured_tls((*tls.config).clone())
        // The port is taken from the URL
        .resolve(service_name, SocketAddr::new(address, 0))
        .no_proxy()
        .timeout(timeout)
        .build()
}

/// Probes `https://<service_name>:<port><path>` over mTLS. Any HTTP response,
/// whatever its status, counts as ready.
pub struct MtlsProbe {
    credentials: Arc<CredentialManager>,
    service_name: String,
    port: u16,
    path: String,
    timeout: Duration,
}

impl MtlsProbe {
    pub fn new(
        credentials: Arc<CredentialManager>,
        service_name: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            service_name: service_name.into(),
            port,
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for MtlsProbe {
    async fn probe(&self, address: IpAddr) -> Result<bool, BackendError> {
        let tls = self.credentials.client_tls().await?;
        let client = upstream_client(&tls, &self.service_name, address, self.timeout)?;
        let url = format!("https://{}:{}{}", self.service_name, self.port, self.path);

        match client.get(&url).bearer_auth(&tls.token).send().await {
            Ok(response) => {
                debug!(%address, status = %response.status(), "Health probe answered");
                Ok(true)
            }
            Err(e) => {
                debug!(%address, error = %e, "Health probe failed");
                Ok(false)
            }
        }
    }
}

pub struct BackendController {
    compute: Arc<dyn ComputeApi>,
    probe: Arc<dyn HealthProbe>,
    instance: String,
    poll_interval: Duration,
    poll_attempts: u32,
    address: RwLock<Option<IpAddr>>,
}

impl BackendController {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        probe: Arc<dyn HealthProbe>,
        instance: impl Into<String>,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            compute,
            probe,
            instance: instance.into(),
            poll_interval: timing.poll_interval(),
            poll_attempts: timing.poll_attempts,
            address: RwLock::new(None),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Address from the most recent resolution, if any.
    pub fn cached_address(&self) -> Option<IpAddr> {
        *self.address.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, address: IpAddr) {
        *self.address.write().unwrap_or_else(PoisonError::into_inner) = Some(address);
    }

    pub fn clear_cache(&self) {
        *self.address.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn get(&self) -> Result<Instance, BackendError> {
        self.compute
            .get_instance(&self.instance)
            .await?
            .ok_or_else(|| BackendError::NotFound(self.instance.clone()))
    }

    /// Current state as reported by the control plane.
    pub async fn state(&self) -> Result<BackendState, BackendError> {
        Ok(BackendState::from(&self.get().await?.status))
    }

    pub async fn is_stopped(&self) -> Result<bool, BackendError> {
        Ok(self.state().await? == BackendState::Stopped)
    }

    /// State once any in-flight transition has finished. A backend caught
    /// while STOPPING is reported as stopped rather than transitional.
    pub async fn settled_state(&self) -> Result<BackendState, BackendError> {
        loop {
            match self.state().await? {
                BackendState::Transitional => {
                    debug!(instance = %self.instance, "Waiting for transition to settle");
                    tokio::time::sleep(self.poll_interval).await;
                }
                state => return Ok(state),
            }
        }
    }

    /// Bring the backend to RUNNING and serving, starting it if it is
    /// stopped. Returns its address.
    pub async fn ensure_running(&self) -> Result<IpAddr, BackendError> {
        loop {
            let instance = self.get().await?;
            match BackendState::from(&instance.status) {
                BackendState::Transitional => {
                    debug!(instance = %self.instance, status = %instance.status, "Waiting for transition");
                    tokio::time::sleep(self.poll_interval).await;
                }
                BackendState::Running => {
                    let address = match instance.address {
                        Some(address) => address,
                        None => self.poll_until_running().await?,
                    };
                    self.remember(address);
                    self.wait_ready(address).await?;
                    return Ok(address);
                }
                BackendState::Stopped => {
                    info!(instance = %self.instance, status = %instance.status, "Starting backend");
                    self.compute.start(&self.instance).await?;
                    let address = self.poll_until_running().await?;
                    self.remember(address);
                    self.wait_ready(address).await?;
                    return Ok(address);
                }
                BackendState::Unknown(state) => {
                    return Err(BackendError::UnexpectedState {
                        instance: self.instance.clone(),
                        state,
                    });
                }
            }
        }
    }

    async fn poll_until_running(&self) -> Result<IpAddr, BackendError> {
        for attempt in 1..=self.poll_attempts {
            let instance = self.get().await?;
            if instance.status == InstanceStatus::Running
                && let Some(address) = instance.address
            {
                info!(instance = %self.instance, %address, attempt, "Backend is running");
                return Ok(address);
            }
            debug!(instance = %self.instance, status = %instance.status, attempt, "Backend not running yet");
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(BackendError::Timeout {
            instance: self.instance.clone(),
            awaited: "RUNNING",
        })
    }

    /// Stop the backend and wait until the control plane reports it stopped.
    pub async fn stop(&self) -> Result<(), BackendError> {
        info!(instance = %self.instance, "Stopping backend");
        self.compute.stop(&self.instance).await?;

        for _ in 0..self.poll_attempts {
            if self.is_stopped().await? {
                info!(instance = %self.instance, "Backend stopped");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(BackendError::Timeout {
            instance: self.instance.clone(),
            awaited: "STOPPED",
        })
    }

    /// Delete the backend and wait until the control plane no longer knows it.
    pub async fn delete(&self) -> Result<(), BackendError> {
        info!(instance = %self.instance, "Deleting backend");
        match self.compute.delete(&self.instance).await {
            Err(e) if !e.is_not_found() => return Err(e.into()),
            _ => {}
        }

        for _ in 0..self.poll_attempts {
            if self.compute.get_instance(&self.instance).await?.is_none() {
                info!(instance = %self.instance, "Backend deleted");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(BackendError::Timeout {
            instance: self.instance.clone(),
            awaited: "deleted",
        })
    }

    /// Poll the health surface until the backend answers.
    pub async fn wait_ready(&self, address: IpAddr) -> Result<(), BackendError> {
        for attempt in 1..=self.poll_attempts {
            if self.probe.probe(address).await? {
                info!(instance = %self.instance, %address, attempt, "Backend is ready");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(BackendError::Timeout {
            instance: self.instance.clone(),
            awaited: "ready",
        })
    }
}
