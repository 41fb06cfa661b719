//! The long-lived application handle.
//!
//! Everything that would otherwise be process-global (credential cache,
//! pinned fingerprint, cached backend address, readiness gate, cumulative
//! token counters) hangs off one [`AppContext`], built once at startup and
//! shared by reference. Tests build as many as they like side by side.

use crate::access::{AccessGate, HttpAddressEcho};
use crate::backend::{BackendController, HealthProbe, MtlsProbe};
use crate::collaborators::{AddressEcho, ComputeApi, Provisioner, RuleApi, SecretStore, StateStore};
use crate::config::Config;
use crate::credentials::CredentialManager;
use crate::events::EventBus;
use crate::heartbeat::{HeartbeatHandle, HeartbeatReporter};
use crate::hooks::ScriptHooks;
use crate::orchestrator::Orchestrator;
use crate::store::{FileSecretStore, FileStateStore};
use crate::tokens::TokenTotals;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// External systems the gate drives.
pub struct Collaborators {
    pub secrets: Arc<dyn SecretStore>,
    pub state: Arc<dyn StateStore>,
    pub compute: Arc<dyn ComputeApi>,
    pub rules: Arc<dyn RuleApi>,
    pub echo: Arc<dyn AddressEcho>,
    pub provisioner: Option<Arc<dyn Provisioner>>,
    /// Overrides the default mTLS health probe
    pub probe: Option<Arc<dyn HealthProbe>>,
}

impl Collaborators {
    /// File-backed stores under `state_dir` and script hooks for everything else.
    pub fn from_config(config: &Config) -> Result<Self> {
        let hooks = Arc::new(ScriptHooks::new(config.hooks.clone()));
        let echo = HttpAddressEcho::new(&config.address_echo_url, config.timing.probe_timeout())
            .context("Failed to build address echo client")?;

        let provisioner: Option<Arc<dyn Provisioner>> = if config.hooks.reconcile.is_empty() {
            None
        } else {
            Some(hooks.clone())
        };

        Ok(Self {
            secrets: Arc::new(FileSecretStore::new(&config.state_dir)),
            state: Arc::new(FileStateStore::new(&config.state_dir)),
            compute: hooks.clone(),
            rules: hooks,
            echo: Arc::new(echo),
            provisioner,
            probe: None,
        })
    }
}

pub struct AppContext {
    pub config: Config,
    pub credentials: Arc<CredentialManager>,
    pub backend: Arc<BackendController>,
    pub access: Arc<AccessGate>,
    pub orchestrator: Orchestrator,
    pub totals: Arc<TokenTotals>,
    pub events: EventBus,
    pub heartbeat: HeartbeatHandle,
    last_activity_unix: AtomicI64,
    cancel: CancellationToken,
}

impl AppContext {
    /// Build every component and spawn the orchestrator and heartbeat tasks.
    /// Both stop when `cancel` fires.
    pub fn start(
        config: Config,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let credentials = Arc::new(
            CredentialManager::new(
                &config.cert_dir,
                collaborators.secrets,
                &config.service_name,
                config.timing.tls_cache_ttl(),
            )
            .context("Failed to open certificate directory")?,
        );

        let probe = collaborators.probe.unwrap_or_else(|| {
            Arc::new(MtlsProbe::new(
                Arc::clone(&credentials),
                &config.service_name,
                config.backend_port,
                &config.health_path,
                config.timing.probe_timeout(),
            ))
        });
        let backend = Arc::new(BackendController::new(
            collaborators.compute,
            probe,
            &config.instance,
            &config.timing,
        ));
        let access = Arc::new(AccessGate::new(
            collaborators.rules,
            collaborators.echo,
            &config.rule_name,
            config.backend_port,
            config.allow_all_sources,
        ));

        let (orchestrator, actor) = Orchestrator::new(
            Arc::clone(&credentials),
            Arc::clone(&backend),
            Arc::clone(&access),
            collaborators.provisioner,
            Arc::clone(&collaborators.state),
        );
        tokio::spawn(actor.run(cancel.clone()));

        let (reporter, heartbeat) = HeartbeatReporter::new(
            collaborators.state,
            &config.instance,
            config.timing.heartbeat_window(),
        );
        tokio::spawn(reporter.run(cancel.clone()));

        info!(
            instance = %config.instance,
            service = %config.service_name,
            backend_port = config.backend_port,
            "Lifecycle components started"
        );

        Ok(Arc::new(Self {
            config,
            credentials,
            backend,
            access,
            orchestrator,
            totals: Arc::new(TokenTotals::default()),
            events: EventBus::default(),
            heartbeat,
            last_activity_unix: AtomicI64::new(0),
            cancel,
        }))
    }

    /// Cumulative `(input, output)` token counts.
    pub fn token_counts(&self) -> (u64, u64) {
        self.totals.counts()
    }

    /// Record that a proxied request just completed.
    pub fn touch(&self) {
        self.last_activity_unix
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Unix time of the last completed request, `None` if there was none.
    pub fn last_activity_unix(&self) -> Option<i64> {
        match self.last_activity_unix.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t),
        }
    }

    /// Stop background tasks and remove the access rule if this process opened it.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if self.access.is_active()
            && let Err(e) = self.access.remove().await
        {
            warn!(error = %e, "Access rule left in place on shutdown");
        }
    }
}
