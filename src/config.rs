//! Configuration for llmgate

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend instance name, as known to the compute control plane
    pub instance: String,

    /// Proxy port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics port (0 to disable)
    #[serde(default)]
    pub metrics_port: u16,

    /// Admin/control API port (None to disable)
    #[serde(default)]
    pub admin_port: Option<u16>,

    /// Name the backend's server certificate is issued for. Also sent as the
    /// Host header of every upstream request.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Port the backend serves mTLS on
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,

    /// Path probed while waiting for the backend to accept requests
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Upstream status meaning "reachable but the inference service is not up yet"
    #[serde(default = "default_not_ready_status")]
    pub not_ready_status: u16,

    /// Private directory holding the client half of the credentials
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Directory backing the file-based secret and state stores
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Name of the network access rule guarding the backend
    #[serde(default = "default_rule_name")]
    pub rule_name: String,

    /// Open the access rule to any source instead of the caller's address
    #[serde(default)]
    pub allow_all_sources: bool,

    /// Service echoing the caller's public address
    #[serde(default = "default_address_echo_url")]
    pub address_echo_url: String,

    /// Scripts driving the control plane, access rules and provisioner
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Polling, retry and cache intervals
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Shell commands run through `sh -c`. Each receives `LLMGATE_*` environment
/// variables describing the operation. Empty commands are "not configured".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Prints `<STATUS> [<address>]`; exit code 3 means "no such instance"
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub stop: String,
    #[serde(default)]
    pub delete: String,
    /// Prints the rule's source predicate; exit code 3 means "no such rule"
    #[serde(default)]
    pub rule_get: String,
    #[serde(default)]
    pub rule_create: String,
    #[serde(default)]
    pub rule_patch: String,
    #[serde(default)]
    pub rule_delete: String,
    /// Re-provisions the backend from its infrastructure description
    #[serde(default)]
    pub reconcile: String,
}

/// Timing knobs. Defaults match production; tests shrink them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Interval between control-plane and health polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bounded number of polls for start/stop/delete/health
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    /// Timeout of a single health probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Spacing of upstream request retries
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Upstream attempts per request
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// How long a request waits for the readiness gate
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,

    /// Timeout of one upstream request, including the streamed body
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,

    /// Freshness window of the cached client TLS configuration
    #[serde(default = "default_tls_cache_ttl_secs")]
    pub tls_cache_ttl_secs: u64,

    /// Minimum spacing of heartbeat writes
    #[serde(default = "default_heartbeat_window_secs")]
    pub heartbeat_window_secs: u64,

    /// Interval of live output-rate samples while streaming
    #[serde(default = "default_rate_sample_ms")]
    pub rate_sample_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_attempts: default_poll_attempts(),
            probe_timeout_ms: default_probe_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_attempts: default_retry_attempts(),
            setup_timeout_secs: default_setup_timeout_secs(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            tls_cache_ttl_secs: default_tls_cache_ttl_secs(),
            heartbeat_window_secs: default_heartbeat_window_secs(),
            rate_sample_ms: default_rate_sample_ms(),
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn tls_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.tls_cache_ttl_secs)
    }

    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_secs(self.heartbeat_window_secs)
    }

    /// Never zero; a zero period cannot drive an interval timer.
    pub fn rate_sample(&self) -> Duration {
        Duration::from_millis(self.rate_sample_ms.max(1))
    }
}

fn default_port() -> u16 {
    11434
}

fn default_service_name() -> String {
    "llm-backend".to_string()
}

fn default_backend_port() -> u16 {
    443
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_not_ready_status() -> u16 {
    502
}

fn default_cert_dir() -> PathBuf {
    default_state_dir().join("certs")
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llmgate")
}

fn default_rule_name() -> String {
    "llmgate-allow-client".to_string()
}

fn default_address_echo_url() -> String {
    "https://api.ipify.org".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_poll_attempts() -> u32 {
    60
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_retry_interval_ms() -> u64 {
    5_000
}

fn default_retry_attempts() -> u32 {
    12
}

fn default_setup_timeout_secs() -> u64 {
    // Transitional states are polled without bound, so this is the only
    // limit a caller sees on a cold boot.
    900
}

fn default_upstream_timeout_secs() -> u64 {
    600
}

fn default_tls_cache_ttl_secs() -> u64 {
    30 * 60
}

fn default_heartbeat_window_secs() -> u64 {
    60
}

fn default_rate_sample_ms() -> u64 {
    1_000
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Minimal config for a backend instance, all other fields defaulted.
    pub fn for_instance(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            port: default_port(),
            metrics_port: 0,
            admin_port: None,
            service_name: default_service_name(),
            backend_port: default_backend_port(),
            health_path: default_health_path(),
            not_ready_status: default_not_ready_status(),
            cert_dir: default_cert_dir(),
            state_dir: default_state_dir(),
            rule_name: default_rule_name(),
            allow_all_sources: false,
            address_echo_url: default_address_echo_url(),
            hooks: HooksConfig::default(),
            timing: TimingConfig::default(),
        }
    }

    /// Validate configuration, warning about common misconfigurations.
    pub fn validate(&self) {
        use tracing::warn;

        if self.allow_all_sources {
            warn!(
                rule = %self.rule_name,
                "allow_all_sources is set: the backend will be reachable from any address"
            );
        }

        if self.service_name.parse::<std::net::IpAddr>().is_ok() {
            warn!(
                service_name = %self.service_name,
                "service_name is an IP address; the server certificate is issued for a DNS name"
            );
        }

        if self.timing.retry_attempts == 0 || self.timing.poll_attempts == 0 {
            warn!("retry_attempts/poll_attempts of 0 will fail every request");
        }

        if self.timing.rate_sample_ms == 0 {
            warn!("rate_sample_ms of 0 is raised to 1ms");
        }

        for (name, command) in [
            ("status", &self.hooks.status),
            ("start", &self.hooks.start),
            ("stop", &self.hooks.stop),
            ("rule_get", &self.hooks.rule_get),
        ] {
            if command.is_empty() {
                warn!(hook = name, "Hook is not configured");
            }
        }
    }
}
