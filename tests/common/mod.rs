//! Shared fakes for the integration tests.
//!
//! Every collaborator is in-memory. The fake control plane can host a real
//! mTLS backend that serves with whatever credentials were last published
//! to the secret store, so the proxy path is exercised end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use llmgate::collaborators::{
    AccessRule, AddressEcho, CollaboratorError, ComputeApi, Instance, InstanceStatus, RuleApi,
    SecretStore, StateStore, StateUpdate,
};
use llmgate::credentials::{SECRET_CA_CERT, SECRET_SERVER_CERT, SECRET_SERVER_KEY, SECRET_TOKEN};
use llmgate::{Collaborators, Config, Orchestrator};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

pub const CALLER_ADDRESS: &str = "203.0.113.7";

// ── Journal ─────────────────────────────────────────────────────────────────

/// Ordered record of every mutating call made against the fakes.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Position of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }
}

// ── Secret and state stores ─────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySecrets {
    versions: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl MemorySecrets {
    pub fn version_count(&self, key: &str) -> usize {
        self.versions.lock().unwrap().get(key).map_or(0, Vec::len)
    }

    pub fn latest(&self, key: &str) -> Option<Vec<u8>> {
        self.versions
            .lock()
            .unwrap()
            .get(key)
            .and_then(|v| v.last().cloned())
    }
}

#[async_trait]
impl SecretStore for MemorySecrets {
    async fn access_latest(&self, key: &str) -> Result<Vec<u8>, CollaboratorError> {
        self.latest(key)
            .ok_or_else(|| CollaboratorError::NotFound(key.to_string()))
    }

    async fn add_version(&self, key: &str, data: &[u8]) -> Result<(), CollaboratorError> {
        self.versions
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(data.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryState {
    pub updates: Mutex<Vec<(String, StateUpdate)>>,
}

#[async_trait]
impl StateStore for MemoryState {
    async fn merge(&self, name: &str, update: &StateUpdate) -> Result<(), CollaboratorError> {
        self.updates
            .lock()
            .unwrap()
            .push((name.to_string(), update.clone()));
        Ok(())
    }
}

// ── Control plane ───────────────────────────────────────────────────────────

/// Control plane for a single instance. `start` passes through STAGING and
/// `stop` through STOPPING before settling.
pub struct FakeCompute {
    status: Mutex<InstanceStatus>,
    address: IpAddr,
    journal: Journal,
    backend: Option<Arc<MockBackend>>,
    pub gets: AtomicUsize,
    /// Lets the journal record whether the gate was open when a command ran
    gate: OnceLock<Orchestrator>,
}

impl FakeCompute {
    pub fn new(status: InstanceStatus, address: &str, journal: Journal) -> Self {
        Self {
            status: Mutex::new(status),
            address: address.parse().unwrap(),
            journal,
            backend: None,
            gets: AtomicUsize::new(0),
            gate: OnceLock::new(),
        }
    }

    pub fn with_backend(mut self, backend: Arc<MockBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn observe_gate(&self, orchestrator: Orchestrator) {
        let _ = self.gate.set(orchestrator);
    }

    pub fn status(&self) -> InstanceStatus {
        self.status.lock().unwrap().clone()
    }

    fn gate_label(&self) -> &'static str {
        match self.gate.get() {
            Some(o) if o.is_open() => "open",
            Some(_) => "closed",
            None => "unobserved",
        }
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn get_instance(&self, _id: &str) -> Result<Option<Instance>, CollaboratorError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let mut status = self.status.lock().unwrap();
        let current = status.clone();
        match current {
            InstanceStatus::Staging => *status = InstanceStatus::Running,
            InstanceStatus::Stopping => *status = InstanceStatus::Stopped,
            InstanceStatus::Stopped => {
                if self.journal.entries().last().is_some_and(|e| e.starts_with("stop")) {
                    self.journal.push("observed STOPPED");
                }
            }
            _ => {}
        }
        if current == InstanceStatus::Terminated && self.journal.count("delete") > 0 {
            return Ok(None);
        }

        let address = (current == InstanceStatus::Running).then_some(self.address);
        Ok(Some(Instance {
            status: current,
            address,
        }))
    }

    async fn start(&self, _id: &str) -> Result<(), CollaboratorError> {
        self.journal.push(format!("start gate={}", self.gate_label()));
        if let Some(backend) = &self.backend {
            backend.start().await;
        }
        *self.status.lock().unwrap() = InstanceStatus::Staging;
        Ok(())
    }

    async fn stop(&self, _id: &str) -> Result<(), CollaboratorError> {
        self.journal.push(format!("stop gate={}", self.gate_label()));
        if let Some(backend) = &self.backend {
            backend.stop().await;
        }
        *self.status.lock().unwrap() = InstanceStatus::Stopping;
        Ok(())
    }

    async fn delete(&self, _id: &str) -> Result<(), CollaboratorError> {
        self.journal.push("delete");
        if let Some(backend) = &self.backend {
            backend.stop().await;
        }
        *self.status.lock().unwrap() = InstanceStatus::Terminated;
        Ok(())
    }
}

// ── Access rules ────────────────────────────────────────────────────────────

pub struct FakeRules {
    rules: Mutex<HashMap<String, AccessRule>>,
    journal: Journal,
    pub calls: AtomicUsize,
}

impl FakeRules {
    pub fn new(journal: Journal) -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
            journal,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, name: &str) -> Option<AccessRule> {
        self.rules.lock().unwrap().get(name).copied()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleApi for FakeRules {
    async fn get_rule(&self, name: &str) -> Result<Option<AccessRule>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(name))
    }

    async fn create_rule(&self, name: &str, rule: &AccessRule) -> Result<(), CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.journal.push(format!("rule_create {}", rule.source));
        self.rules.lock().unwrap().insert(name.to_string(), *rule);
        Ok(())
    }

    async fn patch_rule(&self, name: &str, rule: &AccessRule) -> Result<(), CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.journal.push(format!("rule_patch {}", rule.source));
        self.rules.lock().unwrap().insert(name.to_string(), *rule);
        Ok(())
    }

    async fn delete_rule(&self, name: &str) -> Result<(), CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.journal.push("rule_delete");
        match self.rules.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(CollaboratorError::NotFound(name.to_string())),
        }
    }
}

pub struct FixedEcho;

#[async_trait]
impl AddressEcho for FixedEcho {
    async fn public_address(&self) -> Result<IpAddr, CollaboratorError> {
        Ok(CALLER_ADDRESS.parse().unwrap())
    }
}

// ── Health probe ────────────────────────────────────────────────────────────

/// Probe that answers ready on the `ready_after`-th attempt.
pub struct CountingProbe {
    pub attempts: AtomicUsize,
    ready_after: usize,
}

impl CountingProbe {
    pub fn new(ready_after: usize) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            ready_after,
        }
    }
}

#[async_trait]
impl llmgate::backend::HealthProbe for CountingProbe {
    async fn probe(&self, _address: IpAddr) -> Result<bool, llmgate::backend::BackendError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(n >= self.ready_after)
    }
}

// ── Mock backend ────────────────────────────────────────────────────────────

/// mTLS inference server that boots with the most recently published
/// server certificate, key, CA and bearer token.
pub struct MockBackend {
    port: u16,
    secrets: Arc<MemorySecrets>,
    running: Mutex<Option<(axum_server::Handle, tokio::task::JoinHandle<()>)>>,
    /// Number of leading `/flaky` requests answered with 502
    pub not_ready: Arc<AtomicUsize>,
    pub flaky_hits: Arc<AtomicUsize>,
    pub boots: AtomicUsize,
}

impl MockBackend {
    pub fn new(secrets: Arc<MemorySecrets>) -> Arc<Self> {
        Arc::new(Self {
            port: free_port(),
            secrets,
            running: Mutex::new(None),
            not_ready: Arc::new(AtomicUsize::new(0)),
            flaky_hits: Arc::new(AtomicUsize::new(0)),
            boots: AtomicUsize::new(0),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn start(&self) {
        let secret = |key: &str| {
            self.secrets
                .latest(key)
                .unwrap_or_else(|| panic!("backend booted before {key} was published"))
        };
        let tls = server_config(
            &secret(SECRET_CA_CERT),
            &secret(SECRET_SERVER_CERT),
            &secret(SECRET_SERVER_KEY),
        );
        let token = String::from_utf8(secret(SECRET_TOKEN)).unwrap();

        let app = backend_router(token, self.not_ready.clone(), self.flaky_hits.clone());
        let handle = axum_server::Handle::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let server = axum_server::bind_rustls(addr, tls).handle(handle.clone());
        let task = tokio::spawn(async move {
            let _ = server.serve(app.into_make_service()).await;
        });
        handle.listening().await.expect("mock backend failed to bind");

        self.boots.fetch_add(1, Ordering::SeqCst);
        *self.running.lock().unwrap() = Some((handle, task));
    }

    /// Shut down and wait until the port is released.
    async fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        if let Some((handle, task)) = running {
            handle.shutdown();
            let _ = task.await;
        }
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn server_config(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
) -> axum_server::tls_rustls::RustlsConfig {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        roots.add(cert.unwrap()).unwrap();
    }
    let verifier =
        rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .unwrap();

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .unwrap()
        .unwrap();

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(config))
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {token}"))
}

fn chunked(content_type: &'static str, chunks: Vec<&'static str>) -> Response {
    let stream = futures_util::stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c.as_bytes()))),
    );
    ([("content-type", content_type)], Body::from_stream(stream)).into_response()
}

fn backend_router(token: String, not_ready: Arc<AtomicUsize>, flaky_hits: Arc<AtomicUsize>) -> Router {
    let generate_token = token.clone();
    let chat_token = token.clone();
    let flaky_token = token;

    Router::new()
        .route("/", get(|| async { "ok" }))
        .route(
            "/api/generate",
            post(move |headers: HeaderMap| async move {
                if !authorized(&headers, &generate_token) {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                // Line boundaries deliberately fall inside chunks
                chunked(
                    "application/x-ndjson",
                    vec![
                        "{\"model\":\"m\",\"response\":\"Hel\",\"done\":false}\n{\"model\":\"m\",\"resp",
                        "onse\":\"lo\",\"done\":false}\n",
                        "{\"model\":\"m\",\"response\":\"\",\"done\":true,\"prompt_eval_count\":12,\"eval_count\":2}\n",
                    ],
                )
            }),
        )
        .route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap| async move {
                if !authorized(&headers, &chat_token) {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                chunked(
                    "text/event-stream",
                    vec![
                        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
                        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":2}}\n\n",
                        "data: [DONE]\n\n",
                    ],
                )
            }),
        )
        .route(
            "/flaky",
            post(move |headers: HeaderMap| async move {
                flaky_hits.fetch_add(1, Ordering::SeqCst);
                if !authorized(&headers, &flaky_token) {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                let remaining = not_ready.load(Ordering::SeqCst);
                if remaining > 0 {
                    not_ready.store(remaining - 1, Ordering::SeqCst);
                    return (StatusCode::BAD_GATEWAY, "model loading").into_response();
                }
                (StatusCode::OK, "ready").into_response()
            }),
        )
}

// ── Assembly ────────────────────────────────────────────────────────────────

/// Config with test-sized timings and directories under `dir`.
pub fn test_config(dir: &std::path::Path, backend_port: u16) -> Config {
    let mut config = Config::for_instance("gpu-box");
    config.backend_port = backend_port;
    config.cert_dir = dir.join("certs");
    config.state_dir = dir.to_path_buf();
    config.timing.poll_interval_ms = 10;
    config.timing.poll_attempts = 300;
    config.timing.probe_timeout_ms = 2_000;
    config.timing.retry_interval_ms = 10;
    config.timing.setup_timeout_secs = 30;
    config.timing.upstream_timeout_secs = 10;
    config.timing.rate_sample_ms = 10;
    config
}

pub struct Fakes {
    pub journal: Journal,
    pub secrets: Arc<MemorySecrets>,
    pub state: Arc<MemoryState>,
    pub compute: Arc<FakeCompute>,
    pub rules: Arc<FakeRules>,
}

impl Fakes {
    /// Collaborators backed by these fakes. `probe` replaces the mTLS health
    /// check when the backend address is not reachable from the test.
    pub fn collaborators(&self, probe: Option<Arc<dyn llmgate::backend::HealthProbe>>) -> Collaborators {
        Collaborators {
            secrets: self.secrets.clone(),
            state: self.state.clone(),
            compute: self.compute.clone(),
            rules: self.rules.clone(),
            echo: Arc::new(FixedEcho),
            provisioner: None,
            probe,
        }
    }
}

pub fn fakes(compute: impl FnOnce(Journal) -> FakeCompute, secrets: Arc<MemorySecrets>) -> Fakes {
    let journal = Journal::default();
    Fakes {
        compute: Arc::new(compute(journal.clone())),
        rules: Arc::new(FakeRules::new(journal.clone())),
        state: Arc::new(MemoryState::default()),
        secrets,
        journal,
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
