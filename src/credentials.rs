//! Credential management for the backend link.
//!
//! Owns the long-lived certificate authority, the per-boot server and client
//! leaf certificates, the shared bearer token and the pinned fingerprint of
//! the current server leaf.
//!
//! The client half (client leaf, CA certificate, token) lives in a private
//! local directory. The backend half (server leaf, server key, CA certificate,
//! token) is published to the [`SecretStore`], where the backend fetches it on
//! its own boot.
//!
//! The TLS client configuration handed out by [`CredentialManager::client_tls`]
//! verifies the backend certificate twice: standard chain validation against
//! the CA, then a SHA-256 comparison against the pinned fingerprint. A backend
//! restored from stale material still chains to the CA but fails the second
//! check.

use crate::collaborators::{CollaboratorError, SecretStore};
use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256, RsaKeySize,
};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca-key.pem";
const CLIENT_CERT_FILE: &str = "client.pem";
const CLIENT_KEY_FILE: &str = "client-key.pem";
const TOKEN_FILE: &str = "token";
const STAGING_SUFFIX: &str = ".next";

/// Secret store keys read by the backend on boot.
pub const SECRET_CA_CERT: &str = "llmgate-ca-cert";
pub const SECRET_SERVER_CERT: &str = "llmgate-server-cert";
pub const SECRET_SERVER_KEY: &str = "llmgate-server-key";
pub const SECRET_TOKEN: &str = "llmgate-token";

const CA_VALIDITY_DAYS: i64 = 3650;
const CA_RENEW_BEFORE_DAYS: i64 = 30;
const LEAF_VALIDITY_DAYS: i64 = 7;
const CLIENT_COMMON_NAME: &str = "llmgate-client";

/// Errors from credential operations. All of them are fatal to the calling
/// operation; nothing here is retried.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("secret store failed for {secret}: {source}")]
    Secret {
        secret: &'static str,
        #[source]
        source: CollaboratorError,
    },

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("malformed PEM in {0}")]
    MalformedPem(PathBuf),

    #[error("invalid CA certificate: {0}")]
    InvalidCa(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> CredentialError {
    let path = path.to_path_buf();
    move |source| CredentialError::Io {
        action,
        path,
        source,
    }
}

/// SHA-256 digest of a DER-encoded certificate.
pub fn fingerprint(cert_der: &[u8]) -> [u8; 32] {
    Sha256::digest(cert_der).into()
}

/// Lowercase hex encoding, used for fingerprints and the bearer token.
pub fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// In-memory pin of the current server leaf. Unset until the first rotation,
/// in which case the fingerprint check is skipped.
#[derive(Debug, Default)]
pub struct FingerprintPin {
    digest: std::sync::RwLock<Option<[u8; 32]>>,
}

impl FingerprintPin {
    pub fn get(&self) -> Option<[u8; 32]> {
        *self.digest.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, digest: [u8; 32]) {
        *self.digest.write().unwrap_or_else(PoisonError::into_inner) = Some(digest);
    }

    /// True if no pin is set or the certificate's digest equals the pin.
    pub fn matches(&self, cert_der: &[u8]) -> bool {
        match self.get() {
            None => true,
            Some(expected) => fingerprint(cert_der).ct_eq(&expected).into(),
        }
    }
}

/// Server verifier layering the fingerprint pin on top of WebPKI validation.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pin: Arc<FingerprintPin>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;

        if !self.pin.matches(end_entity.as_ref()) {
            warn!(
                presented = %hex(&fingerprint(end_entity.as_ref())),
                "Backend certificate does not match the pinned fingerprint, refusing connection"
            );
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// CA certificate and key in PEM form.
#[derive(Debug, Clone)]
pub struct CaPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The CA reconstructed for signing.
struct Authority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl Authority {
    fn from_pair(pair: &CaPair) -> Result<Self, CredentialError> {
        let key = KeyPair::from_pem(&pair.key_pem)?;
        let cert = CertificateParams::from_ca_cert_pem(&pair.cert_pem)?.self_signed(&key)?;
        Ok(Self { cert, key })
    }
}

#[derive(Debug, Clone, Copy)]
enum LeafRole {
    Server,
    Client,
}

struct IssuedLeaf {
    cert_pem: String,
    key_pem: String,
    der: Vec<u8>,
}

fn generate_ca() -> Result<CaPair, CredentialError> {
    let key = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, "llmgate CA");
    params
        .distinguished_name
        .push(DnType::OrganizationName, "llmgate");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);

    let cert = params.self_signed(&key)?;
    Ok(CaPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

fn issue_leaf(ca: &Authority, role: LeafRole, name: &str) -> Result<IssuedLeaf, CredentialError> {
    let key = KeyPair::generate()?;

    let (mut params, usage) = match role {
        LeafRole::Server => (
            CertificateParams::new(vec![name.to_string()])?,
            ExtendedKeyUsagePurpose::ServerAuth,
        ),
        LeafRole::Client => (
            CertificateParams::default(),
            ExtendedKeyUsagePurpose::ClientAuth,
        ),
    };
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, name);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![usage];
    params.use_authority_key_identifier_extension = true;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

    let cert = params.signed_by(&key, &ca.cert, &ca.key)?;
    Ok(IssuedLeaf {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        der: cert.der().to_vec(),
    })
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex(&bytes)
}

/// Seconds until the CA in `cert_pem` expires.
fn ca_remaining_secs(cert_pem: &str) -> Result<i64, CredentialError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CredentialError::InvalidCa(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CredentialError::InvalidCa(e.to_string()))?;
    let not_after = cert.validity().not_after.timestamp();
    Ok(not_after - time::OffsetDateTime::now_utc().unix_timestamp())
}

pub(crate) fn parse_certs(
    path: &Path,
    pem: &[u8],
) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| CredentialError::MalformedPem(path.to_path_buf()))?;
    if certs.is_empty() {
        return Err(CredentialError::MalformedPem(path.to_path_buf()));
    }
    Ok(certs)
}

pub(crate) fn parse_key(path: &Path, pem: &[u8]) -> Result<PrivateKeyDer<'static>, CredentialError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .ok()
        .flatten()
        .ok_or_else(|| CredentialError::MalformedPem(path.to_path_buf()))
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<(), CredentialError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(io_error("write", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_error("restrict permissions of", path))?;
    }

    Ok(())
}

async fn read_file(path: &Path) -> Result<Vec<u8>, CredentialError> {
    tokio::fs::read(path).await.map_err(io_error("read", path))
}

/// mTLS client material handed to upstream callers.
#[derive(Clone)]
pub struct ClientTls {
    pub config: Arc<ClientConfig>,
    pub token: String,
    /// Increments on every reload from disk, so callers can tell when a
    /// client built from an older configuration must be rebuilt.
    pub generation: u64,
}

struct CachedTls {
    tls: ClientTls,
    loaded_at: Instant,
}

/// Owns the CA, the boot credentials and the pinned server fingerprint.
pub struct CredentialManager {
    dir: PathBuf,
    secrets: Arc<dyn SecretStore>,
    service_name: String,
    provider: Arc<CryptoProvider>,
    pin: Arc<FingerprintPin>,
    cache: RwLock<Option<CachedTls>>,
    ttl: Duration,
    generation: AtomicU64,
}

impl CredentialManager {
    /// Create the manager, creating the private certificate directory if needed.
    ///
    /// Failing to create the directory is the one unrecoverable startup error.
    pub fn new(
        dir: impl Into<PathBuf>,
        secrets: Arc<dyn SecretStore>,
        service_name: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, CredentialError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(io_error("create", &dir))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
                .map_err(io_error("restrict permissions of", &dir))?;
        }

        Ok(Self {
            dir,
            secrets,
            service_name: service_name.into(),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            pin: Arc::new(FingerprintPin::default()),
            cache: RwLock::new(None),
            ttl,
            generation: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn provider(&self) -> Arc<CryptoProvider> {
        Arc::clone(&self.provider)
    }

    /// Currently pinned server fingerprint, `None` before the first rotation.
    pub fn pinned_fingerprint(&self) -> Option<[u8; 32]> {
        self.pin.get()
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn staging_path(&self, file: &str) -> PathBuf {
        self.dir.join(format!("{file}{STAGING_SUFFIX}"))
    }

    /// Load the CA, generating a fresh one if it is missing or expires within
    /// 30 days. An otherwise valid CA is never replaced.
    pub async fn ensure_ca(&self) -> Result<CaPair, CredentialError> {
        let (pair, fresh) = self.load_or_generate_ca().await?;
        if fresh {
            let files = [
                (CA_KEY_FILE, pair.key_pem.as_bytes()),
                (CA_CERT_FILE, pair.cert_pem.as_bytes()),
            ];
            self.stage(&files).await?;
            self.commit(&files).await?;
        }
        Ok(pair)
    }

    /// The CA on disk, or a replacement that has not been written yet
    /// (flagged `true`).
    async fn load_or_generate_ca(&self) -> Result<(CaPair, bool), CredentialError> {
        let cert_path = self.path(CA_CERT_FILE);
        let key_path = self.path(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = String::from_utf8(read_file(&cert_path).await?)
                .map_err(|_| CredentialError::MalformedPem(cert_path.clone()))?;
            let key_pem = String::from_utf8(read_file(&key_path).await?)
                .map_err(|_| CredentialError::MalformedPem(key_path.clone()))?;

            let remaining = ca_remaining_secs(&cert_pem)?;
            if remaining > CA_RENEW_BEFORE_DAYS * 86_400 {
                return Ok((CaPair { cert_pem, key_pem }, false));
            }
            info!(
                remaining_days = remaining / 86_400,
                "CA is close to expiry, generating a new one"
            );
        } else {
            info!(dir = %self.dir.display(), "No CA found, generating one");
        }

        Ok((generate_ca()?, true))
    }

    /// Generate and distribute a fresh set of boot credentials.
    ///
    /// The pin, the local files (a regenerated CA included) and the TLS cache
    /// only change once every step has succeeded; on error the previous bundle
    /// stays active.
    pub async fn rotate(&self) -> Result<(), CredentialError> {
        let (ca, fresh_ca) = self.load_or_generate_ca().await?;
        let authority = Authority::from_pair(&ca)?;

        let server = issue_leaf(&authority, LeafRole::Server, &self.service_name)?;
        let server_digest = fingerprint(&server.der);
        let client = issue_leaf(&authority, LeafRole::Client, CLIENT_COMMON_NAME)?;
        let token = generate_token();

        let mut files: Vec<(&str, &[u8])> = vec![
            (CLIENT_CERT_FILE, client.cert_pem.as_bytes()),
            (CLIENT_KEY_FILE, client.key_pem.as_bytes()),
            (TOKEN_FILE, token.as_bytes()),
        ];
        if fresh_ca {
            files.push((CA_KEY_FILE, ca.key_pem.as_bytes()));
            files.push((CA_CERT_FILE, ca.cert_pem.as_bytes()));
        }

        if let Err(e) = self.stage(&files).await {
            self.discard_staged().await;
            return Err(e);
        }

        if let Err(e) = self.publish(&server, &ca, &token).await {
            self.discard_staged().await;
            return Err(e);
        }

        self.commit(&files).await?;
        self.pin.set(server_digest);
        self.invalidate().await;

        info!(
            fingerprint = %hex(&server_digest),
            service = %self.service_name,
            new_ca = fresh_ca,
            "Rotated boot credentials"
        );
        Ok(())
    }

    /// Write each file next to its final path with the staging suffix.
    async fn stage(&self, files: &[(&str, &[u8])]) -> Result<(), CredentialError> {
        for (file, data) in files {
            write_private(&self.staging_path(file), data).await?;
        }
        Ok(())
    }

    /// Rename staged files into place.
    async fn commit(&self, files: &[(&str, &[u8])]) -> Result<(), CredentialError> {
        for (file, _) in files {
            let to = self.path(file);
            tokio::fs::rename(self.staging_path(file), &to)
                .await
                .map_err(io_error("commit", &to))?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        server: &IssuedLeaf,
        ca: &CaPair,
        token: &str,
    ) -> Result<(), CredentialError> {
        let versions: [(&'static str, &[u8]); 4] = [
            (SECRET_SERVER_CERT, server.cert_pem.as_bytes()),
            (SECRET_SERVER_KEY, server.key_pem.as_bytes()),
            (SECRET_CA_CERT, ca.cert_pem.as_bytes()),
            (SECRET_TOKEN, token.as_bytes()),
        ];

        for (secret, data) in versions {
            if let Err(source) = self.secrets.add_version(secret, data).await {
                warn!(secret, error = %source, "Failed to publish secret version");
                return Err(CredentialError::Secret { secret, source });
            }
            debug!(secret, "Published secret version");
        }
        Ok(())
    }

    async fn discard_staged(&self) {
        for file in [CLIENT_CERT_FILE, CLIENT_KEY_FILE, TOKEN_FILE, CA_KEY_FILE, CA_CERT_FILE] {
            let _ = tokio::fs::remove_file(self.staging_path(file)).await;
        }
    }

    /// Cached mTLS client configuration plus bearer token, reloaded from disk
    /// once the cache is older than the freshness window.
    pub async fn client_tls(&self) -> Result<ClientTls, CredentialError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.loaded_at.elapsed() < self.ttl
            {
                return Ok(cached.tls.clone());
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref()
            && cached.loaded_at.elapsed() < self.ttl
        {
            return Ok(cached.tls.clone());
        }

        let tls = self.load_client_tls().await?;
        *cache = Some(CachedTls {
            tls: tls.clone(),
            loaded_at: Instant::now(),
        });
        Ok(tls)
    }

    /// Drop the cached configuration so the next caller reloads from disk.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    async fn load_client_tls(&self) -> Result<ClientTls, CredentialError> {
        let ca_path = self.path(CA_CERT_FILE);
        let cert_path = self.path(CLIENT_CERT_FILE);
        let key_path = self.path(CLIENT_KEY_FILE);
        let token_path = self.path(TOKEN_FILE);

        let ca_certs = parse_certs(&ca_path, &read_file(&ca_path).await?)?;
        let chain = parse_certs(&cert_path, &read_file(&cert_path).await?)?;
        let key = parse_key(&key_path, &read_file(&key_path).await?)?;
        let token = String::from_utf8(read_file(&token_path).await?)
            .map_err(|_| CredentialError::MalformedPem(token_path.clone()))?
            .trim()
            .to_string();

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| CredentialError::InvalidCa(e.to_string()))?;
        }

        let config = build_client_config(
            Arc::clone(&self.provider),
            roots,
            Arc::clone(&self.pin),
            chain,
            key,
        )?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "Loaded client TLS configuration");

        Ok(ClientTls {
            config: Arc::new(config),
            token,
            generation,
        })
    }
}

fn build_client_config(
    provider: Arc<CryptoProvider>,
    roots: RootCertStore,
    pin: Arc<FingerprintPin>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig, CredentialError> {
    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| CredentialError::Tls(e.to_string()))?;

    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CredentialError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier { inner, pin }))
        .with_client_auth_cert(chain, key)
        .map_err(|e| CredentialError::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rustls::server::WebPkiClientVerifier;
    use rustls::server::danger::ClientCertVerifier;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySecrets {
        versions: Mutex<HashMap<String, Vec<Vec<u8>>>>,
        fail: bool,
    }

    #[async_trait]
    impl SecretStore for MemorySecrets {
        async fn access_latest(&self, key: &str) -> Result<Vec<u8>, CollaboratorError> {
            self.versions
                .lock()
                .unwrap()
                .get(key)
                .and_then(|v| v.last().cloned())
                .ok_or_else(|| CollaboratorError::NotFound(key.to_string()))
        }

        async fn add_version(&self, key: &str, data: &[u8]) -> Result<(), CollaboratorError> {
            if self.fail {
                return Err(CollaboratorError::Failed("secret store offline".to_string()));
            }
            self.versions
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push(data.to_vec());
            Ok(())
        }
    }

    fn manager(dir: &Path, secrets: Arc<MemorySecrets>) -> CredentialManager {
        CredentialManager::new(dir, secrets, "llm-backend", Duration::from_secs(1800)).unwrap()
    }

    async fn latest_der(secrets: &MemorySecrets, key: &str) -> CertificateDer<'static> {
        let pem = secrets.access_latest(key).await.unwrap();
        parse_certs(Path::new(key), &pem).unwrap().remove(0)
    }

    fn roots_from(ca_pem: &[u8]) -> Arc<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(Path::new("ca"), ca_pem).unwrap() {
            roots.add(cert).unwrap();
        }
        Arc::new(roots)
    }

    fn server_verifier(mgr: &CredentialManager, ca_pem: &[u8]) -> Arc<WebPkiServerVerifier> {
        WebPkiServerVerifier::builder_with_provider(roots_from(ca_pem), mgr.provider())
            .build()
            .unwrap()
    }

    fn client_verifier(mgr: &CredentialManager, ca_pem: &[u8]) -> Arc<dyn ClientCertVerifier> {
        WebPkiClientVerifier::builder_with_provider(roots_from(ca_pem), mgr.provider())
            .build()
            .unwrap()
    }

    fn backend_name() -> ServerName<'static> {
        ServerName::try_from("llm-backend").unwrap()
    }

    #[tokio::test]
    async fn test_rotated_leaves_chain_to_ca_with_correct_usage() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(MemorySecrets::default());
        let mgr = manager(dir.path(), secrets.clone());

        mgr.rotate().await.unwrap();

        let ca_pem = std::fs::read(dir.path().join(CA_CERT_FILE)).unwrap();
        let server = latest_der(&secrets, SECRET_SERVER_CERT).await;
        let client_pem = std::fs::read(dir.path().join(CLIENT_CERT_FILE)).unwrap();
        let client = parse_certs(Path::new("client"), &client_pem).unwrap().remove(0);

        let servers = server_verifier(&mgr, &ca_pem);
        let clients = client_verifier(&mgr, &ca_pem);
        let now = UnixTime::now();

        assert!(servers.verify_server_cert(&server, &[], &backend_name(), &[], now).is_ok());
        assert!(clients.verify_client_cert(&client, &[], now).is_ok());

        // Usages are not interchangeable
        assert!(servers.verify_server_cert(&client, &[], &backend_name(), &[], now).is_err());
        assert!(clients.verify_client_cert(&server, &[], now).is_err());

        // The CA published for the backend is the one on disk
        let published_ca = secrets.access_latest(SECRET_CA_CERT).await.unwrap();
        assert_eq!(published_ca, ca_pem);
    }

    #[tokio::test]
    async fn test_leaf_does_not_verify_against_previous_ca() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(MemorySecrets::default());
        let mgr = manager(dir.path(), secrets.clone());

        mgr.rotate().await.unwrap();
        let old_ca = std::fs::read(dir.path().join(CA_CERT_FILE)).unwrap();

        std::fs::remove_file(dir.path().join(CA_CERT_FILE)).unwrap();
        std::fs::remove_file(dir.path().join(CA_KEY_FILE)).unwrap();
        mgr.rotate().await.unwrap();

        let new_ca = std::fs::read(dir.path().join(CA_CERT_FILE)).unwrap();
        assert_ne!(old_ca, new_ca);

        let server = latest_der(&secrets, SECRET_SERVER_CERT).await;
        let now = UnixTime::now();
        assert!(server_verifier(&mgr, &new_ca)
            .verify_server_cert(&server, &[], &backend_name(), &[], now)
            .is_ok());
        assert!(server_verifier(&mgr, &old_ca)
            .verify_server_cert(&server, &[], &backend_name(), &[], now)
            .is_err());
    }

    #[tokio::test]
    async fn test_valid_ca_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(MemorySecrets::default()));

        let first = mgr.ensure_ca().await.unwrap();
        let second = mgr.ensure_ca().await.unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(first.key_pem, second.key_pem);
    }

    /// Write a CA with ten days left and return its certificate PEM.
    fn write_expiring_ca(dir: &Path) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(10);
        let expiring = params.self_signed(&key).unwrap();
        std::fs::write(dir.join(CA_CERT_FILE), expiring.pem()).unwrap();
        std::fs::write(dir.join(CA_KEY_FILE), key.serialize_pem()).unwrap();
        expiring.pem()
    }

    #[tokio::test]
    async fn test_ca_close_to_expiry_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(MemorySecrets::default()));
        let expiring = write_expiring_ca(dir.path());

        let pair = mgr.ensure_ca().await.unwrap();
        assert_ne!(pair.cert_pem, expiring);
        assert!(ca_remaining_secs(&pair.cert_pem).unwrap() > 3000 * 86_400);
        assert_eq!(std::fs::read_to_string(dir.path().join(CA_CERT_FILE)).unwrap(), pair.cert_pem);
    }

    #[tokio::test]
    async fn test_ca_key_is_rsa_4096() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(MemorySecrets::default()));
        let pair = mgr.ensure_ca().await.unwrap();

        let (_, pem) = x509_parser::pem::parse_x509_pem(pair.cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        match cert.public_key().parsed().unwrap() {
            x509_parser::public_key::PublicKey::RSA(rsa) => assert_eq!(rsa.key_size(), 4096),
            _ => panic!("CA key is not RSA"),
        }
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_expiring_ca_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let expiring = write_expiring_ca(dir.path());
        let key = std::fs::read(dir.path().join(CA_KEY_FILE)).unwrap();

        let failing = manager(
            dir.path(),
            Arc::new(MemorySecrets {
                fail: true,
                ..Default::default()
            }),
        );
        assert!(failing.rotate().await.is_err());

        assert_eq!(std::fs::read_to_string(dir.path().join(CA_CERT_FILE)).unwrap(), expiring);
        assert_eq!(std::fs::read(dir.path().join(CA_KEY_FILE)).unwrap(), key);
        for file in [CA_CERT_FILE, CA_KEY_FILE, CLIENT_KEY_FILE] {
            assert!(!dir.path().join(format!("{file}{STAGING_SUFFIX}")).exists(), "{file}");
        }
        assert!(failing.pinned_fingerprint().is_none());

        // Once publishing works, the new CA lands together with the bundle
        let secrets = Arc::new(MemorySecrets::default());
        let mgr = manager(dir.path(), secrets.clone());
        mgr.rotate().await.unwrap();
        let on_disk = std::fs::read(dir.path().join(CA_CERT_FILE)).unwrap();
        assert_ne!(on_disk, expiring.as_bytes());
        assert_eq!(secrets.access_latest(SECRET_CA_CERT).await.unwrap(), on_disk);
    }

    #[tokio::test]
    async fn test_pin_tracks_latest_server_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(MemorySecrets::default());
        let mgr = manager(dir.path(), secrets.clone());
        assert!(mgr.pinned_fingerprint().is_none());

        for _ in 0..2 {
            mgr.rotate().await.unwrap();
            let server = latest_der(&secrets, SECRET_SERVER_CERT).await;
            assert_eq!(mgr.pinned_fingerprint(), Some(fingerprint(server.as_ref())));
        }
    }

    #[tokio::test]
    async fn test_pinned_verifier_rejects_chain_valid_impostor() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(MemorySecrets::default());
        let mgr = manager(dir.path(), secrets.clone());
        mgr.rotate().await.unwrap();

        let ca = mgr.ensure_ca().await.unwrap();
        let impostor = issue_leaf(&Authority::from_pair(&ca).unwrap(), LeafRole::Server, "llm-backend")
            .unwrap();
        let impostor = CertificateDer::from(impostor.der);
        let genuine = latest_der(&secrets, SECRET_SERVER_CERT).await;

        let verifier = PinnedServerVerifier {
            inner: server_verifier(&mgr, ca.cert_pem.as_bytes()),
            pin: Arc::clone(&mgr.pin),
        };
        let now = UnixTime::now();
        assert!(verifier.verify_server_cert(&genuine, &[], &backend_name(), &[], now).is_ok());
        assert!(verifier.verify_server_cert(&impostor, &[], &backend_name(), &[], now).is_err());

        // Without a pin, any chain-valid leaf is accepted
        let unpinned = PinnedServerVerifier {
            inner: server_verifier(&mgr, ca.cert_pem.as_bytes()),
            pin: Arc::new(FingerprintPin::default()),
        };
        assert!(unpinned.verify_server_cert(&impostor, &[], &backend_name(), &[], now).is_ok());
    }

    #[tokio::test]
    async fn test_client_tls_cached_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(MemorySecrets::default()));
        mgr.rotate().await.unwrap();

        let first = mgr.client_tls().await.unwrap();
        let second = mgr.client_tls().await.unwrap();
        assert!(Arc::ptr_eq(&first.config, &second.config));
        assert_eq!(first.generation, second.generation);
        assert_eq!(first.token.len(), 64);

        mgr.invalidate().await;
        let third = mgr.client_tls().await.unwrap();
        assert!(!Arc::ptr_eq(&first.config, &third.config));
        assert!(third.generation > first.generation);
    }

    #[tokio::test]
    async fn test_client_tls_without_credentials_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(MemorySecrets::default()));
        assert!(matches!(
            mgr.client_tls().await,
            Err(CredentialError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_previous_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(MemorySecrets::default()));
        mgr.rotate().await.unwrap();
        let pin = mgr.pinned_fingerprint();
        let token = std::fs::read(dir.path().join(TOKEN_FILE)).unwrap();

        let failing = CredentialManager {
            secrets: Arc::new(MemorySecrets {
                fail: true,
                ..Default::default()
            }),
            ..manager(dir.path(), Arc::new(MemorySecrets::default()))
        };
        failing.pin.set(pin.unwrap());

        let err = failing.rotate().await.unwrap_err();
        assert!(matches!(err, CredentialError::Secret { secret: SECRET_SERVER_CERT, .. }));
        assert_eq!(failing.pinned_fingerprint(), pin);
        assert_eq!(std::fs::read(dir.path().join(TOKEN_FILE)).unwrap(), token);
        assert!(!dir.path().join(format!("{TOKEN_FILE}{STAGING_SUFFIX}")).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(MemorySecrets::default()));
        mgr.rotate().await.unwrap();

        for file in [CA_CERT_FILE, CA_KEY_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE, TOKEN_FILE] {
            let mode = std::fs::metadata(dir.path().join(file))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{file}");
        }
    }
}
