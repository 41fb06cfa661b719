//! External collaborators consumed by the gate.
//!
//! Every piece of infrastructure the gate talks to sits behind one of these
//! traits so that a deployment can plug in its own implementation (local
//! scripts and files, or a cloud SDK) and tests can plug in fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Errors returned by collaborator implementations.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    Failed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollaboratorError {
    /// Build a failure, classifying it as an authorization error when the
    /// message looks like an expired or rejected cloud credential.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if looks_unauthorized(&message) {
            Self::Unauthorized(message)
        } else {
            Self::Failed(message)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

const AUTH_PATTERNS: [&str; 8] = [
    "401",
    "403",
    "unauthenticated",
    "unauthorized",
    "permission denied",
    "invalid_grant",
    "token has been expired",
    "reauthenticat",
];

/// True if an error message matches a control-plane authorization failure.
pub fn looks_unauthorized(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    AUTH_PATTERNS.iter().any(|p| lower.contains(p))
}

// ---------------------------------------------------------------------------
// Secret store
// ---------------------------------------------------------------------------

/// Key to append-only versioned blobs.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Latest version of a secret. `NotFound` if it was never written.
    async fn access_latest(&self, key: &str) -> Result<Vec<u8>, CollaboratorError>;

    /// Append a new version.
    async fn add_version(&self, key: &str, data: &[u8]) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Compute control plane
// ---------------------------------------------------------------------------

/// Power state reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Terminated,
    Suspended,
    Stopping,
    Staging,
    Suspending,
    Other(String),
}

impl InstanceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Terminated => "TERMINATED",
            Self::Suspended => "SUSPENDED",
            Self::Stopping => "STOPPING",
            Self::Staging => "STAGING",
            Self::Suspending => "SUSPENDING",
            Self::Other(s) => s,
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Self::Running,
            "STOPPED" => Self::Stopped,
            "TERMINATED" => Self::Terminated,
            "SUSPENDED" => Self::Suspended,
            "STOPPING" => Self::Stopping,
            "STAGING" | "PROVISIONING" => Self::Staging,
            "SUSPENDING" => Self::Suspending,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the backend instance as seen by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub status: InstanceStatus,
    pub address: Option<IpAddr>,
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// `Ok(None)` when the instance does not exist.
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>, CollaboratorError>;
    async fn start(&self, id: &str) -> Result<(), CollaboratorError>;
    async fn stop(&self, id: &str) -> Result<(), CollaboratorError>;
    async fn delete(&self, id: &str) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Network access rules
// ---------------------------------------------------------------------------

/// Source-address predicate of the access rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePredicate {
    Any,
    Address(IpAddr),
}

impl fmt::Display for SourcePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("0.0.0.0/0"),
            Self::Address(IpAddr::V4(ip)) => write!(f, "{}/32", ip),
            Self::Address(IpAddr::V6(ip)) => write!(f, "{}/128", ip),
        }
    }
}

impl FromStr for SourcePredicate {
    type Err = CollaboratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "0.0.0.0/0" || s == "::/0" || s.eq_ignore_ascii_case("any") {
            return Ok(Self::Any);
        }
        let ip = s.split('/').next().unwrap_or(s);
        ip.parse::<IpAddr>()
            .map(Self::Address)
            .map_err(|_| CollaboratorError::Failed(format!("invalid source predicate: {}", s)))
    }
}

/// A single named reachability rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRule {
    pub source: SourcePredicate,
    pub port: u16,
}

#[async_trait]
pub trait RuleApi: Send + Sync {
    /// `Ok(None)` when no rule with this name exists.
    async fn get_rule(&self, name: &str) -> Result<Option<AccessRule>, CollaboratorError>;
    async fn create_rule(&self, name: &str, rule: &AccessRule) -> Result<(), CollaboratorError>;
    async fn patch_rule(&self, name: &str, rule: &AccessRule) -> Result<(), CollaboratorError>;
    async fn delete_rule(&self, name: &str) -> Result<(), CollaboratorError>;
}

/// Echo service returning the caller's public address.
#[async_trait]
pub trait AddressEcho: Send + Sync {
    async fn public_address(&self) -> Result<IpAddr, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Shared state store
// ---------------------------------------------------------------------------

/// Fields of the per-backend state document. `None` fields are left untouched
/// by a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request_unix: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioned: Option<bool>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Merge-style upsert of the document keyed by `name`.
    async fn merge(&self, name: &str, update: &StateUpdate) -> Result<(), CollaboratorError>;
}

/// Declarative infrastructure provisioner, used only when resetting the backend.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn reconcile(&self, instance: &str) -> Result<(), CollaboratorError>;
}
