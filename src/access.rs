//! Network access rule guarding the backend.
//!
//! The backend is reachable only through a single named rule whose source
//! predicate is either this host's current public address or, under the
//! explicit override, any address.

use crate::collaborators::{AccessRule, AddressEcho, CollaboratorError, RuleApi, SourcePredicate};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("failed to resolve public address: {0}")]
    Echo(#[source] CollaboratorError),

    #[error("access rule {rule}: {source}")]
    Rule {
        rule: String,
        #[source]
        source: CollaboratorError,
    },
}

impl AccessError {
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Echo(e) => e.is_unauthorized(),
            Self::Rule { source, .. } => source.is_unauthorized(),
        }
    }
}

/// What [`AccessGate::ensure_open`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleChange {
    Created,
    Updated,
    Unchanged,
}

pub struct AccessGate {
    rules: Arc<dyn RuleApi>,
    echo: Arc<dyn AddressEcho>,
    rule_name: String,
    port: u16,
    allow_all: bool,
    active: AtomicBool,
}

impl AccessGate {
    pub fn new(
        rules: Arc<dyn RuleApi>,
        echo: Arc<dyn AddressEcho>,
        rule_name: impl Into<String>,
        port: u16,
        allow_all: bool,
    ) -> Self {
        Self {
            rules,
            echo,
            rule_name: rule_name.into(),
            port,
            allow_all,
            active: AtomicBool::new(false),
        }
    }

    /// Whether this process has opened the rule and not removed it since.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn rule_error(&self) -> impl FnOnce(CollaboratorError) -> AccessError + '_ {
        move |source| AccessError::Rule {
            rule: self.rule_name.clone(),
            source,
        }
    }

    /// Make sure the rule exists and admits this host. Idempotent; only the
    /// source predicate is compared against an existing rule.
    pub async fn ensure_open(&self) -> Result<RuleChange, AccessError> {
        let source = if self.allow_all {
            SourcePredicate::Any
        } else {
            SourcePredicate::Address(self.echo.public_address().await.map_err(AccessError::Echo)?)
        };
        let desired = AccessRule {
            source,
            port: self.port,
        };

        let change = match self
            .rules
            .get_rule(&self.rule_name)
            .await
            .map_err(self.rule_error())?
        {
            None => {
                self.rules
                    .create_rule(&self.rule_name, &desired)
                    .await
                    .map_err(self.rule_error())?;
                info!(rule = %self.rule_name, source = %desired.source, port = desired.port, "Created access rule");
                RuleChange::Created
            }
            Some(existing) if existing.source == desired.source => RuleChange::Unchanged,
            Some(existing) => {
                self.rules
                    .patch_rule(&self.rule_name, &desired)
                    .await
                    .map_err(self.rule_error())?;
                info!(
                    rule = %self.rule_name,
                    from = %existing.source,
                    to = %desired.source,
                    "Updated access rule"
                );
                RuleChange::Updated
            }
        };

        self.active.store(true, Ordering::Release);
        Ok(change)
    }

    /// Delete the rule. Best-effort: an absent rule is success and other
    /// failures are logged and returned, never retried.
    pub async fn remove(&self) -> Result<(), AccessError> {
        self.active.store(false, Ordering::Release);
        match self.rules.delete_rule(&self.rule_name).await {
            Ok(()) => {
                info!(rule = %self.rule_name, "Removed access rule");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(rule = %self.rule_name, error = %e, "Failed to remove access rule");
                Err(self.rule_error()(e))
            }
        }
    }
}

/// Address echo backed by a plain-text HTTP endpoint (e.g. api.ipify.org).
pub struct HttpAddressEcho {
    client: reqwest::Client,
    url: String,
}

impl HttpAddressEcho {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Failed(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AddressEcho for HttpAddressEcho {
    async fn public_address(&self) -> Result<IpAddr, CollaboratorError> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CollaboratorError::Failed(e.to_string()))?
            .text()
            .await
            .map_err(|e| CollaboratorError::Failed(e.to_string()))?;

        body.trim().parse().map_err(|_| {
            CollaboratorError::Failed(format!("address echo returned {:?}", body.trim()))
        })
    }
}
