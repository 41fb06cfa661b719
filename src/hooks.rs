//! Script-based collaborators for the compute control plane, access rules and
//! provisioner.
//!
//! llmgate does not link any cloud SDK. Each control-plane operation is a
//! user-provided script (typically a one-line `gcloud`/`aws`/`az` call), run
//! via `sh -c` so it can be either a path to an executable or an inline shell
//! script.
//!
//! Scripts receive their arguments as environment variables:
//!
//! | Variable               | Set for                          |
//! |------------------------|----------------------------------|
//! | `LLMGATE_INSTANCE`     | every compute hook, `reconcile`  |
//! | `LLMGATE_RULE`         | every rule hook                  |
//! | `LLMGATE_RULE_SOURCE`  | `rule_create`, `rule_patch`      |
//! | `LLMGATE_RULE_PORT`    | `rule_create`, `rule_patch`      |
//!
//! Output conventions: `status` prints `<STATUS> [<address>]`, `rule_get`
//! prints `<source> [<port>]`. Exit code 3 from `status`, `rule_get`,
//! `delete` or `rule_delete` means "does not exist".

use crate::collaborators::{
    AccessRule, CollaboratorError, ComputeApi, Instance, InstanceStatus, Provisioner, RuleApi,
};
use crate::config::HooksConfig;
use async_trait::async_trait;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code meaning "the resource does not exist".
pub const EXIT_NOT_FOUND: i32 = 3;

/// Errors from hook script execution
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook {hook} failed (exit code {code}): {stderr}")]
    Failed {
        hook: &'static str,
        code: i32,
        stderr: String,
    },

    #[error("hook {0} is not configured")]
    NotConfigured(&'static str),

    #[error("hook execution error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HookError> for CollaboratorError {
    fn from(e: HookError) -> Self {
        match e {
            HookError::Failed {
                code: EXIT_NOT_FOUND,
                hook,
                ..
            } => CollaboratorError::NotFound(hook.to_string()),
            HookError::Io(e) => CollaboratorError::Io(e),
            other => CollaboratorError::from_message(other.to_string()),
        }
    }
}

/// Runs the configured scripts on behalf of the collaborator traits.
pub struct ScriptHooks {
    hooks: HooksConfig,
}

impl ScriptHooks {
    pub fn new(hooks: HooksConfig) -> Self {
        Self { hooks }
    }
}

async fn run_hook(
    hook: &'static str,
    script: &str,
    env: &[(&str, String)],
) -> Result<String, HookError> {
    if script.trim().is_empty() {
        return Err(HookError::NotConfigured(hook));
    }
    debug!(hook, "Running hook");
    let started = Instant::now();

    let mut command = Command::new("sh");
    command.arg("-c").arg(script).kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }
    let output = command.output().await.map_err(HookError::Io)?;

    metrics::histogram!("llmgate_hook_duration_seconds", "hook" => hook)
        .record(started.elapsed().as_secs_f64());

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
        debug!(hook, stdout = %stdout, "Hook stdout");
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
    let code = output.status.code().unwrap_or(-1);
    if !stderr.is_empty() {
        if output.status.success() || code == EXIT_NOT_FOUND {
            debug!(hook, stderr = %stderr, "Hook stderr");
        } else {
            warn!(hook, stderr = %stderr, "Hook failed");
        }
    }

    if !output.status.success() {
        if code != EXIT_NOT_FOUND {
            metrics::counter!("llmgate_hook_failures_total", "hook" => hook).increment(1);
        }
        return Err(HookError::Failed { hook, code, stderr });
    }

    Ok(stdout)
}

fn not_found_as_none<T>(result: Result<T, HookError>) -> Result<Option<T>, CollaboratorError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(HookError::Failed {
            code: EXIT_NOT_FOUND,
            ..
        }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parse `<STATUS> [<address>]`.
fn parse_instance(stdout: &str) -> Result<Instance, CollaboratorError> {
    let mut fields = stdout.split_whitespace();
    let status: InstanceStatus = fields
        .next()
        .ok_or_else(|| CollaboratorError::Failed("status hook printed nothing".to_string()))?
        .parse()
        .unwrap_or_else(|never| match never {});
    let address = match fields.next() {
        Some(a) => Some(a.parse().map_err(|_| {
            CollaboratorError::Failed(format!("status hook printed invalid address: {}", a))
        })?),
        None => None,
    };
    Ok(Instance { status, address })
}

/// Parse `<source> [<port>]`, defaulting the port to `default_port`.
fn parse_rule(stdout: &str, default_port: u16) -> Result<AccessRule, CollaboratorError> {
    let mut fields = stdout.split_whitespace();
    let source = fields
        .next()
        .ok_or_else(|| CollaboratorError::Failed("rule_get hook printed nothing".to_string()))?
        .parse()?;
    let port = match fields.next() {
        Some(p) => p.parse().map_err(|_| {
            CollaboratorError::Failed(format!("rule_get hook printed invalid port: {}", p))
        })?,
        None => default_port,
    };
    Ok(AccessRule { source, port })
}

fn instance_env(id: &str) -> [(&'static str, String); 1] {
    [("LLMGATE_INSTANCE", id.to_string())]
}

fn rule_env(name: &str, rule: &AccessRule) -> [(&'static str, String); 3] {
    [
        ("LLMGATE_RULE", name.to_string()),
        ("LLMGATE_RULE_SOURCE", rule.source.to_string()),
        ("LLMGATE_RULE_PORT", rule.port.to_string()),
    ]
}

#[async_trait]
impl ComputeApi for ScriptHooks {
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>, CollaboratorError> {
        let stdout = not_found_as_none(run_hook("status", &self.hooks.status, &instance_env(id)).await)?;
        stdout.as_deref().map(parse_instance).transpose()
    }

    async fn start(&self, id: &str) -> Result<(), CollaboratorError> {
        run_hook("start", &self.hooks.start, &instance_env(id)).await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), CollaboratorError> {
        run_hook("stop", &self.hooks.stop, &instance_env(id)).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), CollaboratorError> {
        run_hook("delete", &self.hooks.delete, &instance_env(id)).await?;
        Ok(())
    }
}

#[async_trait]
impl RuleApi for ScriptHooks {
    async fn get_rule(&self, name: &str) -> Result<Option<AccessRule>, CollaboratorError> {
        let env = [("LLMGATE_RULE", name.to_string())];
        let stdout = not_found_as_none(run_hook("rule_get", &self.hooks.rule_get, &env).await)?;
        // A rule printed without a port reports port 0
        stdout.as_deref().map(|s| parse_rule(s, 0)).transpose()
    }

    async fn create_rule(&self, name: &str, rule: &AccessRule) -> Result<(), CollaboratorError> {
        run_hook("rule_create", &self.hooks.rule_create, &rule_env(name, rule)).await?;
        Ok(())
    }

    async fn patch_rule(&self, name: &str, rule: &AccessRule) -> Result<(), CollaboratorError> {
        run_hook("rule_patch", &self.hooks.rule_patch, &rule_env(name, rule)).await?;
        Ok(())
    }

    async fn delete_rule(&self, name: &str) -> Result<(), CollaboratorError> {
        let env = [("LLMGATE_RULE", name.to_string())];
        run_hook("rule_delete", &self.hooks.rule_delete, &env).await?;
        Ok(())
    }
}

#[async_trait]
impl Provisioner for ScriptHooks {
    async fn reconcile(&self, instance: &str) -> Result<(), CollaboratorError> {
        run_hook("reconcile", &self.hooks.reconcile, &instance_env(instance)).await?;
        Ok(())
    }
}
