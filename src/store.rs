//! File-backed implementations of the secret and state stores.
//!
//! Layout under the state directory:
//!
//! ```text
//! secrets/<key>/<version>     one file per version, owner-only
//! state/<name>.json           merged state document
//! ```
//!
//! A backend that mounts the same directory (or a sync job mirroring it into
//! a cloud secret manager) picks up new versions from here.

use crate::collaborators::{CollaboratorError, SecretStore, StateStore, StateUpdate};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

fn check_name(name: &str) -> Result<(), CollaboratorError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(CollaboratorError::Failed(format!("invalid store key: {:?}", name)));
    }
    Ok(())
}

async fn write_private(path: &Path, data: &[u8]) -> Result<(), CollaboratorError> {
    tokio::fs::write(path, data).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

/// Append-only versioned secrets on local disk.
pub struct FileSecretStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("secrets"),
            write_lock: Mutex::new(()),
        }
    }

    async fn latest_version(dir: &Path) -> Result<Option<u64>, CollaboratorError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest = None;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(v) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u64>().ok())
            {
                latest = latest.max(Some(v));
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn access_latest(&self, key: &str) -> Result<Vec<u8>, CollaboratorError> {
        check_name(key)?;
        let dir = self.root.join(key);
        let version = Self::latest_version(&dir)
            .await?
            .ok_or_else(|| CollaboratorError::NotFound(format!("secret {}", key)))?;
        Ok(tokio::fs::read(dir.join(version.to_string())).await?)
    }

    async fn add_version(&self, key: &str, data: &[u8]) -> Result<(), CollaboratorError> {
        check_name(key)?;
        let _guard = self.write_lock.lock().await;

        let dir = self.root.join(key);
        tokio::fs::create_dir_all(&dir).await?;
        let next = Self::latest_version(&dir).await?.map_or(1, |v| v + 1);
        write_private(&dir.join(next.to_string()), data).await?;

        debug!(key, version = next, "Added secret version");
        Ok(())
    }
}

/// JSON state documents on local disk.
pub struct FileStateStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("state"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn merge(&self, name: &str, update: &StateUpdate) -> Result<(), CollaboratorError> {
        check_name(name)?;
        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path(name);

        let mut doc = match tokio::fs::read(&path).await {
            // A corrupt document is left in place
            Ok(bytes) => serde_json::from_slice::<Map<String, Value>>(&bytes).map_err(|e| {
                warn!(path = %path.display(), error = %e, "State document is corrupt");
                CollaboratorError::Failed(format!(
                    "corrupt state document {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };

        if let Value::Object(fields) = serde_json::to_value(update)
            .map_err(|e| CollaboratorError::Failed(e.to_string()))?
        {
            doc.extend(fields);
        }

        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| CollaboratorError::Failed(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
