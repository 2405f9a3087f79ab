//! Credential material for a pairing session.
//!
//! Each session gets a private temporary directory ([`ResourceHandle`]) that
//! the protocol client persists its auth state into. The directory is the
//! credential artifact's source once the session opens, and it is deleted
//! exactly once when the session is cleaned up.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// File inside the session directory holding the merged credentials.
pub const CREDS_FILE: &str = "creds.json";

/// Authentication state handed to the protocol client on connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    /// Opaque credential document.
    pub creds: serde_json::Value,
    /// Whether the credentials already belong to a linked device.
    pub registered: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read credentials at {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to write credentials at {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("credentials at {0} are not valid JSON: {1}")]
    Parse(PathBuf, serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to remove {0}: {1}")]
pub struct CleanupError(pub PathBuf, pub std::io::Error);

/// Credential-persistence collaborator.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, location: &Path) -> Result<AuthState, CredentialError>;

    /// Merge a partial update into the stored credentials.
    async fn save(&self, location: &Path, delta: &serde_json::Value) -> Result<(), CredentialError>;
}

/// Stores credentials as a single JSON document per session directory.
#[derive(Debug, Default, Clone)]
pub struct FileCredentialStore;

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, location: &Path) -> Result<AuthState, CredentialError> {
        let path = location.join(CREDS_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AuthState {
                    creds: serde_json::Value::Object(Default::default()),
                    registered: false,
                });
            }
            Err(e) => return Err(CredentialError::Read(path, e)),
        };
        let creds: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| CredentialError::Parse(path, e))?;
        let registered = creds
            .get("registered")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        Ok(AuthState { creds, registered })
    }

    async fn save(&self, location: &Path, delta: &serde_json::Value) -> Result<(), CredentialError> {
        let mut state = self.load(location).await?;
        merge_json(&mut state.creds, delta);
        let path = location.join(CREDS_FILE);
        tokio::fs::create_dir_all(location)
            .await
            .map_err(|e| CredentialError::Write(path.clone(), e))?;
        let bytes = serde_json::to_vec_pretty(&state.creds)
            .map_err(|e| CredentialError::Parse(path.clone(), e))?;
        // Write-then-rename so a concurrent reader never sees a torn file.
        let tmp = location.join(format!("{CREDS_FILE}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CredentialError::Write(tmp.clone(), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CredentialError::Write(path, e))?;
        Ok(())
    }
}

/// Recursively merge `delta` into `target`. Objects merge key by key; any
/// other value replaces what was there.
pub fn merge_json(target: &mut serde_json::Value, delta: &serde_json::Value) {
    match (target, delta) {
        (serde_json::Value::Object(t), serde_json::Value::Object(d)) => {
            for (k, v) in d {
                merge_json(t.entry(k.clone()).or_insert(serde_json::Value::Null), v);
            }
        }
        (t, d) => *t = d.clone(),
    }
}

/// Exclusive owner of a session's temporary credential directory.
#[derive(Debug)]
pub struct ResourceHandle {
    path: PathBuf,
    released: AtomicBool,
}

impl ResourceHandle {
    /// Create the directory `<root>/<session_id>`.
    pub async fn create(root: &Path, session_id: &str) -> std::io::Result<Self> {
        let path = root.join(session_id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self {
            path,
            released: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn creds_path(&self) -> PathBuf {
        self.path.join(CREDS_FILE)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Open the credential artifact for streaming.
    pub async fn open_artifact(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(self.creds_path()).await
    }

    /// Delete the directory. Only the first call does any work; later calls
    /// return `Ok(false)`.
    pub async fn release(&self) -> Result<bool, CleanupError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(CleanupError(self.path.clone(), e)),
        }
    }
}
