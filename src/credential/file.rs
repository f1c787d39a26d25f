//! File-backed credential storage.
//!
//! One JSON record per session under a base directory, so credentials
//! survive restarts. File names are derived from a SHA-256 of the session id.
//! Writes go to a temporary file that is renamed into place, so a reader
//! sees either the old record or the new one.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CredentialBackend, UpstreamCredential, is_reapable};
use crate::{Error, Result};

/// On-disk record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    session_id: String,
    #[serde(flatten)]
    credential: UpstreamCredential,
}

/// Credential storage persisting one file per session.
pub struct FileCredentialBackend {
    base_dir: PathBuf,
    /// Per-session write locks; different sessions never share one.
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileCredentialBackend {
    /// Create a backend rooted at `base_dir`, creating it if needed.
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        if !base_dir.exists() {
            std::fs::create_dir_all(&base_dir).map_err(|e| {
                Error::Internal(format!("Failed to create credential storage dir: {e}"))
            })?;
        }

        Ok(Self {
            base_dir,
            write_locks: DashMap::new(),
        })
    }

    /// Create storage in the default location (`~/.redmine-oauth-bridge/credentials`)
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Internal("Cannot determine home directory".to_string()))?;

        Self::new(home.join(".redmine-oauth-bridge").join("credentials"))
    }

    /// Storage directory
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn storage_key(session_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        let hash = hasher.finalize();
        format!("{hash:x}")[..32].to_string()
    }

    fn credential_path(&self, session_id: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}_credential.json", Self::storage_key(session_id)))
    }

    fn write_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn read_record(path: &Path) -> Result<Option<StoredCredential>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<StoredCredential>(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse stored credential");
                Ok(None)
            }
        }
    }

    async fn write_record(&self, session_id: &str, credential: UpstreamCredential) -> Result<()> {
        let path = self.credential_path(session_id);
        let record = StoredCredential {
            session_id: session_id.to_string(),
            credential,
        };
        let content = serde_json::to_string_pretty(&record)?;

        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        let written = async {
            Self::write_private(&tmp, content.as_bytes()).await?;
            fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Create `path` readable by the owner only and write `content` to it.
    async fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(path).await?;
        file.write_all(content).await?;
        file.sync_all().await
    }

    async fn load_unlocked(&self, session_id: &str) -> Result<Option<UpstreamCredential>> {
        let path = self.credential_path(session_id);
        Ok(Self::read_record(&path)
            .await?
            .filter(|record| record.session_id == session_id)
            .map(|record| record.credential))
    }
}

#[async_trait]
impl CredentialBackend for FileCredentialBackend {
    async fn load(&self, session_id: &str) -> Result<Option<UpstreamCredential>> {
        self.load_unlocked(session_id).await
    }

    async fn save(&self, session_id: &str, credential: UpstreamCredential) -> Result<()> {
        let lock = self.write_lock(session_id);
        let _guard = lock.lock().await;
        self.write_record(session_id, credential).await?;
        debug!("Saved upstream credential");
        Ok(())
    }

    async fn replace(
        &self,
        session_id: &str,
        previous_access_token: &str,
        credential: UpstreamCredential,
    ) -> Result<bool> {
        let lock = self.write_lock(session_id);
        let _guard = lock.lock().await;

        match self.load_unlocked(session_id).await? {
            Some(current) if current.access_token == previous_access_token => {
                self.write_record(session_id, credential).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, session_id: &str) -> Result<bool> {
        let lock = self.write_lock(session_id);
        let removed = {
            let _guard = lock.lock().await;
            match fs::remove_file(self.credential_path(session_id)).await {
                Ok(()) => true,
                Err(e) if e.kind() == IoErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            }
        };
        drop(lock);
        // Only forget the lock when no other writer is queued on it
        self.write_locks
            .remove_if(session_id, |_, l| Arc::strong_count(l) == 1);

        if removed {
            info!("Deleted upstream credential");
        }
        Ok(removed)
    }

    async fn reap(&self, grace: Duration) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut reaped = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(record) = Self::read_record(&path).await? else {
                continue;
            };
            if is_reapable(&record.credential, grace) && self.remove(&record.session_id).await? {
                reaped.push(record.session_id);
            }
        }

        if !reaped.is_empty() {
            debug!(count = reaped.len(), "Reaped expired stored credentials");
        }
        Ok(reaped)
    }
}
