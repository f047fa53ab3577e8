//! [`SessionStore`]: one JSON record per session, rewritten atomically on
//! every durable transition so a restarted process can resume.

use std::path::{Path, PathBuf};

use common::SessionId;
use tokio::fs;
use tracing::warn;

use super::session::TransferSession;
use crate::persist::{self, StoreError};

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the store directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        persist::ensure_private_dir(&dir).await?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn save(&self, session: &TransferSession) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(session)?;
        persist::atomic_write(&self.record_path(session.id), &bytes).await?;
        Ok(())
    }

    pub async fn load(&self, id: SessionId) -> Result<Option<TransferSession>, StoreError> {
        match fs::read(self.record_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable record. Unparseable records are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<TransferSession>, StoreError> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<TransferSession>(&bytes) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session record"),
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    pub async fn remove(&self, id: SessionId) -> Result<(), StoreError> {
        persist::remove_if_exists(&self.record_path(id)).await?;
        Ok(())
    }
}
