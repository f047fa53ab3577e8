//! Atomic, owner-only file persistence shared by the key registry, the
//! session store, and the sink block store.
//!
//! Invariants:
//! - A write goes to a `.tmp` sibling first, then an atomic rename replaces
//!   the target, so a crash mid-write leaves either the old or the new file.
//! - On rename failure the temp file is removed.
//! - On Unix, files are created `0600` and directories `0700`.

use std::io;
use std::path::Path;

use common::TransferError;
use thiserror::Error;
use tokio::fs;
use tracing::error;

/// Errors from on-disk stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store serialisation error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persisted record exists but cannot be interpreted.
    #[error("corrupt store record: {0}")]
    Corrupt(String),
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        TransferError::Internal(err.to_string())
    }
}

/// Create `dir` (and parents) if absent and restrict it to the owner.
pub async fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

/// Atomically write `content` to `path` via a temporary file and rename.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or the rename fails.
pub async fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = tmp_sibling(path);

    write_private(&tmp_path, content).await.map_err(|e| {
        error!(path = %tmp_path.display(), error = %e, "failed to write temp file");
        e
    })?;

    if let Err(e) = fs::rename(&tmp_path, path).await {
        error!(
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "failed to rename temp file"
        );
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

/// Blocking form of [`atomic_write`] for callers outside the runtime, such
/// as synchronous hardware identity lookups.
pub fn atomic_write_blocking(path: &Path, content: &[u8]) -> io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_sibling(path);

    let written = (|| {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()
    })();
    if let Err(e) = written.and_then(|()| std::fs::rename(&tmp_path, path)) {
        error!(path = %path.display(), error = %e, "failed to write file atomically");
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    std::path::PathBuf::from(tmp_name)
}

/// Remove `path`, treating an already-missing file as success.
pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    Ok(())
}
