//! Artifact block sources.
//!
//! An artifact is split into fixed-size blocks; only the final block may be
//! shorter. Sources are read one block at a time so a session never buffers
//! more than its send window.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::TransferError;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

/// Default block size: 1 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Random-access reader over the blocks of one artifact.
#[async_trait]
pub trait BlockSource: Send + Sync {
    fn block_count(&self) -> u64;

    /// Read block `index`.
    async fn read_block(&self, index: u64) -> Result<Vec<u8>, TransferError>;
}

/// Finds the source for an artifact id, used when sessions are recovered
/// after a restart.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn resolve(&self, artifact_id: &str) -> Result<Arc<dyn BlockSource>, TransferError>;
}

fn block_count(len: u64, block_size: usize) -> u64 {
    len.div_ceil(block_size as u64)
}

fn block_range(len: u64, block_size: usize, index: u64) -> Result<(u64, usize), TransferError> {
    let offset = index
        .checked_mul(block_size as u64)
        .filter(|offset| *offset < len)
        .ok_or_else(|| TransferError::Internal(format!("block {index} is out of range")))?;
    let size = (len - offset).min(block_size as u64) as usize;
    Ok((offset, size))
}

// ---------------------------------------------------------------------------
// File-backed
// ---------------------------------------------------------------------------

/// An artifact stored in a local file.
#[derive(Debug)]
pub struct FileArtifact {
    path: PathBuf,
    len: u64,
    block_size: usize,
    file: Mutex<File>,
}

impl FileArtifact {
    /// Open `path` for block reads.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Internal`] if the file cannot be opened or the
    /// block size is zero.
    pub async fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self, TransferError> {
        if block_size == 0 {
            return Err(TransferError::Internal("block size must be non-zero".into()));
        }
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .await
            .map_err(|e| TransferError::Internal(format!("open {}: {e}", path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| TransferError::Internal(format!("stat {}: {e}", path.display())))?
            .len();
        Ok(Self {
            path,
            len,
            block_size,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[async_trait]
impl BlockSource for FileArtifact {
    fn block_count(&self) -> u64 {
        block_count(self.len, self.block_size)
    }

    async fn read_block(&self, index: u64) -> Result<Vec<u8>, TransferError> {
        let (offset, size) = block_range(self.len, self.block_size, index)?;
        let io_err = |e: std::io::Error| {
            TransferError::Internal(format!("read block {index} of {}: {e}", self.path.display()))
        };

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf).await.map_err(io_err)?;
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// An artifact held in memory.
#[derive(Debug, Clone)]
pub struct MemoryArtifact {
    data: Bytes,
    block_size: usize,
}

impl MemoryArtifact {
    pub fn new(data: impl Into<Bytes>, block_size: usize) -> Self {
        Self {
            data: data.into(),
            block_size: block_size.max(1),
        }
    }
}

#[async_trait]
impl BlockSource for MemoryArtifact {
    fn block_count(&self) -> u64 {
        block_count(self.data.len() as u64, self.block_size)
    }

    async fn read_block(&self, index: u64) -> Result<Vec<u8>, TransferError> {
        let (offset, size) = block_range(self.data.len() as u64, self.block_size, index)?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + size).to_vec())
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolves artifact ids as relative paths under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    root: PathBuf,
    block_size: usize,
}

impl DirectoryResolver {
    pub fn new(root: impl Into<PathBuf>, block_size: usize) -> Self {
        Self {
            root: root.into(),
            block_size,
        }
    }
}

#[async_trait]
impl ArtifactResolver for DirectoryResolver {
    async fn resolve(&self, artifact_id: &str) -> Result<Arc<dyn BlockSource>, TransferError> {
        let relative = Path::new(artifact_id);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(TransferError::Internal(format!(
                "artifact id {artifact_id:?} is not a relative path"
            )));
        }
        let artifact = FileArtifact::open(self.root.join(relative), self.block_size).await?;
        Ok(Arc::new(artifact))
    }
}
