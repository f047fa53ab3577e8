//! Receiving side: verifies arriving blocks and hands them to a
//! [`BlockStore`].
//!
//! A block is accepted only after its authentication tag and its plaintext
//! digest both verify. Before doing any work the sink checks whether the
//! block is already stored, so a retried delivery is acknowledged as a
//! duplicate and never overwrites accepted data.
//!
//! Per-session bookkeeping is bounded: a session closed as complete is
//! forgotten at once, and any other session idle for longer than the
//! retention window is dropped by [`BlockSink::evict_idle_sessions`]. The
//! block store stays the source of truth for duplicates after that.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::protocol::{BlockFrame, DeliveryAck, SessionControl, WireMessage};
use common::{FailureKind, FailureReason, NodeId, SessionId, TransferError};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::crypto::verify_digest;
use crate::keys::KeyManager;
use crate::persist;

// ---------------------------------------------------------------------------
// Block stores
// ---------------------------------------------------------------------------

/// Where accepted plaintext blocks end up.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn contains(&self, session_id: SessionId, index: u64) -> Result<bool, TransferError>;

    async fn put(&self, session_id: SessionId, index: u64, data: Vec<u8>) -> Result<(), TransferError>;

    async fn get(&self, session_id: SessionId, index: u64) -> Result<Option<Vec<u8>>, TransferError>;
}

#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<SessionId, BTreeMap<u64, Vec<u8>>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored block of `session_id` concatenated in index order.
    pub async fn assemble(&self, session_id: SessionId) -> Vec<u8> {
        self.blocks
            .read()
            .await
            .get(&session_id)
            .map(|blocks| blocks.values().flatten().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn contains(&self, session_id: SessionId, index: u64) -> Result<bool, TransferError> {
        Ok(self
            .blocks
            .read()
            .await
            .get(&session_id)
            .is_some_and(|blocks| blocks.contains_key(&index)))
    }

    async fn put(&self, session_id: SessionId, index: u64, data: Vec<u8>) -> Result<(), TransferError> {
        self.blocks
            .write()
            .await
            .entry(session_id)
            .or_default()
            .insert(index, data);
        Ok(())
    }

    async fn get(&self, session_id: SessionId, index: u64) -> Result<Option<Vec<u8>>, TransferError> {
        Ok(self
            .blocks
            .read()
            .await
            .get(&session_id)
            .and_then(|blocks| blocks.get(&index).cloned()))
    }
}

/// One file per block under `<root>/<session_id>/`.
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    root: PathBuf,
}

impl FileBlockStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, TransferError> {
        let root = root.as_ref().to_path_buf();
        persist::ensure_private_dir(&root)
            .await
            .map_err(|e| TransferError::Internal(format!("block store {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn block_path(&self, session_id: SessionId, index: u64) -> PathBuf {
        self.root
            .join(session_id.to_string())
            .join(format!("{index:010}.blk"))
    }
}

#[async_trait]
impl BlockStore for FileBlockStore {
    async fn contains(&self, session_id: SessionId, index: u64) -> Result<bool, TransferError> {
        fs::try_exists(self.block_path(session_id, index))
            .await
            .map_err(|e| TransferError::Internal(e.to_string()))
    }

    async fn put(&self, session_id: SessionId, index: u64, data: Vec<u8>) -> Result<(), TransferError> {
        persist::atomic_write(&self.block_path(session_id, index), &data)
            .await
            .map_err(|e| TransferError::Internal(format!("store block {index}: {e}")))
    }

    async fn get(&self, session_id: SessionId, index: u64) -> Result<Option<Vec<u8>>, TransferError> {
        match fs::read(self.block_path(session_id, index)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransferError::Internal(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSessionState {
    Open,
    Closed,
    Cancelled,
}

#[derive(Debug)]
struct SinkSession {
    total_blocks: Option<u64>,
    state: SinkSessionState,
    completed: BTreeSet<u64>,
    /// Blocks currently being verified; a second delivery of one of these
    /// is refused until the first finishes.
    verifying: BTreeSet<u64>,
    last_activity: Instant,
}

impl SinkSession {
    fn new() -> Self {
        Self {
            total_blocks: None,
            state: SinkSessionState::Open,
            completed: BTreeSet::new(),
            verifying: BTreeSet::new(),
            last_activity: Instant::now(),
        }
    }
}

/// Look up or create the bookkeeping of `session_id` and mark it active.
fn touch(sessions: &mut HashMap<SessionId, SinkSession>, session_id: SessionId) -> &mut SinkSession {
    let session = sessions.entry(session_id).or_insert_with(SinkSession::new);
    session.last_activity = Instant::now();
    session
}

/// Default for how long an idle session's bookkeeping is kept.
pub const DEFAULT_SINK_RETENTION: Duration = Duration::from_secs(3600);

struct SinkInner {
    node: NodeId,
    keys: KeyManager,
    store: Arc<dyn BlockStore>,
    sessions: Mutex<HashMap<SessionId, SinkSession>>,
    retention: Duration,
}

/// Applies delivered [`WireMessage`]s on a receiving node.
#[derive(Clone)]
pub struct BlockSink {
    inner: Arc<SinkInner>,
}

impl BlockSink {
    pub fn new(node: NodeId, keys: KeyManager, store: Arc<dyn BlockStore>) -> Self {
        Self::with_retention(node, keys, store, DEFAULT_SINK_RETENTION)
    }

    /// Like [`BlockSink::new`], keeping idle session bookkeeping for
    /// `retention`.
    pub fn with_retention(
        node: NodeId,
        keys: KeyManager,
        store: Arc<dyn BlockStore>,
        retention: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                node,
                keys,
                store,
                sessions: Mutex::new(HashMap::new()),
                retention,
            }),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.inner.node
    }

    /// Apply one message and produce its acknowledgement.
    pub async fn handle(&self, message: WireMessage) -> DeliveryAck {
        match message {
            WireMessage::Control(control) => self.handle_control(control).await,
            WireMessage::Block(frame) => {
                let session_id = frame.session_id;
                let index = frame.block_index;
                match self.accept_block(frame).await {
                    Ok(ack) => ack,
                    Err(e) => {
                        warn!(session_id = %session_id, block_index = index, error = %e, "block rejected");
                        DeliveryAck::rejected(session_id, Some(index), e.reason())
                    }
                }
            }
        }
    }

    async fn handle_control(&self, control: SessionControl) -> DeliveryAck {
        let session_id = control.session_id();
        let mut sessions = self.inner.sessions.lock().await;
        match control {
            SessionControl::Open {
                artifact_id,
                source,
                key_id,
                total_blocks,
                ..
            } => {
                let session = touch(&mut sessions, session_id);
                if session.state == SinkSessionState::Cancelled {
                    return DeliveryAck::rejected(
                        session_id,
                        None,
                        FailureReason::new(FailureKind::Cancelled, "session was cancelled"),
                    );
                }
                session.total_blocks = Some(total_blocks);
                session.state = SinkSessionState::Open;
                info!(
                    session_id = %session_id,
                    artifact_id = %artifact_id,
                    source = %source,
                    key_id = %key_id,
                    total_blocks,
                    "session opened"
                );
            }
            SessionControl::Close { completed: true, .. } => {
                if let Some(session) = sessions.remove(&session_id) {
                    info!(session_id = %session_id, received = session.completed.len(), "session completed");
                }
            }
            SessionControl::Close { completed: false, .. } => {
                if let Some(session) = sessions.get_mut(&session_id) {
                    session.state = SinkSessionState::Closed;
                    session.last_activity = Instant::now();
                    info!(
                        session_id = %session_id,
                        received = session.completed.len(),
                        "session closed before completion"
                    );
                }
            }
            SessionControl::Cancel { .. } => {
                let session = touch(&mut sessions, session_id);
                session.state = SinkSessionState::Cancelled;
                info!(session_id = %session_id, received = session.completed.len(), "session cancelled by source");
            }
        }
        DeliveryAck::accepted(session_id, None)
    }

    async fn accept_block(&self, frame: BlockFrame) -> Result<DeliveryAck, TransferError> {
        let session_id = frame.session_id;
        let index = frame.block_index;

        {
            let mut sessions = self.inner.sessions.lock().await;
            // A block may outrun its Open notice after a sink restart.
            let session = touch(&mut sessions, session_id);
            if session.state == SinkSessionState::Cancelled {
                return Err(TransferError::Cancelled);
            }
            if let Some(total) = session.total_blocks {
                if index >= total {
                    return Err(TransferError::Internal(format!(
                        "block {index} beyond session size {total}"
                    )));
                }
            }
            if session.completed.contains(&index) {
                return Ok(DeliveryAck::duplicate(session_id, index));
            }
            if !session.verifying.insert(index) {
                return Err(TransferError::Transport(format!(
                    "block {index} is already being verified"
                )));
            }
        }

        let outcome = self.verify_and_store(&frame).await;

        let mut sessions = self.inner.sessions.lock().await;
        let session = touch(&mut sessions, session_id);
        session.verifying.remove(&index);
        match outcome {
            Ok(Stored::New) => {
                session.completed.insert(index);
                debug!(session_id = %session_id, block_index = index, "block accepted");
                Ok(DeliveryAck::accepted(session_id, Some(index)))
            }
            Ok(Stored::AlreadyPresent) => {
                session.completed.insert(index);
                Ok(DeliveryAck::duplicate(session_id, index))
            }
            Err(e) => Err(e),
        }
    }

    async fn verify_and_store(&self, frame: &BlockFrame) -> Result<Stored, TransferError> {
        let store = &self.inner.store;
        // Survives a sink restart, unlike the in-memory completed set.
        if store.contains(frame.session_id, frame.block_index).await? {
            return Ok(Stored::AlreadyPresent);
        }
        let plaintext = self
            .inner
            .keys
            .decrypt_block(frame.key_id, &frame.nonce, &frame.ciphertext, &frame.tag)
            .await?;
        verify_digest(&plaintext, &frame.digest)?;
        store
            .put(frame.session_id, frame.block_index, plaintext)
            .await?;
        Ok(Stored::New)
    }

    /// Indices accepted so far for `session_id`.
    pub async fn completed_blocks(&self, session_id: SessionId) -> Vec<u64> {
        self.inner
            .sessions
            .lock()
            .await
            .get(&session_id)
            .map(|s| s.completed.iter().copied().collect())
            .unwrap_or_default()
    }

    /// `None` once a session has completed or been evicted.
    pub async fn session_state(&self, session_id: SessionId) -> Option<SinkSessionState> {
        self.inner
            .sessions
            .lock()
            .await
            .get(&session_id)
            .map(|s| s.state)
    }

    /// Sessions currently tracked.
    pub async fn tracked_sessions(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Forget sessions idle for longer than the retention window. Sessions
    /// with a block under verification are kept. Returns how many were
    /// dropped.
    pub async fn evict_idle_sessions(&self) -> usize {
        let retention = self.inner.retention;
        let mut sessions = self.inner.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|session_id, session| {
            let keep = !session.verifying.is_empty() || session.last_activity.elapsed() < retention;
            if !keep {
                debug!(session_id = %session_id, state = ?session.state, "idle sink session evicted");
            }
            keep
        });
        before - sessions.len()
    }
}

enum Stored {
    New,
    AlreadyPresent,
}
