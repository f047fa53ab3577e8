//! Secure block transfer: sessions, the send pipeline, and the receiving sink.
//!
//! A [`TransferManager`] on the source node splits an artifact into blocks,
//! encrypts each one under the session key, and delivers it through a
//! [`Transport`] to a [`BlockSink`], which verifies and stores it and answers
//! with an acknowledgement. Session progress is persisted after every block
//! so an interrupted transfer resumes without re-sending completed blocks.

pub mod frame;
pub mod manager;
pub mod retry;
pub mod session;
pub mod sink;
pub mod source;
pub mod store;
pub mod tcp;
pub mod transport;


use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

pub use manager::{ProgressCallback, SessionRequest, TransferManager, TransferSettings};
pub use retry::RetryPolicy;
pub use session::{BlockStatus, BlockTransferInfo, SessionReport, SessionStatus, TransferSession};
pub use sink::{
    BlockSink, BlockStore, FileBlockStore, MemoryBlockStore, SinkSessionState, DEFAULT_SINK_RETENTION,
};
pub use source::{
    ArtifactResolver, BlockSource, DirectoryResolver, FileArtifact, MemoryArtifact,
    DEFAULT_BLOCK_SIZE,
};
pub use store::SessionStore;
pub use tcp::TcpTransport;
pub use transport::{LoopbackTransport, Transport};

/// Spawn a background task that periodically evicts finished sessions past
/// their retention window. The first pass runs after one full interval.
pub fn eviction_task(manager: TransferManager, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match manager.evict_expired_sessions().await {
                Ok(0) => {}
                Ok(evicted) => info!(evicted, "finished sessions evicted"),
                Err(e) => warn!(error = %e, "session eviction failed"),
            }
        }
    })
}

/// Spawn a background task that periodically drops idle sink sessions.
pub fn sink_sweep_task(sink: BlockSink, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = sink.evict_idle_sessions().await;
            if evicted > 0 {
                info!(evicted, "idle sink sessions evicted");
            }
        }
    })
}
