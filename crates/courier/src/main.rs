//! `courier` node binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise structured JSON logging.
//! 3. Open the key registry, bound to this machine's hardware fingerprint.
//! 4. Build the block sink over the on-disk block store.
//! 5. If a peer is configured, recover and resume outbound sessions.
//! 6. Spawn background maintenance: key cleanup, sink and session eviction.
//! 7. Serve the sink listener until Ctrl-C.
//!
//! [`Config`]: courier::config::Config

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use common::NodeId;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier::config::Config;
use courier::keys::{self, KeyManager, SystemIdentity};
use courier::transfer::{
    self, BlockSink, DirectoryResolver, FileBlockStore, SessionStatus, SessionStore, TcpTransport,
    TransferManager, DEFAULT_BLOCK_SIZE,
};
use courier::{server, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %cfg.listen_addr,
        "courier starting"
    );

    // -----------------------------------------------------------------------
    // 3. Key manager
    // -----------------------------------------------------------------------
    let identity = SystemIdentity::new(Path::new(&cfg.key_store_dir).join("installation.id"));
    let keys = KeyManager::open(
        &cfg.key_store_dir,
        cfg.license_secret(),
        cfg.key_policy(),
        Arc::new(identity),
    )
    .await
    .context("failed to open key registry")?;
    info!(keys = keys.list_keys().await.len(), "key registry loaded");

    // -----------------------------------------------------------------------
    // 4. Block sink
    // -----------------------------------------------------------------------
    let blocks = FileBlockStore::open(&cfg.block_store_dir)
        .await
        .context("failed to open block store")?;
    let node = NodeId::new(hostname().unwrap_or_else(|| "courier".into()));
    let sink = BlockSink::with_retention(
        node,
        keys.clone(),
        Arc::new(blocks),
        cfg.transfer_settings().session_retention,
    );

    // -----------------------------------------------------------------------
    // 5. Outbound sessions
    // -----------------------------------------------------------------------
    let outbound = match &cfg.peer_addr {
        Some(peer) => Some(resume_outbound(&cfg, keys.clone(), peer).await?),
        None => None,
    };

    // -----------------------------------------------------------------------
    // 6. Background tasks
    // -----------------------------------------------------------------------
    let _key_cleanup = keys::cleanup_task(keys.clone(), cfg.maintenance_interval());
    let _sink_sweep = transfer::sink_sweep_task(sink.clone(), cfg.maintenance_interval());
    let _session_eviction = outbound.map(|manager| transfer::eviction_task(manager, cfg.maintenance_interval()));

    // -----------------------------------------------------------------------
    // 7. Sink listener
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown requested");
        signal.cancel();
    });

    server::run(&cfg.listen_addr, sink, shutdown).await
}

/// Reload persisted outbound sessions and restart every interrupted one
/// towards `peer`.
async fn resume_outbound(cfg: &Config, keys: KeyManager, peer: &str) -> Result<TransferManager> {
    let store = SessionStore::open(&cfg.session_store_dir)
        .await
        .context("failed to open session store")?;
    let manager = TransferManager::new(
        keys,
        Arc::new(TcpTransport::new(peer)),
        store,
        cfg.transfer_settings(),
    );

    let resolver = DirectoryResolver::new(&cfg.artifact_dir, DEFAULT_BLOCK_SIZE);
    manager
        .recover_sessions(&resolver)
        .await
        .context("failed to recover sessions")?;

    for report in manager.list_sessions().await {
        if report.status == SessionStatus::Paused && manager.resume_transfer(report.session_id).await {
            info!(
                session_id = %report.session_id,
                artifact_id = %report.artifact_id,
                peer,
                "outbound session resumed"
            );
        }
    }
    Ok(manager)
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
}
