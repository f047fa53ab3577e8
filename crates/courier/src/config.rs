//! Configuration loading and validation for a courier node.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or invalid.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;

use crate::keys::{KdfParams, KeyPolicy};
use crate::transfer::{RetryPolicy, TransferSettings};

/// Validated node configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// License secret the key-encryption key is derived from. **Required.**
    license_secret: String,

    /// Directory holding the key registry.
    #[serde(default = "default_key_store_dir")]
    pub key_store_dir: String,

    /// Directory holding persisted transfer sessions.
    #[serde(default = "default_session_store_dir")]
    pub session_store_dir: String,

    /// Directory accepted blocks are written to.
    #[serde(default = "default_block_store_dir")]
    pub block_store_dir: String,

    /// Directory artifacts are resolved from when recovering outbound
    /// sessions.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,

    /// Address the sink listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Sink node to resume outbound sessions towards. Outbound transfers are
    /// disabled when unset.
    #[serde(default)]
    pub peer_addr: Option<String>,

    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,

    /// Blocks of one session in flight at once.
    #[serde(default = "default_block_window")]
    pub block_window: usize,

    /// Attempts per block before the session fails.
    #[serde(default = "default_max_block_retries")]
    pub max_block_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Deadline (seconds) for one delivery acknowledgement.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Resumes allowed out of `Failed` before a session is cancelled.
    #[serde(default = "default_max_session_resumes")]
    pub max_session_resumes: u32,

    /// How long (seconds) a rotated or expired key keeps decrypting.
    #[serde(default = "default_key_overlap_window_secs")]
    pub key_overlap_window_secs: u64,

    /// How long (seconds) finished sessions are kept.
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,

    /// How often (seconds) key cleanup and session eviction run.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Argon2id memory cost in KiB.
    #[serde(default = "default_kdf_memory_kib")]
    pub kdf_memory_kib: u32,

    /// Argon2id passes.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_key_store_dir() -> String {
    "./data/keys".into()
}
fn default_session_store_dir() -> String {
    "./data/sessions".into()
}
fn default_block_store_dir() -> String {
    "./data/blocks".into()
}
fn default_artifact_dir() -> String {
    "./data/artifacts".into()
}
fn default_listen_addr() -> String {
    "0.0.0.0:7420".into()
}
fn default_max_concurrent_sessions() -> usize {
    3
}
fn default_block_window() -> usize {
    4
}
fn default_max_block_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    8000
}
fn default_send_timeout_secs() -> u64 {
    30
}
fn default_max_session_resumes() -> u32 {
    3
}
fn default_key_overlap_window_secs() -> u64 {
    86_400
}
fn default_session_retention_secs() -> u64 {
    3600
}
fn default_maintenance_interval_secs() -> u64 {
    300
}
fn default_kdf_memory_kib() -> u32 {
    19_456
}
fn default_kdf_iterations() -> u32 {
    2
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.license_secret, "LICENSE_SECRET")?;
        ensure_non_empty(&self.key_store_dir, "KEY_STORE_DIR")?;
        ensure_non_empty(&self.session_store_dir, "SESSION_STORE_DIR")?;
        ensure_non_empty(&self.block_store_dir, "BLOCK_STORE_DIR")?;
        ensure_non_empty(&self.listen_addr, "LISTEN_ADDR")?;
        if let Some(peer) = &self.peer_addr {
            ensure_non_empty(peer, "PEER_ADDR")?;
        }

        if self.max_concurrent_sessions == 0 {
            anyhow::bail!("MAX_CONCURRENT_SESSIONS must be > 0");
        }
        if self.block_window == 0 {
            anyhow::bail!("BLOCK_WINDOW must be > 0");
        }
        if self.max_block_retries == 0 {
            anyhow::bail!("MAX_BLOCK_RETRIES must be > 0");
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("RETRY_BASE_DELAY_MS must not exceed RETRY_MAX_DELAY_MS");
        }
        if self.send_timeout_secs == 0 {
            anyhow::bail!("SEND_TIMEOUT_SECS must be > 0");
        }
        if self.maintenance_interval_secs == 0 {
            anyhow::bail!("MAINTENANCE_INTERVAL_SECS must be > 0");
        }
        if self.kdf_memory_kib < 8 {
            anyhow::bail!("KDF_MEMORY_KIB must be at least 8");
        }
        if self.kdf_iterations == 0 {
            anyhow::bail!("KDF_ITERATIONS must be > 0");
        }
        Ok(())
    }

    pub fn license_secret(&self) -> SecretString {
        SecretString::new(self.license_secret.clone().into())
    }

    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy {
            overlap_window: Duration::from_secs(self.key_overlap_window_secs),
            kdf: KdfParams {
                memory_kib: self.kdf_memory_kib,
                iterations: self.kdf_iterations,
                ..KdfParams::default()
            },
        }
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            max_concurrent_sessions: self.max_concurrent_sessions,
            block_window: self.block_window,
            retry: RetryPolicy {
                max_attempts: self.max_block_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            max_session_resumes: self.max_session_resumes,
            session_retention: Duration::from_secs(self.session_retention_secs),
        }
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("license_secret", &"[REDACTED]")
            .field("key_store_dir", &self.key_store_dir)
            .field("session_store_dir", &self.session_store_dir)
            .field("block_store_dir", &self.block_store_dir)
            .field("artifact_dir", &self.artifact_dir)
            .field("listen_addr", &self.listen_addr)
            .field("peer_addr", &self.peer_addr)
            .field("max_concurrent_sessions", &self.max_concurrent_sessions)
            .field("block_window", &self.block_window)
            .field("max_block_retries", &self.max_block_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("retry_max_delay_ms", &self.retry_max_delay_ms)
            .field("send_timeout_secs", &self.send_timeout_secs)
            .field("max_session_resumes", &self.max_session_resumes)
            .field("key_overlap_window_secs", &self.key_overlap_window_secs)
            .field("session_retention_secs", &self.session_retention_secs)
            .field("maintenance_interval_secs", &self.maintenance_interval_secs)
            .field("kdf_memory_kib", &self.kdf_memory_kib)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
