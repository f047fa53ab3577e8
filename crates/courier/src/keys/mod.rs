//! Key lifecycle: generation, hardware binding, rotation, revocation, and
//! secure disposal of symmetric block-encryption keys.
//!
//! # Lifecycle
//!
//! 1. At startup, [`KeyManager::open`] loads the registry, fingerprints the
//!    machine, derives the key-encryption key, and unwraps every usable key
//!    into memory.
//! 2. Keys are created `Active` by [`KeyManager::generate_random_key`] or
//!    [`KeyManager::generate_hardware_bound_key`].
//! 3. [`KeyManager::rotate_key`] creates a successor and deprecates the
//!    predecessor in one atomic registry write; the predecessor keeps
//!    decrypting for the configured overlap window.
//! 4. [`KeyManager::revoke_key`] is immediate and irreversible.
//! 5. A background task calls [`cleanup_task`] on an interval to purge
//!    retired keys, zeroing their material.
//!
//! # Security invariants
//!
//! - Plaintext key material is **never** written to disk, logged, or included
//!   in traces; callers only ever see a [`KeyId`](common::KeyId).
//! - Every buffer holding key material zeroes itself on drop.

pub mod hardware;
pub mod manager;
pub mod material;
pub mod model;
pub mod store;

pub use hardware::{Fingerprint, HardwareIdentity, StaticIdentity, SystemIdentity};
pub use manager::KeyManager;
pub use material::{KdfParams, KeyBytes};
pub use model::{KeyContext, KeyPolicy, KeyStatus, ManagedKey, RotationEvent};

use common::{KeyId, TransferError};
use thiserror::Error;
use tokio::time;
use tracing::{info, warn};

use crate::crypto::{CipherError, KEY_LEN};
use crate::persist::StoreError;

/// Errors produced by the key layer.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key {0} not found")]
    NotFound(KeyId),

    #[error("key {0} has been revoked")]
    Revoked(KeyId),

    #[error("key {0} has expired")]
    Expired(KeyId),

    #[error("key {0} is bound to different hardware")]
    HardwareMismatch(KeyId),

    #[error("hardware fingerprint unavailable: {0}")]
    HardwareUnavailable(String),

    /// The key exists but its status forbids the requested use.
    #[error("key {key_id} is {status:?} and cannot be used for {usage}")]
    NotUsable {
        key_id: KeyId,
        status: KeyStatus,
        usage: &'static str,
    },

    /// The key's wrapped material could not be opened on this machine.
    #[error("material for key {0} is not loaded")]
    MaterialUnavailable(KeyId),

    /// Rotation aborted; the predecessor is unchanged.
    #[error("rotation of key {key_id} failed: {reason}")]
    RotationFailed { key_id: KeyId, reason: String },

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("key has invalid length: expected {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

impl From<KeyError> for TransferError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Revoked(id) => TransferError::KeyRevoked(id),
            KeyError::Expired(id) => TransferError::KeyExpired(id),
            KeyError::HardwareMismatch(id) => TransferError::HardwareMismatch(id),
            KeyError::HardwareUnavailable(msg) => TransferError::HardwareUnavailable(msg),
            KeyError::RotationFailed { .. } => TransferError::RotationFailed(err.to_string()),
            KeyError::NotFound(_) | KeyError::NotUsable { .. } | KeyError::MaterialUnavailable(_) => {
                TransferError::KeyUnavailable(err.to_string())
            }
            KeyError::Cipher(cipher) => cipher.into(),
            KeyError::Kdf(_) | KeyError::InvalidLength(_) | KeyError::Store(_) => {
                TransferError::Internal(err.to_string())
            }
        }
    }
}

/// Spawn a background task that periodically purges retired keys.
///
/// The first cleanup fires after one full interval. On failure the registry
/// is left unchanged and a warning is emitted.
pub fn cleanup_task(keys: KeyManager, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // First tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match keys.cleanup_expired_keys().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "retired keys purged"),
                Err(e) => warn!(error = %e, "key cleanup failed; registry unchanged"),
            }
        }
    })
}
