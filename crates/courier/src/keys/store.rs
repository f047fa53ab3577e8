//! [`KeyStore`]: the on-disk key registry.
//!
//! The whole registry lives in one `keys.json` file that is rewritten
//! atomically on every change. A rotation therefore lands as a single write
//! containing both the new key and the deprecated predecessor; a crash can
//! never leave the slot with two active keys or none.
//!
//! # Security invariants
//!
//! - Key material is stored only wrapped under the key-encryption key
//!   (`v1.<nonce>.<ciphertext>`); plaintext key bytes never reach disk.
//! - The registry directory is `0700` and the file `0600` on Unix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::KeyId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::model::{ManagedKey, RotationEvent};
use crate::crypto::cipher::random_bytes;
use crate::persist::{self, StoreError};

/// Byte length of the per-store salt mixed into the key-encryption key.
pub const KEK_SALT_LEN: usize = 16;

const REGISTRY_FILE: &str = "keys.json";
const REGISTRY_VERSION: u32 = 1;

/// Persisted form of a key: metadata plus wrapped material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    #[serde(flatten)]
    pub key: ManagedKey,
    /// Wrapped material; absent once the key is revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    kek_salt: String,
    keys: Vec<KeyRecord>,
    #[serde(default)]
    rotations: Vec<RotationEvent>,
}

#[derive(Debug, Clone)]
struct RegistryState {
    kek_salt: [u8; KEK_SALT_LEN],
    keys: BTreeMap<KeyId, KeyRecord>,
    rotations: Vec<RotationEvent>,
}

/// Changes applied to the registry in one atomic write.
#[derive(Debug, Default)]
pub struct RegistryChange {
    pub upserts: Vec<KeyRecord>,
    pub removals: Vec<KeyId>,
    pub rotation: Option<RotationEvent>,
}

impl RegistryChange {
    pub fn upsert(record: KeyRecord) -> Self {
        Self {
            upserts: vec![record],
            ..Self::default()
        }
    }
}

/// Registry contents loaded at open.
#[derive(Debug)]
pub struct LoadedRegistry {
    pub kek_salt: [u8; KEK_SALT_LEN],
    pub keys: Vec<KeyRecord>,
    pub rotations: Vec<RotationEvent>,
}

/// Serialised writer for the key registry file.
#[derive(Debug)]
pub struct KeyStore {
    path: PathBuf,
    state: Mutex<RegistryState>,
}

impl KeyStore {
    /// Open (or initialise) the registry under `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory cannot be created or the
    /// registry file cannot be read or parsed.
    pub async fn open(dir: &Path) -> Result<(Self, LoadedRegistry), StoreError> {
        persist::ensure_private_dir(dir).await?;
        let path = dir.join(REGISTRY_FILE);

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: RegistryFile = serde_json::from_slice(&bytes)?;
                if file.version != REGISTRY_VERSION {
                    return Err(StoreError::Corrupt(format!(
                        "unsupported registry version {}",
                        file.version
                    )));
                }
                let salt = STANDARD
                    .decode(&file.kek_salt)
                    .map_err(|e| StoreError::Corrupt(format!("kek salt: {e}")))?;
                let kek_salt: [u8; KEK_SALT_LEN] = salt
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("kek salt has wrong length".into()))?;
                RegistryState {
                    kek_salt,
                    keys: file.keys.into_iter().map(|r| (r.key.id, r)).collect(),
                    rotations: file.rotations,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "initialising empty key registry");
                let state = RegistryState {
                    kek_salt: random_bytes::<KEK_SALT_LEN>(),
                    keys: BTreeMap::new(),
                    rotations: Vec::new(),
                };
                write_registry(&path, &state).await?;
                state
            }
            Err(e) => return Err(e.into()),
        };

        let loaded = LoadedRegistry {
            kek_salt: state.kek_salt,
            keys: state.keys.values().cloned().collect(),
            rotations: state.rotations.clone(),
        };
        Ok((
            Self {
                path,
                state: Mutex::new(state),
            },
            loaded,
        ))
    }

    /// Apply `change` and rewrite the registry file.
    ///
    /// Either the whole change is persisted and becomes visible, or nothing
    /// changes (on-disk and in-memory state are left as they were).
    pub async fn commit(&self, change: RegistryChange) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        for record in change.upserts {
            next.keys.insert(record.key.id, record);
        }
        for id in &change.removals {
            next.keys.remove(id);
        }
        if let Some(event) = change.rotation {
            next.rotations.push(event);
        }
        write_registry(&self.path, &next).await?;
        *state = next;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn write_registry(path: &Path, state: &RegistryState) -> Result<(), StoreError> {
    let file = RegistryFile {
        version: REGISTRY_VERSION,
        kek_salt: STANDARD.encode(state.kek_salt),
        keys: state.keys.values().cloned().collect(),
        rotations: state.rotations.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&file)?;
    persist::atomic_write(path, &bytes).await?;
    Ok(())
}
