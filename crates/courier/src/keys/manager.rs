//! [`KeyManager`]: the single owner of key material.
//!
//! Every key lives behind its own async mutex so rotation and revocation of
//! one key serialise without blocking unrelated keys. Lock order is always
//! entry lock, then registry lock; the registry never calls back into an
//! entry. Code holding several entry locks takes them in ascending id order.
//!
//! Revocation is published to a lock-free [`ArcSwap`] set as soon as it is
//! known to apply, before the registry is written, and both
//! [`KeyManager::encrypt_block`] and [`KeyManager::decrypt_block`] consult
//! that set before and after the cipher runs. An operation racing a
//! revocation therefore fails rather than returning output produced under a
//! revoked key.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use common::protocol::{NONCE_LEN, TAG_LEN};
use common::KeyId;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::hardware::{self, Fingerprint, HardwareIdentity};
use super::material::{derive_key, KdfParams, KeyBytes};
use super::model::{KeyContext, KeyPolicy, KeyStatus, ManagedKey, RotationEvent};
use super::store::{KeyRecord, KeyStore, RegistryChange, KEK_SALT_LEN};
use super::KeyError;
use crate::crypto::cipher::{self, random_bytes, SealedBlock, WrappedKey};

/// Per-key salt length for hardware-bound derivation.
const BOUND_SALT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupAction {
    Expire { purge: bool },
    Purge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usage {
    Encrypt,
    Decrypt,
}

impl Usage {
    fn as_str(self) -> &'static str {
        match self {
            Usage::Encrypt => "encryption",
            Usage::Decrypt => "decryption",
        }
    }
}

struct KeyEntry {
    meta: ManagedKey,
    /// Persisted wrapped form, carried so status-only updates keep it.
    wrapped: Option<String>,
    /// `None` when revoked or when the wrap cannot be opened on this machine.
    material: Option<KeyBytes>,
    /// Set once cleanup has removed the key; late holders of the entry must
    /// not write it back.
    purged: bool,
}

impl KeyEntry {
    fn record(&self) -> KeyRecord {
        KeyRecord {
            key: self.meta.clone(),
            wrapped: self.wrapped.clone(),
        }
    }
}

struct Inner {
    keys: RwLock<HashMap<KeyId, Arc<Mutex<KeyEntry>>>>,
    revoked: ArcSwap<HashSet<KeyId>>,
    rotations: Mutex<Vec<RotationEvent>>,
    store: KeyStore,
    kek: KeyBytes,
    /// Fingerprint of this machine at open; `None` if no identifier source
    /// was available.
    fingerprint: Option<Fingerprint>,
    identity: Arc<dyn HardwareIdentity>,
    secret: SecretString,
    policy: KeyPolicy,
}

/// Generates, rotates, revokes, and uses block-encryption keys.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct KeyManager {
    inner: Arc<Inner>,
}

impl KeyManager {
    /// Open the registry under `dir` and load every key usable on this
    /// machine.
    ///
    /// Keys whose wrapped material cannot be opened (for example after the
    /// registry was copied to other hardware) are loaded metadata-only and
    /// refuse every cryptographic use.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Store`] if the registry cannot be read and
    /// [`KeyError::Kdf`] if the key-encryption key cannot be derived.
    pub async fn open(
        dir: impl AsRef<Path>,
        secret: SecretString,
        policy: KeyPolicy,
        identity: Arc<dyn HardwareIdentity>,
    ) -> Result<Self, KeyError> {
        let (store, loaded) = KeyStore::open(dir.as_ref()).await?;

        let fingerprint = match hardware::fingerprint(identity.as_ref()) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!(error = %e, "hardware fingerprint unavailable; hardware-bound keys disabled");
                None
            }
        };

        let kek = derive_kek(&secret, &loaded.kek_salt, fingerprint.as_ref(), policy.kdf).await?;

        let mut keys = HashMap::with_capacity(loaded.keys.len());
        let mut revoked = HashSet::new();
        let mut unavailable = 0usize;
        for record in loaded.keys {
            let id = record.key.id;
            if record.key.status == KeyStatus::Revoked {
                revoked.insert(id);
            }
            let material = match (&record.wrapped, record.key.status) {
                (_, KeyStatus::Revoked) | (None, _) => None,
                (Some(wrapped), _) => match unwrap_material(wrapped, &kek) {
                    Ok(material) => Some(material),
                    Err(e) => {
                        unavailable += 1;
                        debug!(key_id = %id, error = %e, "key material cannot be opened on this machine");
                        None
                    }
                },
            };
            keys.insert(
                id,
                Arc::new(Mutex::new(KeyEntry {
                    meta: record.key,
                    wrapped: record.wrapped,
                    material,
                    purged: false,
                })),
            );
        }

        if unavailable > 0 {
            warn!(unavailable, "some keys are not usable on this machine");
        }
        info!(
            keys = keys.len(),
            revoked = revoked.len(),
            hardware_identity = fingerprint.is_some(),
            "key manager opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                keys: RwLock::new(keys),
                revoked: ArcSwap::from_pointee(revoked),
                rotations: Mutex::new(loaded.rotations),
                store,
                kek,
                fingerprint,
                identity,
                secret,
                policy,
            }),
        })
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Create a key whose material is derived from the license secret and
    /// this machine's hardware fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::HardwareUnavailable`] if no hardware identifier
    /// can be read.
    pub async fn generate_hardware_bound_key(&self, context: KeyContext) -> Result<ManagedKey, KeyError> {
        let fp = hardware::fingerprint(self.inner.identity.as_ref())?;
        let material = self.derive_bound_material(&fp).await?;
        let meta = ManagedKey::new(&context, Some(fp));
        self.insert_new(meta, material).await
    }

    /// Create a key from the OS CSPRNG with no hardware binding.
    pub async fn generate_random_key(&self, context: KeyContext) -> Result<ManagedKey, KeyError> {
        let meta = ManagedKey::new(&context, None);
        self.insert_new(meta, KeyBytes::random()).await
    }

    async fn insert_new(&self, meta: ManagedKey, material: KeyBytes) -> Result<ManagedKey, KeyError> {
        let entry = KeyEntry {
            wrapped: Some(self.wrap(&material)?),
            meta: meta.clone(),
            material: Some(material),
            purged: false,
        };
        self.inner
            .store
            .commit(RegistryChange::upsert(entry.record()))
            .await?;
        self.inner
            .keys
            .write()
            .await
            .insert(meta.id, Arc::new(Mutex::new(entry)));
        info!(
            key_id = %meta.id,
            label = %meta.label,
            hardware_bound = meta.is_hardware_bound(),
            "key generated"
        );
        Ok(meta)
    }

    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    /// Whether the current machine matches the fingerprint recorded for
    /// `key_id`. Keys without a binding always validate.
    ///
    /// A machine whose fingerprint cannot be computed does not match.
    pub async fn validate_hardware_binding(&self, key_id: KeyId) -> Result<bool, KeyError> {
        let entry = self.entry(key_id).await?;
        let Some(bound) = entry.lock().await.meta.fingerprint.clone() else {
            return Ok(true);
        };
        match hardware::fingerprint(self.inner.identity.as_ref()) {
            Ok(current) => {
                let matches = current == bound;
                if !matches {
                    warn!(key_id = %key_id, "hardware binding mismatch");
                }
                Ok(matches)
            }
            Err(e) => {
                warn!(key_id = %key_id, error = %e, "cannot validate hardware binding");
                Ok(false)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rotation
    // -----------------------------------------------------------------------

    /// Replace `old_key_id` with a new key of the same kind.
    ///
    /// The new key is `Active` with `predecessor = old_key_id`; the old key
    /// becomes `Deprecated` and keeps decrypting for the overlap window. Both
    /// records and the audit event land in one registry write.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::RotationFailed`] if the old key is not `Active` or
    /// any step fails. The old key's status is then left exactly as it was.
    pub async fn rotate_key(
        &self,
        old_key_id: KeyId,
        context: KeyContext,
        notify: &[String],
    ) -> Result<ManagedKey, KeyError> {
        let failed = |reason: String| KeyError::RotationFailed {
            key_id: old_key_id,
            reason,
        };

        let entry = self.entry(old_key_id).await.map_err(|e| failed(e.to_string()))?;
        let mut old = entry.lock().await;
        if old.purged {
            return Err(failed(KeyError::NotFound(old_key_id).to_string()));
        }
        if self.is_revoked(old_key_id) || old.meta.status != KeyStatus::Active {
            let status = if self.is_revoked(old_key_id) {
                KeyStatus::Revoked
            } else {
                old.meta.status
            };
            return Err(failed(format!("key is {status:?}, only active keys rotate")));
        }

        let previous = old.meta.status;
        old.meta.status = KeyStatus::Rotating;

        match self.complete_rotation(&old, &context, notify).await {
            Ok((successor, deprecated, event)) => {
                old.meta = deprecated;
                let new_meta = successor.meta.clone();
                self.inner
                    .keys
                    .write()
                    .await
                    .insert(new_meta.id, Arc::new(Mutex::new(successor)));
                self.inner.rotations.lock().await.push(event);
                info!(
                    old_key_id = %old_key_id,
                    new_key_id = %new_meta.id,
                    notified = notify.len(),
                    "key rotated"
                );
                Ok(new_meta)
            }
            Err(e) => {
                old.meta.status = previous;
                warn!(key_id = %old_key_id, error = %e, "key rotation failed; key left unchanged");
                Err(failed(e.to_string()))
            }
        }
    }

    async fn complete_rotation(
        &self,
        old: &KeyEntry,
        context: &KeyContext,
        notify: &[String],
    ) -> Result<(KeyEntry, ManagedKey, RotationEvent), KeyError> {
        let (material, fingerprint) = if old.meta.is_hardware_bound() {
            let fp = hardware::fingerprint(self.inner.identity.as_ref())?;
            (self.derive_bound_material(&fp).await?, Some(fp))
        } else {
            (KeyBytes::random(), None)
        };

        let mut meta = ManagedKey::new(context, fingerprint);
        meta.predecessor = Some(old.meta.id);
        let successor = KeyEntry {
            wrapped: Some(self.wrap(&material)?),
            meta,
            material: Some(material),
            purged: false,
        };

        let now = Utc::now();
        let mut deprecated = old.meta.clone();
        deprecated.status = KeyStatus::Deprecated;
        deprecated.deprecated_at = Some(now);

        let event = RotationEvent {
            old_key_id: old.meta.id,
            new_key_id: successor.meta.id,
            rotated_at: now,
            notified: notify.to_vec(),
        };

        self.inner
            .store
            .commit(RegistryChange {
                upserts: vec![
                    successor.record(),
                    KeyRecord {
                        key: deprecated.clone(),
                        wrapped: old.wrapped.clone(),
                    },
                ],
                removals: Vec::new(),
                rotation: Some(event.clone()),
            })
            .await?;

        Ok((successor, deprecated, event))
    }

    // -----------------------------------------------------------------------
    // Revocation
    // -----------------------------------------------------------------------

    /// Revoke `key_id` immediately and zero its material.
    ///
    /// Returns `Ok(false)` if the key was already revoked or has already
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotFound`] for an unknown key and
    /// [`KeyError::Store`] if the revocation cannot be persisted. In the
    /// latter case the key is still refused for the rest of this process.
    pub async fn revoke_key(&self, key_id: KeyId, reason: &str) -> Result<bool, KeyError> {
        let entry = self.entry(key_id).await?;
        let mut guard = entry.lock().await;
        if guard.purged {
            return Err(KeyError::NotFound(key_id));
        }
        if !guard.meta.status.can_transition_to(KeyStatus::Revoked) {
            debug!(key_id = %key_id, status = ?guard.meta.status, "revocation is a no-op");
            return Ok(false);
        }

        // Publish before persisting so in-flight operations observe it.
        self.publish_revocation(key_id);

        let mut meta = guard.meta.clone();
        meta.status = KeyStatus::Revoked;
        meta.revoked_at = Some(Utc::now());
        meta.revocation_reason = Some(reason.to_owned());

        // Dropping the buffer zeroes it.
        guard.material = None;
        guard.wrapped = None;
        guard.meta = meta.clone();

        self.inner
            .store
            .commit(RegistryChange::upsert(KeyRecord { key: meta, wrapped: None }))
            .await?;
        warn!(key_id = %key_id, reason, "key revoked");
        Ok(true)
    }

    pub fn is_revoked(&self, key_id: KeyId) -> bool {
        self.inner.revoked.load().contains(&key_id)
    }

    fn publish_revocation(&self, key_id: KeyId) {
        self.inner.revoked.rcu(|set| {
            let mut next = (**set).clone();
            next.insert(key_id);
            next
        });
    }

    // -----------------------------------------------------------------------
    // Retirement
    // -----------------------------------------------------------------------

    /// Retire an `Active` key that is no longer needed for new encryption.
    ///
    /// The key becomes `Deprecated` without a successor, keeps decrypting for
    /// the overlap window, and is then purged by cleanup. Returns `Ok(false)`
    /// if the key was not `Active`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotFound`] for an unknown key and
    /// [`KeyError::Store`] if the change cannot be persisted; the key is
    /// then left `Active`.
    pub async fn retire_key(&self, key_id: KeyId) -> Result<bool, KeyError> {
        let entry = self.entry(key_id).await?;
        let mut guard = entry.lock().await;
        if guard.purged {
            return Err(KeyError::NotFound(key_id));
        }
        if guard.meta.status != KeyStatus::Active || self.is_revoked(key_id) {
            return Ok(false);
        }

        let mut meta = guard.meta.clone();
        meta.status = KeyStatus::Deprecated;
        meta.deprecated_at = Some(Utc::now());
        self.inner
            .store
            .commit(RegistryChange::upsert(KeyRecord {
                key: meta.clone(),
                wrapped: guard.wrapped.clone(),
            }))
            .await?;
        guard.meta = meta;
        info!(key_id = %key_id, "key retired");
        Ok(true)
    }

    /// Fail unless `key_id` may be assigned to new work: it must exist, be
    /// `Active`, and not be revoked.
    pub async fn ensure_assignable(&self, key_id: KeyId) -> Result<(), KeyError> {
        self.ensure_not_revoked(key_id)?;
        let entry = self.entry(key_id).await?;
        let guard = entry.lock().await;
        match guard.meta.status {
            _ if guard.purged => Err(KeyError::NotFound(key_id)),
            KeyStatus::Active if guard.meta.is_past_expiry(Utc::now()) => Err(KeyError::Expired(key_id)),
            KeyStatus::Active => Ok(()),
            KeyStatus::Revoked => Err(KeyError::Revoked(key_id)),
            KeyStatus::Expired => Err(KeyError::Expired(key_id)),
            status => Err(KeyError::NotUsable {
                key_id,
                status,
                usage: "new sessions",
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Expire keys past their expiry timestamp and purge retired keys whose
    /// overlap window has elapsed. Revoked keys are kept as tombstones.
    ///
    /// Returns the number of keys purged.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Store`] if the registry write fails; nothing is
    /// changed in that case.
    pub async fn cleanup_expired_keys(&self) -> Result<usize, KeyError> {
        let now = Utc::now();
        let mut entries: Vec<(KeyId, Arc<Mutex<KeyEntry>>)> = self
            .inner
            .keys
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        // Cheap scan first; only candidates are locked together below.
        let mut candidates = Vec::new();
        for (id, entry) in entries.drain(..) {
            let guard = entry.lock().await;
            if self.cleanup_action(&guard, now).is_some() {
                drop(guard);
                candidates.push((id, entry));
            }
        }
        if candidates.is_empty() {
            return Ok(0);
        }
        candidates.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(candidates.len());
        for (id, entry) in &candidates {
            guards.push((*id, entry.lock().await));
        }

        // Decide again under the locks: a key may have been revoked, rotated
        // or purged since the scan.
        let mut change = RegistryChange::default();
        let mut expire = Vec::new();
        for (id, guard) in &guards {
            match self.cleanup_action(guard, now) {
                Some(CleanupAction::Expire { purge }) => {
                    let mut meta = guard.meta.clone();
                    meta.status = KeyStatus::Expired;
                    expire.push(*id);
                    if purge {
                        change.removals.push(*id);
                    } else {
                        change.upserts.push(KeyRecord {
                            key: meta,
                            wrapped: guard.wrapped.clone(),
                        });
                    }
                }
                Some(CleanupAction::Purge) => change.removals.push(*id),
                None => {}
            }
        }
        if change.upserts.is_empty() && change.removals.is_empty() {
            return Ok(0);
        }
        let purged = change.removals.clone();
        self.inner.store.commit(change).await?;

        for (id, guard) in &mut guards {
            if expire.contains(id) {
                guard.meta.status = KeyStatus::Expired;
            }
            if purged.contains(id) {
                // Dropping the buffer zeroes it.
                guard.material = None;
                guard.purged = true;
            }
        }
        if !purged.is_empty() {
            let mut keys = self.inner.keys.write().await;
            for id in &purged {
                keys.remove(id);
                debug!(key_id = %id, "retired key purged");
            }
        }
        drop(guards);

        if !expire.is_empty() {
            info!(expired = expire.len(), "keys expired");
        }
        Ok(purged.len())
    }

    fn cleanup_action(&self, entry: &KeyEntry, now: DateTime<Utc>) -> Option<CleanupAction> {
        if entry.purged || self.is_revoked(entry.meta.id) {
            return None;
        }
        let meta = &entry.meta;
        let expires = matches!(meta.status, KeyStatus::Active | KeyStatus::Deprecated) && meta.is_past_expiry(now);
        let status = if expires { KeyStatus::Expired } else { meta.status };
        let retired_at = match status {
            KeyStatus::Deprecated => meta.deprecated_at,
            KeyStatus::Expired => meta.expires_at,
            _ => None,
        };
        let purge = retired_at.is_some_and(|at| !self.within_overlap(at, now));
        match (expires, purge) {
            (true, purge) => Some(CleanupAction::Expire { purge }),
            (false, true) => Some(CleanupAction::Purge),
            (false, false) => None,
        }
    }

    // -----------------------------------------------------------------------
    // Use
    // -----------------------------------------------------------------------

    /// Encrypt `plaintext` under `key_id`.
    ///
    /// A deprecated key keeps encrypting for the work that already holds it
    /// until its overlap window elapses; [`KeyManager::ensure_assignable`]
    /// keeps it out of new work.
    ///
    /// # Errors
    ///
    /// Refuses keys that are revoked, expired, past their overlap window,
    /// bound to other hardware, or whose material is not loaded.
    pub async fn encrypt_block(
        &self,
        key_id: KeyId,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<SealedBlock, KeyError> {
        self.with_material(key_id, Usage::Encrypt, |key| {
            Ok(cipher::encrypt_block(key.as_bytes(), nonce, plaintext)?)
        })
        .await
    }

    /// Decrypt and authenticate a block sealed under `key_id`.
    ///
    /// Deprecated keys decrypt until their overlap window elapses.
    pub async fn decrypt_block(
        &self,
        key_id: KeyId,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<Vec<u8>, KeyError> {
        let plaintext = self
            .with_material(key_id, Usage::Decrypt, |key| {
                Ok(Zeroizing::new(cipher::decrypt_block(key.as_bytes(), nonce, ciphertext, tag)?))
            })
            .await?;
        Ok(plaintext.to_vec())
    }

    /// Run `op` on the key's material, then re-check revocation so a
    /// revocation published while `op` ran discards its output.
    async fn with_material<T>(
        &self,
        key_id: KeyId,
        usage: Usage,
        op: impl FnOnce(&KeyBytes) -> Result<T, KeyError>,
    ) -> Result<T, KeyError> {
        let output = {
            let key = self.usable_material(key_id, usage).await?;
            op(&key)?
        };
        self.ensure_not_revoked(key_id)?;
        Ok(output)
    }

    async fn usable_material(&self, key_id: KeyId, usage: Usage) -> Result<KeyBytes, KeyError> {
        self.ensure_not_revoked(key_id)?;
        let entry = self.entry(key_id).await?;
        let mut guard = entry.lock().await;
        if guard.purged {
            return Err(KeyError::NotFound(key_id));
        }
        let now = Utc::now();

        if let Some(bound) = &guard.meta.fingerprint {
            if self.inner.fingerprint.as_ref() != Some(bound) {
                return Err(KeyError::HardwareMismatch(key_id));
            }
        }

        // Expiry takes effect at use time; cleanup persists it later.
        if matches!(guard.meta.status, KeyStatus::Active | KeyStatus::Deprecated)
            && guard.meta.is_past_expiry(now)
        {
            guard.meta.status = KeyStatus::Expired;
        }

        let meta = &guard.meta;
        match (meta.status, usage) {
            (KeyStatus::Active | KeyStatus::Rotating, _) => {}
            (KeyStatus::Revoked, _) => return Err(KeyError::Revoked(key_id)),
            (KeyStatus::Expired, Usage::Encrypt) => return Err(KeyError::Expired(key_id)),
            (KeyStatus::Deprecated, _) => {
                if !meta.deprecated_at.is_some_and(|at| self.within_overlap(at, now)) {
                    debug!(key_id = %key_id, usage = usage.as_str(), "deprecated key past its overlap window");
                    return Err(KeyError::Expired(key_id));
                }
            }
            (KeyStatus::Expired, Usage::Decrypt) => {
                if !meta.expires_at.is_some_and(|at| self.within_overlap(at, now)) {
                    return Err(KeyError::Expired(key_id));
                }
            }
        }

        let material = guard
            .material
            .clone()
            .ok_or(KeyError::MaterialUnavailable(key_id))?;
        guard.meta.last_used_at = Some(now);
        Ok(material)
    }

    fn ensure_not_revoked(&self, key_id: KeyId) -> Result<(), KeyError> {
        if self.is_revoked(key_id) {
            Err(KeyError::Revoked(key_id))
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_key(&self, key_id: KeyId) -> Option<ManagedKey> {
        let entry = self.entry(key_id).await.ok()?;
        let meta = entry.lock().await.meta.clone();
        Some(meta)
    }

    /// Metadata of every key, oldest first.
    pub async fn list_keys(&self) -> Vec<ManagedKey> {
        let entries: Vec<_> = self.inner.keys.read().await.values().cloned().collect();
        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            keys.push(entry.lock().await.meta.clone());
        }
        keys.sort_by_key(|k| k.created_at);
        keys
    }

    /// `key_id` followed by each predecessor still present in the registry.
    pub async fn lineage(&self, key_id: KeyId) -> Vec<ManagedKey> {
        let mut chain = Vec::new();
        let mut next = Some(key_id);
        while let Some(id) = next {
            let Some(meta) = self.get_key(id).await else {
                break;
            };
            if chain.iter().any(|k: &ManagedKey| k.id == meta.id) {
                break;
            }
            next = meta.predecessor;
            chain.push(meta);
        }
        chain
    }

    pub async fn rotation_events(&self) -> Vec<RotationEvent> {
        self.inner.rotations.lock().await.clone()
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.inner.policy
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn entry(&self, key_id: KeyId) -> Result<Arc<Mutex<KeyEntry>>, KeyError> {
        self.inner
            .keys
            .read()
            .await
            .get(&key_id)
            .cloned()
            .ok_or(KeyError::NotFound(key_id))
    }

    fn wrap(&self, material: &KeyBytes) -> Result<String, KeyError> {
        Ok(WrappedKey::seal(material.as_bytes(), self.inner.kek.as_bytes())?.to_string_repr())
    }

    fn within_overlap(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.inner.policy.overlap_window)
            .unwrap_or(chrono::Duration::MAX);
        since
            .checked_add_signed(window)
            .map_or(true, |deadline| now < deadline)
    }

    async fn derive_bound_material(&self, fp: &Fingerprint) -> Result<KeyBytes, KeyError> {
        let mut salt = random_bytes::<BOUND_SALT_LEN>().to_vec();
        salt.extend_from_slice(fp.as_str().as_bytes());
        derive_blocking(&self.inner.secret, salt, self.inner.policy.kdf).await
    }
}

async fn derive_kek(
    secret: &SecretString,
    kek_salt: &[u8; KEK_SALT_LEN],
    fingerprint: Option<&Fingerprint>,
    params: KdfParams,
) -> Result<KeyBytes, KeyError> {
    let mut salt = kek_salt.to_vec();
    if let Some(fp) = fingerprint {
        salt.extend_from_slice(fp.as_str().as_bytes());
    }
    derive_blocking(secret, salt, params).await
}

/// Run Argon2id on the blocking pool.
async fn derive_blocking(
    secret: &SecretString,
    salt: Vec<u8>,
    params: KdfParams,
) -> Result<KeyBytes, KeyError> {
    let secret = Zeroizing::new(secret.expose_secret().as_bytes().to_vec());
    tokio::task::spawn_blocking(move || derive_key(&secret, &salt, &params))
        .await
        .map_err(|e| KeyError::Kdf(format!("derivation task failed: {e}")))?
}

fn unwrap_material(wrapped: &str, kek: &KeyBytes) -> Result<KeyBytes, KeyError> {
    let opened = WrappedKey::parse(wrapped)?.open(kek.as_bytes())?;
    KeyBytes::from_slice(&opened)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::keys::hardware::{HardwareIdentifier, StaticIdentity};
    use crate::keys::material::test_kdf;

    fn machine(name: &str) -> Arc<dyn HardwareIdentity> {
        Arc::new(StaticIdentity::new([("machine_id", name), ("processor", "test-cpu")]))
    }

    fn policy(overlap: Duration) -> KeyPolicy {
        KeyPolicy {
            overlap_window: overlap,
            kdf: test_kdf(),
        }
    }

    async fn open_with(dir: &Path, identity: Arc<dyn HardwareIdentity>, overlap: Duration) -> KeyManager {
        KeyManager::open(
            dir,
            SecretString::new("license-0001".into()),
            policy(overlap),
            identity,
        )
        .await
        .unwrap()
    }

    async fn open(dir: &Path) -> KeyManager {
        open_with(dir, machine("machine-a"), Duration::from_secs(3600)).await
    }

    /// Identity whose identifiers can be switched off mid-test.
    struct Switchable {
        available: AtomicBool,
    }

    impl HardwareIdentity for Switchable {
        fn identifiers(&self) -> Vec<HardwareIdentifier> {
            if self.available.load(Ordering::SeqCst) {
                vec![HardwareIdentifier::new("machine_id", "switchable")]
            } else {
                Vec::new()
            }
        }
    }

    const NONCE: [u8; NONCE_LEN] = [7u8; NONCE_LEN];

    #[tokio::test]
    async fn random_key_encrypts_and_decrypts() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let key = keys.generate_random_key(KeyContext::new("blocks")).await.unwrap();
        assert_eq!(key.status, KeyStatus::Active);
        assert!(!key.is_hardware_bound());

        let sealed = keys.encrypt_block(key.id, &NONCE, b"block payload").await.unwrap();
        let plain = keys
            .decrypt_block(key.id, &NONCE, &sealed.ciphertext, &sealed.tag)
            .await
            .unwrap();
        assert_eq!(plain, b"block payload");
        assert!(keys.get_key(key.id).await.unwrap().last_used_at.is_some());
    }

    #[tokio::test]
    async fn hardware_binding_validates_only_on_origin_machine() {
        let dir = tempfile::tempdir().unwrap();
        let on_a = open(dir.path()).await;
        let key = on_a
            .generate_hardware_bound_key(KeyContext::new("bound"))
            .await
            .unwrap();
        assert!(key.is_hardware_bound());
        assert!(on_a.validate_hardware_binding(key.id).await.unwrap());
        drop(on_a);

        let on_b = open_with(dir.path(), machine("machine-b"), Duration::from_secs(3600)).await;
        assert!(!on_b.validate_hardware_binding(key.id).await.unwrap());
        let err = on_b.encrypt_block(key.id, &NONCE, b"x").await.unwrap_err();
        assert!(matches!(err, KeyError::HardwareMismatch(id) if id == key.id));
    }

    #[tokio::test]
    async fn hardware_bound_generation_needs_an_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open_with(
            dir.path(),
            Arc::new(StaticIdentity::default()),
            Duration::from_secs(60),
        )
        .await;
        let err = keys
            .generate_hardware_bound_key(KeyContext::new("bound"))
            .await
            .unwrap_err();
        assert!(matches!(err, KeyError::HardwareUnavailable(_)));
        // Random keys still work without a fingerprint.
        assert!(keys.generate_random_key(KeyContext::new("r")).await.is_ok());
    }

    #[tokio::test]
    async fn rotation_keeps_predecessor_decrypting_within_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let old = keys.generate_random_key(KeyContext::new("v1")).await.unwrap();
        let sealed = keys.encrypt_block(old.id, &NONCE, b"issued before rotation").await.unwrap();

        let new = keys
            .rotate_key(old.id, KeyContext::new("v2"), &["sink-a".to_string()])
            .await
            .unwrap();
        assert_eq!(new.status, KeyStatus::Active);
        assert_eq!(new.predecessor, Some(old.id));
        assert!(!new.is_hardware_bound());

        let old_now = keys.get_key(old.id).await.unwrap();
        assert_eq!(old_now.status, KeyStatus::Deprecated);
        assert!(old_now.deprecated_at.is_some());

        let plain = keys
            .decrypt_block(old.id, &NONCE, &sealed.ciphertext, &sealed.tag)
            .await
            .unwrap();
        assert_eq!(plain, b"issued before rotation");

        // Work already holding the old key may keep encrypting under it,
        // but it cannot be handed to new work.
        assert!(keys.encrypt_block(old.id, &NONCE, b"new data").await.is_ok());
        assert!(matches!(
            keys.ensure_assignable(old.id).await,
            Err(KeyError::NotUsable { status: KeyStatus::Deprecated, .. })
        ));
        assert!(keys.ensure_assignable(new.id).await.is_ok());

        let lineage: Vec<KeyId> = keys.lineage(new.id).await.iter().map(|k| k.id).collect();
        assert_eq!(lineage, vec![new.id, old.id]);

        let events = keys.rotation_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_key_id, old.id);
        assert_eq!(events[0].new_key_id, new.id);
        assert_eq!(events[0].notified, vec!["sink-a".to_string()]);
    }

    #[tokio::test]
    async fn rotating_a_bound_key_yields_a_bound_key() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let old = keys
            .generate_hardware_bound_key(KeyContext::new("bound"))
            .await
            .unwrap();
        let new = keys.rotate_key(old.id, KeyContext::new("bound-2"), &[]).await.unwrap();
        assert_eq!(new.fingerprint, old.fingerprint);
    }

    #[tokio::test]
    async fn elapsed_overlap_refuses_decryption() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open_with(dir.path(), machine("machine-a"), Duration::ZERO).await;
        let old = keys.generate_random_key(KeyContext::new("v1")).await.unwrap();
        let sealed = keys.encrypt_block(old.id, &NONCE, b"data").await.unwrap();
        keys.rotate_key(old.id, KeyContext::new("v2"), &[]).await.unwrap();

        let err = keys
            .decrypt_block(old.id, &NONCE, &sealed.ciphertext, &sealed.tag)
            .await
            .unwrap_err();
        assert!(matches!(err, KeyError::Expired(id) if id == old.id));
    }

    #[tokio::test]
    async fn elapsed_overlap_refuses_encryption_with_deprecated_key() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open_with(dir.path(), machine("machine-a"), Duration::ZERO).await;
        let old = keys.generate_random_key(KeyContext::new("v1")).await.unwrap();
        keys.rotate_key(old.id, KeyContext::new("v2"), &[]).await.unwrap();
        assert!(matches!(
            keys.encrypt_block(old.id, &NONCE, b"x").await,
            Err(KeyError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn expired_key_refuses_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let key = keys
            .generate_random_key(
                KeyContext::new("short").with_expiry(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        let err = keys.encrypt_block(key.id, &NONCE, b"x").await.unwrap_err();
        assert!(matches!(err, KeyError::Expired(_)));
    }

    #[tokio::test]
    async fn rotating_a_revoked_key_fails_and_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let key = keys.generate_random_key(KeyContext::new("k")).await.unwrap();
        assert!(keys.revoke_key(key.id, "compromised").await.unwrap());

        let err = keys.rotate_key(key.id, KeyContext::new("k2"), &[]).await.unwrap_err();
        assert!(matches!(err, KeyError::RotationFailed { key_id, .. } if key_id == key.id));
        assert_eq!(keys.get_key(key.id).await.unwrap().status, KeyStatus::Revoked);
        assert_eq!(keys.list_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_rotation_restores_active_status() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(Switchable {
            available: AtomicBool::new(true),
        });
        let keys = open_with(dir.path(), identity.clone(), Duration::from_secs(60)).await;
        let key = keys
            .generate_hardware_bound_key(KeyContext::new("bound"))
            .await
            .unwrap();

        identity.available.store(false, Ordering::SeqCst);
        let err = keys.rotate_key(key.id, KeyContext::new("next"), &[]).await.unwrap_err();
        assert!(matches!(err, KeyError::RotationFailed { .. }));

        assert_eq!(keys.get_key(key.id).await.unwrap().status, KeyStatus::Active);
        assert_eq!(keys.list_keys().await.len(), 1);
        assert!(keys.rotation_events().await.is_empty());

        // Nothing reached the registry either.
        identity.available.store(true, Ordering::SeqCst);
        let reopened = open_with(dir.path(), identity, Duration::from_secs(60)).await;
        let stored = reopened.list_keys().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn revocation_blocks_all_use_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let key = keys.generate_random_key(KeyContext::new("k")).await.unwrap();
        let sealed = keys.encrypt_block(key.id, &NONCE, b"data").await.unwrap();

        assert!(keys.revoke_key(key.id, "leaked").await.unwrap());
        assert!(!keys.revoke_key(key.id, "again").await.unwrap());
        assert!(keys.is_revoked(key.id));

        assert!(matches!(
            keys.encrypt_block(key.id, &NONCE, b"x").await,
            Err(KeyError::Revoked(_))
        ));
        assert!(matches!(
            keys.decrypt_block(key.id, &NONCE, &sealed.ciphertext, &sealed.tag).await,
            Err(KeyError::Revoked(_))
        ));

        let meta = keys.get_key(key.id).await.unwrap();
        assert_eq!(meta.revocation_reason.as_deref(), Some("leaked"));
        drop(keys);

        let reopened = open(dir.path()).await;
        assert!(reopened.is_revoked(key.id));
        assert!(matches!(
            reopened.encrypt_block(key.id, &NONCE, b"x").await,
            Err(KeyError::Revoked(_))
        ));
    }

    #[tokio::test]
    async fn revoking_an_expired_key_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let key = keys
            .generate_random_key(
                KeyContext::new("short").with_expiry(Utc::now() + chrono::Duration::milliseconds(200)),
            )
            .await
            .unwrap();
        let sealed = keys.encrypt_block(key.id, &NONCE, b"before expiry").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        keys.cleanup_expired_keys().await.unwrap();
        assert_eq!(keys.get_key(key.id).await.unwrap().status, KeyStatus::Expired);

        assert!(!keys.revoke_key(key.id, "late").await.unwrap());
        assert!(!keys.is_revoked(key.id));
        assert_eq!(
            keys.decrypt_block(key.id, &NONCE, &sealed.ciphertext, &sealed.tag)
                .await
                .unwrap(),
            b"before expiry"
        );
    }

    #[tokio::test]
    async fn revocation_published_mid_operation_discards_output() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let key = keys.generate_random_key(KeyContext::new("k")).await.unwrap();
        let sealed = keys.encrypt_block(key.id, &NONCE, b"data").await.unwrap();

        let result = keys
            .with_material(key.id, Usage::Decrypt, |material| {
                // A concurrent revoke_key publishes while the cipher runs.
                keys.publish_revocation(key.id);
                Ok(cipher::decrypt_block(
                    material.as_bytes(),
                    &NONCE,
                    &sealed.ciphertext,
                    &sealed.tag,
                )?)
            })
            .await;
        assert!(matches!(result, Err(KeyError::Revoked(id)) if id == key.id));

        let result = keys
            .with_material(key.id, Usage::Encrypt, |_| Ok(()))
            .await;
        assert!(matches!(result, Err(KeyError::Revoked(_))));
    }

    #[tokio::test]
    async fn retired_key_decrypts_until_purged() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open_with(dir.path(), machine("machine-a"), Duration::from_millis(200)).await;
        let key = keys.generate_random_key(KeyContext::new("transfer")).await.unwrap();
        let sealed = keys.encrypt_block(key.id, &NONCE, b"shard").await.unwrap();

        assert!(keys.retire_key(key.id).await.unwrap());
        assert!(!keys.retire_key(key.id).await.unwrap());
        let meta = keys.get_key(key.id).await.unwrap();
        assert_eq!(meta.status, KeyStatus::Deprecated);
        assert!(meta.predecessor.is_none());
        assert!(keys.ensure_assignable(key.id).await.is_err());
        assert_eq!(
            keys.decrypt_block(key.id, &NONCE, &sealed.ciphertext, &sealed.tag)
                .await
                .unwrap(),
            b"shard"
        );

        assert_eq!(keys.cleanup_expired_keys().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(keys.cleanup_expired_keys().await.unwrap(), 1);
        assert!(keys.get_key(key.id).await.is_none());
    }

    #[tokio::test]
    async fn purged_entry_is_never_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open_with(dir.path(), machine("machine-a"), Duration::ZERO).await;
        let old = keys.generate_random_key(KeyContext::new("v1")).await.unwrap();
        keys.rotate_key(old.id, KeyContext::new("v2"), &[]).await.unwrap();

        // A caller that looked the entry up before cleanup ran.
        let stale = keys.entry(old.id).await.unwrap();
        let (purged, revoked) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(keys.cleanup_expired_keys(), keys.revoke_key(old.id, "race"))
        })
        .await
        .expect("cleanup and revocation must not deadlock");
        purged.unwrap();

        match revoked {
            // Revocation won the race: the tombstone is kept.
            Ok(true) => assert_eq!(keys.get_key(old.id).await.unwrap().status, KeyStatus::Revoked),
            // Cleanup won: the key is gone and stays gone.
            Err(KeyError::NotFound(_)) => {
                assert!(stale.lock().await.purged);
                assert!(keys.get_key(old.id).await.is_none());
                drop(keys);
                let reopened = open_with(dir.path(), machine("machine-a"), Duration::ZERO).await;
                assert!(reopened.get_key(old.id).await.is_none());
            }
            other => panic!("unexpected revocation result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn revoking_unknown_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        assert!(matches!(
            keys.revoke_key(KeyId::new(), "x").await,
            Err(KeyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn keys_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let random = keys.generate_random_key(KeyContext::new("r")).await.unwrap();
        let bound = keys
            .generate_hardware_bound_key(KeyContext::new("b"))
            .await
            .unwrap();
        let a = keys.encrypt_block(random.id, &NONCE, b"one").await.unwrap();
        let b = keys.encrypt_block(bound.id, &NONCE, b"two").await.unwrap();
        drop(keys);

        let reopened = open(dir.path()).await;
        assert_eq!(
            reopened.decrypt_block(random.id, &NONCE, &a.ciphertext, &a.tag).await.unwrap(),
            b"one"
        );
        assert_eq!(
            reopened.decrypt_block(bound.id, &NONCE, &b.ciphertext, &b.tag).await.unwrap(),
            b"two"
        );
    }

    #[tokio::test]
    async fn wrong_secret_cannot_use_stored_keys() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let key = keys.generate_random_key(KeyContext::new("r")).await.unwrap();
        drop(keys);

        let other = KeyManager::open(
            dir.path(),
            SecretString::new("another-license".into()),
            policy(Duration::from_secs(60)),
            machine("machine-a"),
        )
        .await
        .unwrap();
        assert!(matches!(
            other.encrypt_block(key.id, &NONCE, b"x").await,
            Err(KeyError::MaterialUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn registry_stores_only_wrapped_material() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        keys.generate_random_key(KeyContext::new("r")).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("keys.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let record = &json["keys"][0];
        assert!(record["wrapped"].as_str().unwrap().starts_with("v1."));
        assert!(record.get("material").is_none());
    }

    #[tokio::test]
    async fn cleanup_purges_retired_keys_but_keeps_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open_with(dir.path(), machine("machine-a"), Duration::ZERO).await;
        let old = keys.generate_random_key(KeyContext::new("v1")).await.unwrap();
        let new = keys.rotate_key(old.id, KeyContext::new("v2"), &[]).await.unwrap();
        let expired = keys
            .generate_random_key(
                KeyContext::new("short").with_expiry(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        let revoked = keys.generate_random_key(KeyContext::new("bad")).await.unwrap();
        keys.revoke_key(revoked.id, "test").await.unwrap();

        assert_eq!(keys.cleanup_expired_keys().await.unwrap(), 2);
        assert!(keys.get_key(old.id).await.is_none());
        assert!(keys.get_key(expired.id).await.is_none());
        assert!(keys.get_key(new.id).await.is_some());
        assert!(keys.get_key(revoked.id).await.is_some());

        assert_eq!(keys.cleanup_expired_keys().await.unwrap(), 0);
        drop(keys);
        let reopened = open(dir.path()).await;
        assert_eq!(reopened.list_keys().await.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_keeps_keys_inside_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let old = keys.generate_random_key(KeyContext::new("v1")).await.unwrap();
        keys.rotate_key(old.id, KeyContext::new("v2"), &[]).await.unwrap();
        assert_eq!(keys.cleanup_expired_keys().await.unwrap(), 0);
        assert!(keys.get_key(old.id).await.is_some());
    }

    #[tokio::test]
    async fn concurrent_rotate_and_revoke_serialise() {
        let dir = tempfile::tempdir().unwrap();
        let keys = open(dir.path()).await;
        let key = keys.generate_random_key(KeyContext::new("k")).await.unwrap();

        let (rotated, revoked) = tokio::join!(
            keys.rotate_key(key.id, KeyContext::new("k2"), &[]),
            keys.revoke_key(key.id, "race"),
        );
        assert!(revoked.unwrap());
        assert_eq!(keys.get_key(key.id).await.unwrap().status, KeyStatus::Revoked);

        let successors: Vec<ManagedKey> = keys
            .list_keys()
            .await
            .into_iter()
            .filter(|k| k.predecessor == Some(key.id))
            .collect();
        match rotated {
            Ok(new) => {
                assert_eq!(successors.len(), 1);
                assert_eq!(successors[0].id, new.id);
                assert_eq!(successors[0].status, KeyStatus::Active);
            }
            Err(e) => {
                assert!(matches!(e, KeyError::RotationFailed { .. }));
                assert!(successors.is_empty());
            }
        }
    }
}
