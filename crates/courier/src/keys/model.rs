//! Key metadata, lifecycle status, and rotation records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::KeyId;
use serde::{Deserialize, Serialize};

use super::hardware::Fingerprint;
use super::material::KdfParams;

/// Lifecycle status of a managed key.
///
/// Status only moves forward through `Active → Rotating → Deprecated →
/// Expired`, or to `Revoked` from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Rotating,
    Deprecated,
    Expired,
    Revoked,
}

impl KeyStatus {
    /// `Expired` and `Revoked` keys never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, KeyStatus::Expired | KeyStatus::Revoked)
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    pub fn can_transition_to(self, next: KeyStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            KeyStatus::Revoked => true,
            _ => next.rank() > self.rank(),
        }
    }

    fn rank(self) -> u8 {
        match self {
            KeyStatus::Active => 0,
            KeyStatus::Rotating => 1,
            KeyStatus::Deprecated => 2,
            KeyStatus::Expired => 3,
            KeyStatus::Revoked => 4,
        }
    }
}

/// Metadata describing one managed key. Never contains key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedKey {
    pub id: KeyId,
    /// Free-form purpose label supplied by the caller.
    pub label: String,
    pub status: KeyStatus,
    /// Present only for hardware-bound keys.
    pub fingerprint: Option<Fingerprint>,
    /// The key this one replaced through rotation.
    pub predecessor: Option<KeyId>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deprecated_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
}

impl ManagedKey {
    pub(crate) fn new(context: &KeyContext, fingerprint: Option<Fingerprint>) -> Self {
        Self {
            id: KeyId::new(),
            label: context.label.clone(),
            status: KeyStatus::Active,
            fingerprint,
            predecessor: None,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: context.expires_at,
            deprecated_at: None,
            revoked_at: None,
            revocation_reason: None,
        }
    }

    pub fn is_hardware_bound(&self) -> bool {
        self.fingerprint.is_some()
    }

    /// Whether the explicit expiry timestamp has passed.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Caller-supplied parameters for a new key.
#[derive(Debug, Clone, Default)]
pub struct KeyContext {
    pub label: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// Audit record of one rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub old_key_id: KeyId,
    pub new_key_id: KeyId,
    pub rotated_at: DateTime<Utc>,
    /// Peers or services told about the rotation.
    pub notified: Vec<String>,
}

/// Lifecycle policy applied by the key manager.
#[derive(Debug, Clone)]
pub struct KeyPolicy {
    /// How long a deprecated (or expired) key stays usable for decryption
    /// before it is refused and becomes eligible for purge.
    pub overlap_window: Duration,
    pub kdf: KdfParams,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            overlap_window: Duration::from_secs(24 * 60 * 60),
            kdf: KdfParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward_only() {
        use KeyStatus::*;
        assert!(Active.can_transition_to(Rotating));
        assert!(Active.can_transition_to(Deprecated));
        assert!(Rotating.can_transition_to(Deprecated));
        assert!(Deprecated.can_transition_to(Expired));
        assert!(!Deprecated.can_transition_to(Active));
        assert!(!Rotating.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn revocation_allowed_from_non_terminal_only() {
        use KeyStatus::*;
        assert!(Active.can_transition_to(Revoked));
        assert!(Deprecated.can_transition_to(Revoked));
        assert!(!Expired.can_transition_to(Revoked));
        assert!(!Revoked.can_transition_to(Revoked));
    }

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let key = ManagedKey::new(
            &KeyContext::new("t").with_expiry(now - chrono::Duration::seconds(1)),
            None,
        );
        assert!(key.is_past_expiry(now));
        assert!(!ManagedKey::new(&KeyContext::new("t"), None).is_past_expiry(now));
    }
}
