//! Error taxonomy shared by the key manager, the block codec, and the
//! transfer manager.
//!
//! Every failure surfaced to callers maps onto a [`FailureKind`]:
//! - [`FailureKind::Transport`] and [`FailureKind::Integrity`] are transient
//!   and retried under the per-block backoff policy.
//! - Key-lifecycle kinds ([`FailureKind::HardwareMismatch`],
//!   [`FailureKind::KeyRevoked`], [`FailureKind::KeyExpired`],
//!   [`FailureKind::KeyUnavailable`]) reflect a policy decision and are never
//!   retried.
//! - [`FailureKind::RetriesExhausted`] is the block-level terminal failure
//!   that fails the whole session.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::KeyId;

/// Classification of a failure, stable across the wire and in persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Integrity,
    HardwareMismatch,
    HardwareUnavailable,
    KeyRevoked,
    KeyExpired,
    KeyUnavailable,
    RotationFailed,
    RetriesExhausted,
    Cancelled,
    Internal,
}

impl FailureKind {
    /// Returns `true` for faults worth another attempt after a backoff delay.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transport | FailureKind::Integrity)
    }

    /// Returns `true` for failures caused by key policy rather than a fault.
    pub fn is_key_policy(self) -> bool {
        matches!(
            self,
            FailureKind::HardwareMismatch
                | FailureKind::KeyRevoked
                | FailureKind::KeyExpired
                | FailureKind::KeyUnavailable
        )
    }
}

/// Structured, user-visible failure reason attached to a failed session or a
/// rejected delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

/// Top-level transfer error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Network or delivery failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Digest or authentication-tag mismatch.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The key is bound to a different machine.
    #[error("key {0} is bound to different hardware")]
    HardwareMismatch(KeyId),

    /// No hardware identifier source produced a value.
    #[error("hardware fingerprint unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("key {0} has been revoked")]
    KeyRevoked(KeyId),

    #[error("key {0} has expired")]
    KeyExpired(KeyId),

    /// The key is unknown or its material could not be loaded.
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// Rotation aborted; the predecessor key is unchanged.
    #[error("key rotation failed: {0}")]
    RotationFailed(String),

    #[error("block {block_index} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        block_index: u64,
        attempts: u32,
        last_error: String,
    },

    /// The remote side refused the message for the given reason.
    #[error("rejected by peer: {0}")]
    Rejected(FailureReason),

    #[error("session cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::Transport(_) => FailureKind::Transport,
            TransferError::Integrity(_) => FailureKind::Integrity,
            TransferError::HardwareMismatch(_) => FailureKind::HardwareMismatch,
            TransferError::HardwareUnavailable(_) => FailureKind::HardwareUnavailable,
            TransferError::KeyRevoked(_) => FailureKind::KeyRevoked,
            TransferError::KeyExpired(_) => FailureKind::KeyExpired,
            TransferError::KeyUnavailable(_) => FailureKind::KeyUnavailable,
            TransferError::RotationFailed(_) => FailureKind::RotationFailed,
            TransferError::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            TransferError::Rejected(reason) => reason.kind,
            TransferError::Cancelled => FailureKind::Cancelled,
            TransferError::Internal(_) => FailureKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Convert into the structured reason reported to callers and peers.
    pub fn reason(&self) -> FailureReason {
        match self {
            TransferError::Rejected(reason) => reason.clone(),
            other => FailureReason::new(other.kind(), other.to_string()),
        }
    }
}
