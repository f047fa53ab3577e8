//! Messages exchanged between a source node and a sink node.
//!
//! Every frame on the wire is a [`WireMessage`] serialised as JSON. Binary
//! fields (nonce, tag, digest, ciphertext) are standard base64 strings.
//!
//! A message is either session control (open/close/cancel) or block data; the
//! receiver dispatches on the variant with an exhaustive `match`.

use serde::{Deserialize, Serialize};

use crate::error::FailureReason;
use crate::ids::{KeyId, NodeId, SessionId};

/// Byte length of an AEAD nonce (96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of an AEAD authentication tag (128 bits).
pub const TAG_LEN: usize = 16;

/// Byte length of a plaintext content digest (SHA-256).
pub const DIGEST_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One frame delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "body", rename_all = "snake_case")]
pub enum WireMessage {
    Control(SessionControl),
    Block(BlockFrame),
}

impl WireMessage {
    /// The session this message belongs to.
    pub fn session_id(&self) -> SessionId {
        match self {
            WireMessage::Control(ctrl) => ctrl.session_id(),
            WireMessage::Block(frame) => frame.session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Session control
// ---------------------------------------------------------------------------

/// Session lifecycle notifications sent ahead of and after block data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SessionControl {
    /// Announce a session (or a resumed run of one) to the sink.
    Open {
        session_id: SessionId,
        artifact_id: String,
        source: NodeId,
        key_id: KeyId,
        total_blocks: u64,
    },
    /// The source finished its run; `completed` is true when every block was
    /// acknowledged.
    Close {
        session_id: SessionId,
        completed: bool,
    },
    /// The source abandoned the session.
    Cancel { session_id: SessionId },
}

impl SessionControl {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionControl::Open { session_id, .. }
            | SessionControl::Close { session_id, .. }
            | SessionControl::Cancel { session_id } => *session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Block data
// ---------------------------------------------------------------------------

/// A single encrypted block in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFrame {
    pub session_id: SessionId,
    pub key_id: KeyId,
    pub block_index: u64,
    #[serde(with = "b64")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "b64")]
    pub tag: [u8; TAG_LEN],
    /// SHA-256 of the plaintext, verified by the sink after decryption.
    #[serde(with = "b64")]
    pub digest: [u8; DIGEST_LEN],
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Acknowledgement
// ---------------------------------------------------------------------------

/// Reply to every delivered [`WireMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub session_id: SessionId,
    /// `None` for control messages.
    pub block_index: Option<u64>,
    pub outcome: AckOutcome,
}

impl DeliveryAck {
    pub fn accepted(session_id: SessionId, block_index: Option<u64>) -> Self {
        Self {
            session_id,
            block_index,
            outcome: AckOutcome::Accepted,
        }
    }

    pub fn duplicate(session_id: SessionId, block_index: u64) -> Self {
        Self {
            session_id,
            block_index: Some(block_index),
            outcome: AckOutcome::Duplicate,
        }
    }

    pub fn rejected(session_id: SessionId, block_index: Option<u64>, reason: FailureReason) -> Self {
        Self {
            session_id,
            block_index,
            outcome: AckOutcome::Rejected { reason },
        }
    }
}

/// Result of processing a delivered message on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckOutcome {
    /// The block was verified and stored.
    Accepted,
    /// The block was already completed; nothing was overwritten.
    Duplicate,
    Rejected { reason: FailureReason },
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(value.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(de::Error::custom)?;
        let len = bytes.len();
        T::try_from(bytes).map_err(|_| de::Error::custom(format!("unexpected field length {len}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn sample_frame() -> BlockFrame {
        BlockFrame {
            session_id: SessionId::new(),
            key_id: KeyId::new(),
            block_index: 7,
            nonce: [1u8; NONCE_LEN],
            tag: [2u8; TAG_LEN],
            digest: [3u8; DIGEST_LEN],
            ciphertext: vec![0xAB; 64],
        }
    }

    #[test]
    fn block_frame_round_trip() {
        let msg = WireMessage::Block(sample_frame());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"channel\":\"block\""));
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn wrong_nonce_length_is_rejected() {
        let mut value = serde_json::to_value(sample_frame()).unwrap();
        value["nonce"] = serde_json::Value::String("AAAA".into());
        assert!(serde_json::from_value::<BlockFrame>(value).is_err());
    }

    #[test]
    fn control_message_tagging() {
        let session_id = SessionId::new();
        let msg = WireMessage::Control(SessionControl::Close {
            session_id,
            completed: true,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["channel"], "control");
        assert_eq!(value["body"]["op"], "close");
        assert_eq!(msg.session_id(), session_id);
    }

    #[test]
    fn rejected_ack_carries_reason() {
        let ack = DeliveryAck::rejected(
            SessionId::new(),
            Some(3),
            FailureReason::new(FailureKind::Integrity, "digest mismatch"),
        );
        let json = serde_json::to_string(&ack).unwrap();
        let decoded: DeliveryAck = serde_json::from_str(&json).unwrap();
        match decoded.outcome {
            AckOutcome::Rejected { reason } => assert_eq!(reason.kind, FailureKind::Integrity),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
