//! [`TransferSession`]: one artifact moving from a source node to a sink node,
//! block by block, with progress that survives restarts.
//!
//! Session lifecycle:
//!
//! ```text
//! Created → Active ⇄ Paused → … → Completed
//!    │        │        │
//!    └────────┴────────┴──→ Failed ──resume──→ Active
//!                              └──budget spent──→ Cancelled
//! ```
//!
//! Any non-terminal state may also move straight to `Cancelled`.

use chrono::{DateTime, Utc};
use common::{FailureReason, KeyId, NodeId, SessionId, TransferError};
use serde::{Deserialize, Serialize};

use crate::crypto::Digest;

/// Transfer state of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    /// Encrypted and handed to the transport.
    InFlight,
    /// Acknowledgement received, outcome being applied.
    Verifying,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// `Completed` and `Cancelled` sessions never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Created, Active) | (Created, Paused) => true,
            (Active, Paused) | (Active, Completed) => true,
            (Paused, Active) => true,
            (Failed, Active) | (Failed, Cancelled) => true,
            (Created | Active | Paused, Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// Per-block progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTransferInfo {
    pub index: u64,
    /// Plaintext length in bytes.
    pub size: u64,
    /// SHA-256 of the plaintext, fixed when the session is created.
    pub digest: Digest,
    pub status: BlockStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl BlockTransferInfo {
    pub fn new(index: u64, size: u64, digest: Digest) -> Self {
        Self {
            index,
            size,
            digest,
            status: BlockStatus::Pending,
            retry_count: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }
}

/// The persisted state of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSession {
    pub id: SessionId,
    pub artifact_id: String,
    pub source: NodeId,
    pub sink: NodeId,
    pub key_id: KeyId,
    /// Ordered by block index.
    pub blocks: Vec<BlockTransferInfo>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the session last failed; cleared on resume.
    pub failure: Option<FailureReason>,
    /// Resumes out of `Failed` so far.
    #[serde(default)]
    pub resume_count: u32,
    /// The key was generated for this session and is retired with it.
    #[serde(default)]
    pub owns_key: bool,
    /// Blocks currently held in the send window. Not persisted.
    #[serde(skip)]
    pub in_flight: usize,
}

impl TransferSession {
    pub fn new(
        id: SessionId,
        artifact_id: String,
        source: NodeId,
        sink: NodeId,
        key_id: KeyId,
        blocks: Vec<BlockTransferInfo>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            artifact_id,
            source,
            sink,
            key_id,
            blocks,
            status: SessionStatus::Created,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failure: None,
            resume_count: 0,
            owns_key: false,
            in_flight: 0,
        }
    }

    /// Move to `next`, enforcing the session state machine.
    ///
    /// `Completed` is only reachable once every block is completed.
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), TransferError> {
        if !self.status.can_transition_to(next) {
            return Err(TransferError::Internal(format!(
                "invalid session transition {:?} -> {:?}",
                self.status, next
            )));
        }
        if next == SessionStatus::Completed && !self.all_completed() {
            return Err(TransferError::Internal(format!(
                "session has {} of {} blocks completed",
                self.completed_blocks(),
                self.total_blocks()
            )));
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Record `reason` and move to `Failed`.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TransferError> {
        self.transition(SessionStatus::Failed)?;
        self.failure = Some(reason);
        Ok(())
    }

    pub fn block(&self, index: u64) -> Option<&BlockTransferInfo> {
        self.blocks.get(usize::try_from(index).ok()?)
    }

    pub fn block_mut(&mut self, index: u64) -> Option<&mut BlockTransferInfo> {
        self.updated_at = Utc::now();
        self.blocks.get_mut(usize::try_from(index).ok()?)
    }

    pub fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn completed_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.status == BlockStatus::Completed)
            .count()
    }

    pub fn all_completed(&self) -> bool {
        self.blocks.iter().all(|b| b.status == BlockStatus::Completed)
    }

    /// Percentage of completed blocks, `0.0..=100.0`. An empty session is
    /// complete by definition.
    pub fn progress(&self) -> f64 {
        if self.blocks.is_empty() {
            return 100.0;
        }
        self.completed_blocks() as f64 * 100.0 / self.total_blocks() as f64
    }

    /// Indices of blocks still to send, ascending.
    pub fn pending_indices(&self) -> Vec<u64> {
        self.blocks
            .iter()
            .filter(|b| b.status != BlockStatus::Completed)
            .map(|b| b.index)
            .collect()
    }

    /// Prepare blocks for a fresh run: failed blocks get a new retry budget
    /// and interrupted attempts go back to `Pending`. Completed blocks are
    /// untouched.
    pub fn reset_for_resume(&mut self) {
        for block in &mut self.blocks {
            match block.status {
                BlockStatus::Completed => {}
                BlockStatus::Failed => {
                    block.status = BlockStatus::Pending;
                    block.retry_count = 0;
                    block.last_error = None;
                }
                BlockStatus::Pending | BlockStatus::InFlight | BlockStatus::Verifying => {
                    block.status = BlockStatus::Pending;
                }
            }
        }
        self.failure = None;
        self.in_flight = 0;
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            session_id: self.id,
            artifact_id: self.artifact_id.clone(),
            key_id: self.key_id,
            status: self.status,
            completed_blocks: self.completed_blocks(),
            total_blocks: self.total_blocks(),
            in_flight_blocks: self.in_flight,
            progress: self.progress(),
            failure: self.failure.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Caller-facing summary of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub artifact_id: String,
    pub key_id: KeyId,
    pub status: SessionStatus,
    pub completed_blocks: usize,
    pub total_blocks: usize,
    pub in_flight_blocks: usize,
    pub progress: f64,
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::FailureKind;

    fn session(blocks: u64) -> TransferSession {
        TransferSession::new(
            SessionId::new(),
            "shard-0".into(),
            NodeId::from("source"),
            NodeId::from("sink"),
            KeyId::new(),
            (0..blocks)
                .map(|i| BlockTransferInfo::new(i, 16, [0u8; 32]))
                .collect(),
        )
    }

    #[test]
    fn state_machine_follows_lifecycle() {
        use SessionStatus::*;
        assert!(Created.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Failed.can_transition_to(Active));
        assert!(Failed.can_transition_to(Cancelled));
        assert!(Paused.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn completed_requires_every_block() {
        let mut s = session(2);
        s.transition(SessionStatus::Active).unwrap();
        assert!(s.transition(SessionStatus::Completed).is_err());

        for b in &mut s.blocks {
            b.status = BlockStatus::Completed;
        }
        s.transition(SessionStatus::Completed).unwrap();
        assert!(s.completed_at.is_some());
        assert_eq!(s.progress(), 100.0);
    }

    #[test]
    fn progress_counts_completed_blocks() {
        let mut s = session(4);
        assert_eq!(s.progress(), 0.0);
        s.blocks[1].status = BlockStatus::Completed;
        assert_eq!(s.progress(), 25.0);
        assert_eq!(s.pending_indices(), vec![0, 2, 3]);
        assert_eq!(session(0).progress(), 100.0);
    }

    #[test]
    fn resume_resets_failed_blocks_only() {
        let mut s = session(3);
        s.blocks[0].status = BlockStatus::Completed;
        s.blocks[0].retry_count = 1;
        s.blocks[1].status = BlockStatus::Failed;
        s.blocks[1].retry_count = 3;
        s.blocks[1].last_error = Some("reset".into());
        s.blocks[2].status = BlockStatus::InFlight;
        s.blocks[2].retry_count = 1;
        s.failure = Some(FailureReason::new(FailureKind::RetriesExhausted, "block 1"));

        s.reset_for_resume();
        assert_eq!(s.blocks[0].status, BlockStatus::Completed);
        assert_eq!(s.blocks[0].retry_count, 1);
        assert_eq!(s.blocks[1].status, BlockStatus::Pending);
        assert_eq!(s.blocks[1].retry_count, 0);
        assert!(s.blocks[1].last_error.is_none());
        assert_eq!(s.blocks[2].status, BlockStatus::Pending);
        assert!(s.failure.is_none());
    }

    #[test]
    fn report_carries_failure_and_counts() {
        let mut s = session(2);
        s.transition(SessionStatus::Active).unwrap();
        s.blocks[0].status = BlockStatus::Completed;
        s.fail(FailureReason::new(FailureKind::KeyRevoked, "revoked"))
            .unwrap();
        let report = s.report();
        assert_eq!(report.status, SessionStatus::Failed);
        assert_eq!(report.completed_blocks, 1);
        assert_eq!(report.total_blocks, 2);
        assert_eq!(report.failure.unwrap().kind, FailureKind::KeyRevoked);
    }

    #[test]
    fn persisted_form_round_trips() {
        let mut s = session(2);
        s.in_flight = 2;
        let json = serde_json::to_string(&s).unwrap();
        let back: TransferSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back.in_flight, 0);
        assert_eq!(back.blocks, s.blocks);
        assert_eq!(back.id, s.id);
    }
}
