//! [`TransferManager`]: drives sessions from `Created` to a terminal state.
//!
//! Each run of a session is one spawned task. The task waits for one of the
//! global session slots, announces the session to the sink, then pipelines
//! its pending blocks through a bounded window. Per block:
//!
//! 1. mark `InFlight`, derive a fresh nonce, encrypt under the session key;
//! 2. deliver through the [`Transport`] and wait for the acknowledgement;
//! 3. mark `Verifying` and apply the outcome: `Completed`, a retry after
//!    capped exponential backoff, or a block failure.
//!
//! Transient failures (transport, integrity) are retried inside the block
//! task. Key-policy failures are never retried and stop the run.
//!
//! Pause and cancel are cooperative: no new blocks are dispatched and backoff
//! sleeps are cut short, but attempts already in flight finish. Only the run
//! task writes the final status of a run, and it clears its `running` flag
//! in the same critical section, so a caller that observes the final status
//! can immediately resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use common::protocol::{AckOutcome, BlockFrame, DeliveryAck, SessionControl, WireMessage};
use common::{KeyId, NodeId, SessionId, TransferError};
use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::session::{
    BlockStatus, BlockTransferInfo, SessionReport, SessionStatus, TransferSession,
};
use super::source::{ArtifactResolver, BlockSource};
use super::store::SessionStore;
use super::transport::Transport;
use crate::crypto::cipher::random_bytes;
use crate::crypto::{derive_nonce, digest, Digest, NONCE_SALT_LEN};
use crate::keys::{KeyContext, KeyManager};

/// Tuning for a [`TransferManager`].
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Sessions allowed to run at once.
    pub max_concurrent_sessions: usize,
    /// Blocks of one session in flight at once.
    pub block_window: usize,
    pub retry: RetryPolicy,
    /// Deadline for one delivery acknowledgement.
    pub send_timeout: Duration,
    /// Resumes allowed out of `Failed` before a session is cancelled.
    pub max_session_resumes: u32,
    /// How long terminal sessions are kept before eviction.
    pub session_retention: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 3,
            block_window: 4,
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(30),
            max_session_resumes: 3,
            session_retention: Duration::from_secs(3600),
        }
    }
}

/// Parameters of a new session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub artifact_id: String,
    pub source: NodeId,
    pub sink: NodeId,
    /// Key to encrypt under; must be `Active`. When absent, a
    /// transfer-scoped random key is generated and retired with the session.
    pub key_id: Option<KeyId>,
}

/// Called with `(session_id, percent_complete)` after every block state
/// change. Runs on a dedicated dispatcher task, never on the transfer path.
pub type ProgressCallback = Arc<dyn Fn(SessionId, f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    Pause,
    Cancel,
}

#[derive(Default)]
struct RunControl {
    running: bool,
    token: CancellationToken,
    stop: Option<StopRequest>,
}

struct SessionHandle {
    state: Mutex<TransferSession>,
    source: Mutex<Option<Arc<dyn BlockSource>>>,
    control: Mutex<RunControl>,
    /// Status as seen by waiters; published only when a run starts or ends.
    status: watch::Sender<SessionStatus>,
}

impl SessionHandle {
    fn new(session: TransferSession, source: Option<Arc<dyn BlockSource>>) -> Self {
        let (status, _) = watch::channel(session.status);
        Self {
            state: Mutex::new(session),
            source: Mutex::new(source),
            control: Mutex::new(RunControl::default()),
            status,
        }
    }
}

/// Fixed inputs of one run.
#[derive(Clone)]
struct RunContext {
    session_id: SessionId,
    key_id: KeyId,
    /// Fresh per run so nonces never repeat across resumes.
    nonce_salt: [u8; NONCE_SALT_LEN],
}

struct Inner {
    keys: KeyManager,
    transport: Arc<dyn Transport>,
    store: SessionStore,
    settings: TransferSettings,
    slots: Arc<Semaphore>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    callbacks: Arc<ArcSwap<Vec<ProgressCallback>>>,
    progress_tx: mpsc::UnboundedSender<(SessionId, f64)>,
}

/// Orchestrates concurrent transfer sessions. Cheap to clone.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<Inner>,
}

impl TransferManager {
    /// Build a manager. Must be called from within a Tokio runtime; the
    /// progress dispatcher is spawned here.
    pub fn new(
        keys: KeyManager,
        transport: Arc<dyn Transport>,
        store: SessionStore,
        settings: TransferSettings,
    ) -> Self {
        let callbacks: Arc<ArcSwap<Vec<ProgressCallback>>> =
            Arc::new(ArcSwap::from_pointee(Vec::new()));
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_progress(progress_rx, Arc::clone(&callbacks)));

        Self {
            inner: Arc::new(Inner {
                keys,
                transport,
                store,
                slots: Arc::new(Semaphore::new(settings.max_concurrent_sessions.max(1))),
                settings,
                sessions: RwLock::new(HashMap::new()),
                callbacks,
                progress_tx,
            }),
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.inner.settings
    }

    // -----------------------------------------------------------------------
    // Caller operations
    // -----------------------------------------------------------------------

    /// Create a session for `source` and start transferring it.
    ///
    /// Every block is read once up front to record its size and digest.
    ///
    /// # Errors
    ///
    /// Fails if the supplied key is not `Active`, the key cannot be
    /// generated, the artifact cannot be read, or the session record cannot
    /// be persisted.
    pub async fn start_session(
        &self,
        request: SessionRequest,
        source: Arc<dyn BlockSource>,
    ) -> Result<SessionId, TransferError> {
        if let Some(id) = request.key_id {
            self.inner.keys.ensure_assignable(id).await?;
        }

        let count = source.block_count();
        let mut blocks = Vec::with_capacity(usize::try_from(count).unwrap_or_default());
        for index in 0..count {
            let data = source.read_block(index).await?;
            blocks.push(BlockTransferInfo::new(index, data.len() as u64, digest(&data)));
        }

        let (key_id, owns_key) = match request.key_id {
            Some(id) => (id, false),
            None => {
                let context = KeyContext::new(format!("transfer:{}", request.artifact_id));
                (self.inner.keys.generate_random_key(context).await?.id, true)
            }
        };

        let mut session = TransferSession::new(
            SessionId::new(),
            request.artifact_id,
            request.source,
            request.sink,
            key_id,
            blocks,
        );
        session.owns_key = owns_key;
        let session_id = session.id;
        if let Err(e) = self.inner.store.save(&session).await {
            if owns_key {
                if let Err(retire) = self.inner.keys.retire_key(key_id).await {
                    warn!(key_id = %key_id, error = %retire, "cannot retire unused session key");
                }
            }
            return Err(e.into());
        }
        info!(
            session_id = %session_id,
            artifact_id = %session.artifact_id,
            key_id = %key_id,
            blocks = count,
            "session created"
        );

        let handle = Arc::new(SessionHandle::new(session, Some(source)));
        self.inner
            .sessions
            .write()
            .await
            .insert(session_id, Arc::clone(&handle));
        let mut control = handle.control.lock().await;
        self.spawn_run(&handle, &mut control);
        Ok(session_id)
    }

    /// Restart a `Paused` or `Failed` session, skipping completed blocks.
    ///
    /// Failed blocks get a fresh retry budget. A `Failed` session that has
    /// used up its resume budget is cancelled instead and `false` returned.
    pub async fn resume_transfer(&self, session_id: SessionId) -> bool {
        let Some(handle) = self.handle(session_id).await else {
            return false;
        };
        let mut control = handle.control.lock().await;
        if control.running {
            return false;
        }
        let mut state = handle.state.lock().await;
        if !matches!(state.status, SessionStatus::Paused | SessionStatus::Failed) {
            return false;
        }
        if handle.source.lock().await.is_none() {
            warn!(session_id = %session_id, "cannot resume: no artifact source attached");
            return false;
        }

        if state.status == SessionStatus::Failed {
            if state.resume_count >= self.inner.settings.max_session_resumes {
                if state.transition(SessionStatus::Cancelled).is_ok() {
                    self.persist(&state).await;
                    self.emit(&state);
                    self.release_key(&state).await;
                    handle.status.send_replace(SessionStatus::Cancelled);
                }
                warn!(
                    session_id = %session_id,
                    resumes = state.resume_count,
                    "resume budget exhausted; session cancelled"
                );
                return false;
            }
            state.resume_count += 1;
        }

        state.reset_for_resume();
        if let Err(e) = state.transition(SessionStatus::Active) {
            warn!(session_id = %session_id, error = %e, "cannot resume session");
            return false;
        }
        self.persist(&state).await;
        self.emit(&state);
        handle.status.send_replace(SessionStatus::Active);
        info!(
            session_id = %session_id,
            completed = state.completed_blocks(),
            total = state.total_blocks(),
            resumes = state.resume_count,
            "session resumed"
        );
        drop(state);

        self.spawn_run(&handle, &mut control);
        true
    }

    /// Ask a running session to pause after its in-flight blocks settle.
    pub async fn pause_session(&self, session_id: SessionId) -> bool {
        let Some(handle) = self.handle(session_id).await else {
            return false;
        };
        let mut control = handle.control.lock().await;
        if !control.running {
            return false;
        }
        control.stop.get_or_insert(StopRequest::Pause);
        control.token.cancel();
        info!(session_id = %session_id, "pause requested");
        true
    }

    /// Cancel a session in any non-terminal state.
    ///
    /// A running session stops cooperatively and then becomes `Cancelled`;
    /// an idle one is cancelled at once. Blocks already delivered stay on the
    /// sink.
    pub async fn cancel_session(&self, session_id: SessionId) -> bool {
        let Some(handle) = self.handle(session_id).await else {
            return false;
        };
        let mut control = handle.control.lock().await;
        if handle.state.lock().await.status.is_terminal() {
            return false;
        }
        if control.running {
            control.stop = Some(StopRequest::Cancel);
            control.token.cancel();
            info!(session_id = %session_id, "cancellation requested");
            return true;
        }

        let status = self.cancel_idle(&handle).await;
        if status != SessionStatus::Cancelled {
            return false;
        }
        handle.status.send_replace(status);
        drop(control);

        let notice = WireMessage::Control(SessionControl::Cancel { session_id });
        if let Err(e) = self.deliver(notice).await {
            debug!(session_id = %session_id, error = %e, "sink not told about cancellation");
        }
        true
    }

    /// Percentage of completed blocks.
    pub async fn get_progress(&self, session_id: SessionId) -> Option<f64> {
        let handle = self.handle(session_id).await?;
        let progress = handle.state.lock().await.progress();
        Some(progress)
    }

    /// Status, failure reason and completed/total block counts.
    pub async fn session_report(&self, session_id: SessionId) -> Option<SessionReport> {
        let handle = self.handle(session_id).await?;
        let report = handle.state.lock().await.report();
        Some(report)
    }

    pub async fn list_sessions(&self) -> Vec<SessionReport> {
        let handles: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            reports.push(handle.state.lock().await.report());
        }
        reports.sort_by_key(|r| r.created_at);
        reports
    }

    /// Register a progress callback. Callbacks run on the dispatcher task; a
    /// slow callback delays other callbacks but never the transfer.
    pub fn add_progress_callback<F>(&self, callback: F)
    where
        F: Fn(SessionId, f64) + Send + Sync + 'static,
    {
        let callback: ProgressCallback = Arc::new(callback);
        self.inner.callbacks.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&callback));
            next
        });
    }

    /// Wait until the session is neither `Created` nor `Active`, then return
    /// its status.
    pub async fn wait_until_idle(&self, session_id: SessionId) -> Option<SessionStatus> {
        let handle = self.handle(session_id).await?;
        let mut rx = handle.status.subscribe();
        let status = rx
            .wait_for(|s| !matches!(s, SessionStatus::Created | SessionStatus::Active))
            .await
            .ok()?;
        Some(*status)
    }

    /// Point an idle `Paused` or `Failed` session at a different `Active`
    /// key, e.g. after its key was revoked. Completed blocks are not re-sent.
    pub async fn replace_session_key(&self, session_id: SessionId, key_id: KeyId) -> bool {
        let Some(handle) = self.handle(session_id).await else {
            return false;
        };
        let control = handle.control.lock().await;
        if control.running {
            return false;
        }
        let mut state = handle.state.lock().await;
        if !matches!(state.status, SessionStatus::Paused | SessionStatus::Failed) {
            return false;
        }
        if let Err(e) = self.inner.keys.ensure_assignable(key_id).await {
            warn!(session_id = %session_id, key_id = %key_id, error = %e, "replacement key refused");
            return false;
        }
        let old = std::mem::replace(&mut state.key_id, key_id);
        let owned_old = std::mem::replace(&mut state.owns_key, false);
        self.persist(&state).await;
        if owned_old {
            if let Err(e) = self.inner.keys.retire_key(old).await {
                warn!(session_id = %session_id, key_id = %old, error = %e, "cannot retire replaced session key");
            }
        }
        info!(session_id = %session_id, old_key_id = %old, new_key_id = %key_id, "session key replaced");
        true
    }

    /// Attach the artifact of a recovered session.
    pub async fn attach_source(&self, session_id: SessionId, source: Arc<dyn BlockSource>) -> bool {
        let Some(handle) = self.handle(session_id).await else {
            return false;
        };
        let expected = handle.state.lock().await.total_blocks() as u64;
        if source.block_count() != expected {
            warn!(
                session_id = %session_id,
                expected,
                actual = source.block_count(),
                "artifact does not match session"
            );
            return false;
        }
        *handle.source.lock().await = Some(source);
        true
    }

    /// Reload persisted sessions after a restart.
    ///
    /// Sessions interrupted mid-run come back `Paused` with their in-flight
    /// blocks reset to `Pending`; nothing is restarted automatically. Returns
    /// the number of sessions loaded.
    pub async fn recover_sessions(&self, resolver: &dyn ArtifactResolver) -> Result<usize, TransferError> {
        let records = self.inner.store.load_all().await?;
        let mut recovered = 0;
        for mut session in records {
            let session_id = session.id;
            if self.inner.sessions.read().await.contains_key(&session_id) {
                continue;
            }

            if matches!(session.status, SessionStatus::Created | SessionStatus::Active) {
                session.transition(SessionStatus::Paused)?;
            }
            for block in &mut session.blocks {
                if matches!(block.status, BlockStatus::InFlight | BlockStatus::Verifying) {
                    block.status = BlockStatus::Pending;
                }
            }
            self.persist(&session).await;

            let source = if session.status.is_terminal() {
                None
            } else {
                match resolver.resolve(&session.artifact_id).await {
                    Ok(source) if source.block_count() == session.total_blocks() as u64 => Some(source),
                    Ok(_) => {
                        warn!(session_id = %session_id, artifact_id = %session.artifact_id, "artifact changed since the session started");
                        None
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, artifact_id = %session.artifact_id, error = %e, "artifact unavailable");
                        None
                    }
                }
            };

            debug!(
                session_id = %session_id,
                status = ?session.status,
                completed = session.completed_blocks(),
                total = session.total_blocks(),
                "session recovered"
            );
            let handle = Arc::new(SessionHandle::new(session, source));
            self.inner.sessions.write().await.insert(session_id, handle);
            recovered += 1;
        }
        info!(recovered, "sessions recovered from store");
        Ok(recovered)
    }

    /// Drop `Completed` and `Cancelled` sessions older than the retention
    /// window from memory and from the store.
    pub async fn evict_expired_sessions(&self) -> Result<usize, TransferError> {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.inner.settings.session_retention)
            .unwrap_or(chrono::Duration::MAX);
        let handles: Vec<(SessionId, Arc<SessionHandle>)> = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();

        let mut expired = Vec::new();
        for (id, handle) in handles {
            let state = handle.state.lock().await;
            let due = state
                .completed_at
                .and_then(|at| at.checked_add_signed(retention))
                .is_some_and(|deadline| deadline <= now);
            if state.status.is_terminal() && due {
                expired.push(id);
            }
        }

        for id in &expired {
            self.inner.store.remove(*id).await?;
            self.inner.sessions.write().await.remove(id);
            debug!(session_id = %id, "session evicted");
        }
        Ok(expired.len())
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    fn spawn_run(&self, handle: &Arc<SessionHandle>, control: &mut RunControl) {
        let token = CancellationToken::new();
        control.running = true;
        control.stop = None;
        control.token = token.clone();

        let manager = self.clone();
        let handle = Arc::clone(handle);
        tokio::spawn(async move { manager.run(handle, token).await });
    }

    async fn run(self, handle: Arc<SessionHandle>, token: CancellationToken) {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = Arc::clone(&self.inner.slots).acquire_owned() => permit.ok(),
        };
        let outcome = match permit {
            Some(_) => self.drive(&handle, &token).await,
            None => Ok(()),
        };

        let (status, notice) = self.finish(&handle, outcome).await;
        if let Some(message) = notice {
            let session_id = message.session_id();
            if let Err(e) = self.deliver(message).await {
                debug!(session_id = %session_id, error = %e, "end-of-run notice not delivered");
            }
        }

        let late_cancel = {
            let mut control = handle.control.lock().await;
            // A cancel that arrived while the notice was out still applies.
            let late_cancel = control.stop == Some(StopRequest::Cancel) && !status.is_terminal();
            let status = if late_cancel {
                self.cancel_idle(&handle).await
            } else {
                status
            };
            control.running = false;
            control.stop = None;
            handle.status.send_replace(status);
            late_cancel && status == SessionStatus::Cancelled
        };
        drop(permit);

        if late_cancel {
            let session_id = handle.state.lock().await.id;
            let notice = WireMessage::Control(SessionControl::Cancel { session_id });
            if let Err(e) = self.deliver(notice).await {
                debug!(session_id = %session_id, error = %e, "sink not told about cancellation");
            }
        }
    }

    /// Cancel a session whose run has ended. Returns the resulting status.
    async fn cancel_idle(&self, handle: &SessionHandle) -> SessionStatus {
        let mut state = handle.state.lock().await;
        if let Err(e) = state.transition(SessionStatus::Cancelled) {
            warn!(session_id = %state.id, error = %e, "cannot cancel session");
            return state.status;
        }
        self.persist(&state).await;
        self.emit(&state);
        self.release_key(&state).await;
        info!(session_id = %state.id, "session cancelled");
        state.status
    }

    /// Transfer every pending block. `Err` carries the error that stopped
    /// the run.
    async fn drive(&self, handle: &Arc<SessionHandle>, token: &CancellationToken) -> Result<(), TransferError> {
        let (context, open, pending) = {
            let mut state = handle.state.lock().await;
            if state.status == SessionStatus::Created {
                state.transition(SessionStatus::Active)?;
                self.persist(&state).await;
                handle.status.send_replace(SessionStatus::Active);
            }
            let open = WireMessage::Control(SessionControl::Open {
                session_id: state.id,
                artifact_id: state.artifact_id.clone(),
                source: state.source.clone(),
                key_id: state.key_id,
                total_blocks: state.total_blocks() as u64,
            });
            let context = RunContext {
                session_id: state.id,
                key_id: state.key_id,
                nonce_salt: random_bytes::<NONCE_SALT_LEN>(),
            };
            (context, open, state.pending_indices())
        };
        let source = handle
            .source
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransferError::Internal("no artifact source attached".into()))?;

        info!(session_id = %context.session_id, key_id = %context.key_id, pending = pending.len(), "transfer run started");
        self.deliver_control(open).await?;

        let window = self.inner.settings.block_window.max(1);
        let mut pending = pending.into_iter();
        let mut in_flight = JoinSet::new();
        let mut fatal: Option<TransferError> = None;
        loop {
            while fatal.is_none() && !token.is_cancelled() && in_flight.len() < window {
                let Some(index) = pending.next() else {
                    break;
                };
                handle.state.lock().await.in_flight += 1;
                let manager = self.clone();
                let handle = Arc::clone(handle);
                let source = Arc::clone(&source);
                let context = context.clone();
                let token = token.clone();
                in_flight.spawn(async move {
                    manager
                        .transfer_block(&handle, source.as_ref(), &context, index, &token)
                        .await
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            {
                let mut state = handle.state.lock().await;
                state.in_flight = state.in_flight.saturating_sub(1);
            }
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if fatal.is_none() {
                        warn!(session_id = %context.session_id, error = %e, "block failed; stopping run");
                        fatal = Some(e);
                    }
                }
                Err(e) => {
                    fatal.get_or_insert(TransferError::Internal(format!("block task failed: {e}")));
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn transfer_block(
        &self,
        handle: &SessionHandle,
        source: &dyn BlockSource,
        context: &RunContext,
        index: u64,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        let expected = handle
            .state
            .lock()
            .await
            .block(index)
            .map(|b| b.digest)
            .ok_or_else(|| TransferError::Internal(format!("no block {index}")))?;
        let plaintext = source.read_block(index).await?;
        if digest(&plaintext) != expected {
            let err = TransferError::Internal(format!("block {index} of the artifact changed since the session started"));
            self.update_block(handle, index, true, |b| {
                b.status = BlockStatus::Failed;
                b.last_error = Some(err.to_string());
            })
            .await?;
            return Err(err);
        }

        let policy = self.inner.settings.retry;
        loop {
            let attempt = self
                .update_block(handle, index, false, |b| {
                    b.status = BlockStatus::InFlight;
                    b.last_attempt_at = Some(Utc::now());
                    b.retry_count
                })
                .await?;

            let err = match self
                .attempt_block(handle, context, index, attempt, &plaintext, &expected)
                .await
            {
                Ok(()) => {
                    self.update_block(handle, index, true, |b| {
                        b.status = BlockStatus::Completed;
                        b.last_error = None;
                    })
                    .await?;
                    debug!(session_id = %context.session_id, block_index = index, attempt, "block completed");
                    return Ok(());
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                self.update_block(handle, index, true, |b| {
                    b.status = BlockStatus::Failed;
                    b.last_error = Some(err.to_string());
                })
                .await?;
                return Err(err);
            }

            let retry_count = self
                .update_block(handle, index, true, |b| {
                    b.retry_count += 1;
                    b.last_error = Some(err.to_string());
                    b.status = if policy.should_retry(b.retry_count) {
                        BlockStatus::Pending
                    } else {
                        BlockStatus::Failed
                    };
                    b.retry_count
                })
                .await?;

            if !policy.should_retry(retry_count) {
                warn!(
                    session_id = %context.session_id,
                    block_index = index,
                    attempts = retry_count,
                    error = %err,
                    "block retries exhausted"
                );
                return Err(TransferError::RetriesExhausted {
                    block_index: index,
                    attempts: retry_count,
                    last_error: err.to_string(),
                });
            }

            let delay = policy.delay_for(retry_count);
            debug!(
                session_id = %context.session_id,
                block_index = index,
                attempt = retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "block attempt failed; backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return Ok(()),
            }
        }
    }

    async fn attempt_block(
        &self,
        handle: &SessionHandle,
        context: &RunContext,
        index: u64,
        attempt: u32,
        plaintext: &[u8],
        expected: &Digest,
    ) -> Result<(), TransferError> {
        let nonce = derive_nonce(&context.nonce_salt, &context.session_id, index, attempt)?;
        let sealed = self
            .inner
            .keys
            .encrypt_block(context.key_id, &nonce, plaintext)
            .await?;
        let frame = BlockFrame {
            session_id: context.session_id,
            key_id: context.key_id,
            block_index: index,
            nonce,
            tag: sealed.tag,
            digest: *expected,
            ciphertext: sealed.ciphertext,
        };
        let ack = self.deliver(WireMessage::Block(frame)).await?;
        self.update_block(handle, index, false, |b| b.status = BlockStatus::Verifying)
            .await?;
        check_ack(ack, context.session_id, Some(index))
    }

    /// Apply the end of a run to the session and pick the notice for the
    /// sink.
    async fn finish(
        &self,
        handle: &SessionHandle,
        outcome: Result<(), TransferError>,
    ) -> (SessionStatus, Option<WireMessage>) {
        let stop = handle.control.lock().await.stop;
        let mut state = handle.state.lock().await;
        state.in_flight = 0;

        let next = if state.status == SessionStatus::Active && state.all_completed() {
            SessionStatus::Completed
        } else {
            match (stop, &outcome) {
                (Some(StopRequest::Cancel), _) => SessionStatus::Cancelled,
                (_, Err(_)) => SessionStatus::Failed,
                _ => SessionStatus::Paused,
            }
        };
        let applied = match (next, outcome) {
            (SessionStatus::Failed, Err(e)) => state.fail(e.reason()),
            _ => state.transition(next),
        };
        if let Err(e) = applied {
            warn!(session_id = %state.id, error = %e, "cannot record end of run");
        }
        self.persist(&state).await;
        self.emit(&state);
        self.release_key(&state).await;

        info!(
            session_id = %state.id,
            status = ?state.status,
            completed = state.completed_blocks(),
            total = state.total_blocks(),
            failure = ?state.failure,
            "transfer run finished"
        );

        let session_id = state.id;
        let notice = match state.status {
            SessionStatus::Completed => Some(SessionControl::Close {
                session_id,
                completed: true,
            }),
            SessionStatus::Cancelled => Some(SessionControl::Cancel { session_id }),
            SessionStatus::Failed | SessionStatus::Paused => Some(SessionControl::Close {
                session_id,
                completed: false,
            }),
            SessionStatus::Created | SessionStatus::Active => None,
        };
        (state.status, notice.map(WireMessage::Control))
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    async fn deliver(&self, message: WireMessage) -> Result<DeliveryAck, TransferError> {
        let timeout = self.inner.settings.send_timeout;
        match tokio::time::timeout(timeout, self.inner.transport.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Transport(format!(
                "no acknowledgement within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Deliver a control message, retrying transient failures.
    async fn deliver_control(&self, message: WireMessage) -> Result<(), TransferError> {
        let policy = self.inner.settings.retry;
        let session_id = message.session_id();
        let mut failures = 0;
        loop {
            let result = match self.deliver(message.clone()).await {
                Ok(ack) => check_ack(ack, session_id, None),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if !policy.should_retry(failures) {
                        return Err(e);
                    }
                    tokio::time::sleep(policy.delay_for(failures)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Retire a generated session key once the session is terminal.
    async fn release_key(&self, state: &TransferSession) {
        if !state.owns_key || !state.status.is_terminal() {
            return;
        }
        match self.inner.keys.retire_key(state.key_id).await {
            Ok(true) => debug!(session_id = %state.id, key_id = %state.key_id, "session key retired"),
            Ok(false) => {}
            Err(e) => warn!(session_id = %state.id, key_id = %state.key_id, error = %e, "cannot retire session key"),
        }
    }

    async fn handle(&self, session_id: SessionId) -> Option<Arc<SessionHandle>> {
        self.inner.sessions.read().await.get(&session_id).cloned()
    }

    /// Mutate one block under the session lock and report progress;
    /// `durable` changes are also written to the store.
    async fn update_block<R>(
        &self,
        handle: &SessionHandle,
        index: u64,
        durable: bool,
        f: impl FnOnce(&mut BlockTransferInfo) -> R,
    ) -> Result<R, TransferError> {
        let mut state = handle.state.lock().await;
        let block = state
            .block_mut(index)
            .ok_or_else(|| TransferError::Internal(format!("no block {index}")))?;
        let out = f(block);
        if durable {
            self.persist(&state).await;
        }
        self.emit(&state);
        Ok(out)
    }

    async fn persist(&self, session: &TransferSession) {
        if let Err(e) = self.inner.store.save(session).await {
            warn!(session_id = %session.id, error = %e, "failed to persist session state");
        }
    }

    fn emit(&self, session: &TransferSession) {
        // Only fails once the dispatcher is gone, i.e. during shutdown.
        let _ = self.inner.progress_tx.send((session.id, session.progress()));
    }
}

fn check_ack(ack: DeliveryAck, session_id: SessionId, block_index: Option<u64>) -> Result<(), TransferError> {
    if ack.session_id != session_id || ack.block_index != block_index {
        return Err(TransferError::Transport(
            "acknowledgement does not match the delivered message".into(),
        ));
    }
    match ack.outcome {
        AckOutcome::Accepted | AckOutcome::Duplicate => Ok(()),
        AckOutcome::Rejected { reason } => Err(TransferError::Rejected(reason)),
    }
}

async fn dispatch_progress(
    mut rx: mpsc::UnboundedReceiver<(SessionId, f64)>,
    callbacks: Arc<ArcSwap<Vec<ProgressCallback>>>,
) {
    while let Some((session_id, progress)) = rx.recv().await {
        for callback in callbacks.load().iter() {
            callback(session_id, progress);
        }
    }
}
