//! Session manager: the only entry point the outer layers call.
//!
//! Owns the session table and the code registry, enforces capacity, forwards chunks through the
//! transport with bounded retries, and runs the reaper that applies timeouts and purges
//! finished sessions.
//!
//! Locking: the session table is an `RwLock` (status queries only read it); each session has a
//! `std::sync::Mutex` for its state, held only for non-blocking transitions, and a tokio mutex
//! that serialises its transport sends so chunks leave in arrival order. When both the table and
//! the registry are locked, the table is taken first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::code::{CodeRegistry, TransferCode};
use crate::config::Config;
use crate::error::ShareError;
use crate::format::format_file_size;
use crate::identity::{Role, SessionHandle, SessionId};
use crate::integrity::{Checksum, StreamingChecksum};
use crate::scheduler::{self, RetryPolicy, SendFailure};
use crate::session::{
    ChunkOutcome, FailureReason, FileDescriptor, SessionState, SessionStatus, TransferSession,
};
use crate::transport::{ChunkStream, ChunkTransport};

/// Shortest period the reaper runs at.
pub const MIN_REAPER_INTERVAL: Duration = Duration::from_millis(1);

struct SessionEntry {
    session: Mutex<TransferSession>,
    send_gate: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<SessionStatus>,
}

impl SessionEntry {
    fn lock(&self) -> MutexGuard<'_, TransferSession> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("session lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Push the current status to subscribers. Call with the session lock held so updates are
    /// published in transition order.
    fn publish(&self, session: &TransferSession) {
        self.status_tx.send_replace(session.status());
    }

    fn state(&self) -> SessionState {
        self.lock().state()
    }
}

/// What one reaper pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: Vec<SessionId>,
    pub purged: Vec<SessionId>,
}

pub struct SessionManager {
    config: Config,
    retry: RetryPolicy,
    transport: Arc<dyn ChunkTransport>,
    codes: Mutex<CodeRegistry<SessionId>>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
}

impl SessionManager {
    pub fn new(config: Config, transport: Arc<dyn ChunkTransport>) -> Self {
        let codes = CodeRegistry::new(config.code_attempts);
        Self::with_registry(config, transport, codes)
    }

    /// Manager with a caller-built registry (e.g. seeded for reproducible codes).
    pub fn with_registry(
        config: Config,
        transport: Arc<dyn ChunkTransport>,
        codes: CodeRegistry<SessionId>,
    ) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            config,
            transport,
            codes: Mutex::new(codes),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a session for `file` and issue its code. The caller becomes the sender.
    pub fn create_upload_session(
        &self,
        file: FileDescriptor,
    ) -> Result<(TransferCode, SessionHandle), ShareError> {
        file.validate(self.config.max_file_size)?;

        let mut sessions = self.write_sessions();
        let live = sessions
            .values()
            .filter(|e| !e.state().is_terminal())
            .count();
        if live >= self.config.max_sessions {
            tracing::warn!(live, max = self.config.max_sessions, "session table full");
            return Err(ShareError::CapacityExhausted);
        }

        let mut codes = self.lock_codes();
        let code = codes.allocate()?;
        let id = SessionId::generate();
        codes.bind(&code, id);
        drop(codes);

        let session = TransferSession::new(id, code.clone(), file, Instant::now());
        let (status_tx, _) = watch::channel(session.status());
        tracing::info!(session = %id, code = %code, file = %session.file(), "upload session created");
        sessions.insert(
            id,
            Arc::new(SessionEntry {
                session: Mutex::new(session),
                send_gate: tokio::sync::Mutex::new(()),
                status_tx,
            }),
        );
        Ok((code, SessionHandle::new(id, Role::Sender)))
    }

    /// Match a receiver to the session behind `code`. Returns the file metadata to show the user.
    pub fn join_as_receiver(
        &self,
        code: &str,
    ) -> Result<(FileDescriptor, SessionHandle), ShareError> {
        let code = match TransferCode::parse(code) {
            Ok(code) => code,
            Err(e) => {
                tracing::debug!("rejecting malformed code: {}", e);
                return Err(ShareError::CodeNotFound);
            }
        };
        let id = self.lookup(&code).ok_or(ShareError::CodeNotFound)?;
        let entry = self.entry(id).map_err(|_| ShareError::CodeNotFound)?;

        let mut session = entry.lock();
        if let Err(e) = session.join_receiver(Instant::now()) {
            tracing::warn!(session = %id, code = %code, "join rejected: {}", e);
            return Err(e);
        }
        entry.publish(&session);
        tracing::info!(session = %id, code = %code, "receiver joined");
        Ok((session.file().clone(), SessionHandle::new(id, Role::Receiver)))
    }

    /// Session currently holding `code`, if any.
    pub fn lookup(&self, code: &TransferCode) -> Option<SessionId> {
        self.lock_codes().lookup(code).copied()
    }

    /// Forward one chunk from the sender. Chunks must be pushed in file order; each is checked
    /// against the remaining declared size before it is sent.
    ///
    /// Transient transport errors are retried per the configured policy. A permanent error, or
    /// running out of retries, fails the session.
    pub async fn push_chunk(
        &self,
        handle: SessionHandle,
        chunk: Vec<u8>,
    ) -> Result<SessionStatus, ShareError> {
        if handle.role() != Role::Sender {
            return Err(ShareError::WrongRole);
        }
        let id = handle.id();
        let entry = self.entry(id)?;
        let _gate = entry.send_gate.lock().await;

        {
            let mut session = entry.lock();
            session.touch(Role::Sender, Instant::now());
            session.admit_chunk(chunk.len() as u64)?;
        }

        let transport = &self.transport;
        let sent = scheduler::send_with_retry(
            self.retry,
            || transport.send(id, chunk.clone()),
            || entry.state() == SessionState::Active,
        )
        .await;

        let error = match sent {
            Ok(retries) => {
                if retries > 0 {
                    tracing::info!(session = %id, retries, "chunk delivered after resend");
                }
                return self.commit(&entry, &chunk).await;
            }
            Err(SendFailure::Abandoned) => return Err(ShareError::NotActive(entry.state())),
            Err(SendFailure::Fatal(e)) => e,
        };

        let failed = {
            let mut session = entry.lock();
            let failed = session.fail(FailureReason::Transport(error.to_string()), Instant::now());
            if failed {
                entry.publish(&session);
                tracing::error!(
                    session = %id,
                    bytes = session.bytes_transferred(),
                    "transfer failed: {}",
                    error
                );
                None
            } else {
                Some(session.state())
            }
        };
        match failed {
            None => {
                self.transport.close(id).await;
                Err(ShareError::Transport(error))
            }
            // Cancelled or expired while the send was in flight.
            Some(state) => Err(ShareError::NotActive(state)),
        }
    }

    async fn commit(&self, entry: &SessionEntry, chunk: &[u8]) -> Result<SessionStatus, ShareError> {
        let (outcome, status, id) = {
            let mut session = entry.lock();
            let outcome = session.commit_chunk(chunk, Instant::now())?;
            entry.publish(&session);
            match outcome {
                ChunkOutcome::InProgress => {}
                ChunkOutcome::Completed => tracing::info!(
                    session = %session.id(),
                    size = %format_file_size(session.bytes_transferred()),
                    "transfer completed"
                ),
                ChunkOutcome::ChecksumMismatch => tracing::error!(
                    session = %session.id(),
                    "transfer failed: checksum mismatch"
                ),
            }
            (outcome, session.status(), session.id())
        };
        match outcome {
            ChunkOutcome::InProgress => Ok(status),
            ChunkOutcome::Completed => {
                self.transport.close(id).await;
                Ok(status)
            }
            ChunkOutcome::ChecksumMismatch => {
                self.transport.close(id).await;
                Err(ShareError::ChecksumMismatch)
            }
        }
    }

    /// Take the receive side of the session. Receiver only; once per session.
    pub fn open_download(&self, handle: SessionHandle) -> Result<Download, ShareError> {
        if handle.role() != Role::Receiver {
            return Err(ShareError::WrongRole);
        }
        let id = handle.id();
        let entry = self.entry(id)?;
        let file = {
            let mut session = entry.lock();
            session.open_download()?;
            session.file().clone()
        };
        match self.transport.receive(id) {
            Ok(stream) => Ok(Download::new(file, stream)),
            Err(e) => {
                let mut session = entry.lock();
                if session.fail(FailureReason::Transport(e.to_string()), Instant::now()) {
                    entry.publish(&session);
                    tracing::error!(session = %id, "receive stream unavailable: {}", e);
                }
                Err(ShareError::Transport(e))
            }
        }
    }

    /// Cancel from either end. Idempotent; returns the resulting status.
    pub async fn cancel(&self, handle: SessionHandle) -> Result<SessionStatus, ShareError> {
        let id = handle.id();
        let entry = self.entry(id)?;
        let (cancelled, status) = {
            let mut session = entry.lock();
            let cancelled = session.cancel(Instant::now());
            if cancelled {
                entry.publish(&session);
                tracing::info!(session = %id, by = %handle.role(), "session cancelled");
            }
            (cancelled, session.status())
        };
        if cancelled {
            self.transport.close(id).await;
        }
        Ok(status)
    }

    /// An endpoint went away without a graceful close. Fails a live session; no-op otherwise.
    pub async fn disconnect(&self, handle: SessionHandle) -> Result<SessionStatus, ShareError> {
        let id = handle.id();
        let entry = self.entry(id)?;
        let (failed, status) = {
            let mut session = entry.lock();
            let failed = session.fail(FailureReason::Disconnected(handle.role()), Instant::now());
            if failed {
                entry.publish(&session);
                tracing::warn!(session = %id, "{} disconnected mid-session", handle.role());
            }
            (failed, session.status())
        };
        if failed {
            self.transport.close(id).await;
        }
        Ok(status)
    }

    /// Current status. A sender polling a pending session counts as sender activity.
    pub fn get_status(&self, handle: SessionHandle) -> Result<SessionStatus, ShareError> {
        let entry = self.entry(handle.id())?;
        let mut session = entry.lock();
        session.touch(handle.role(), Instant::now());
        Ok(session.status())
    }

    /// Status updates as they happen, starting with the current status.
    pub fn subscribe(
        &self,
        handle: SessionHandle,
    ) -> Result<watch::Receiver<SessionStatus>, ShareError> {
        Ok(self.entry(handle.id())?.status_tx.subscribe())
    }

    /// Sessions in the table, including terminal ones still in their grace period.
    pub fn session_count(&self) -> usize {
        self.read_sessions().len()
    }

    /// Sessions that are neither terminal nor purged.
    pub fn live_session_count(&self) -> usize {
        self.read_sessions()
            .values()
            .filter(|e| !e.state().is_terminal())
            .count()
    }

    /// Apply timeouts and purge terminal sessions past their grace period, releasing codes.
    pub async fn reap(&self) -> ReapReport {
        let now = Instant::now();
        let entries: Vec<(SessionId, Arc<SessionEntry>)> = self
            .read_sessions()
            .iter()
            .map(|(id, e)| (*id, e.clone()))
            .collect();

        let mut report = ReapReport::default();
        let mut purge = Vec::new();
        for (id, entry) in &entries {
            let mut session = entry.lock();
            if session.expire_if_due(now, &self.config) {
                entry.publish(&session);
                tracing::info!(session = %id, code = %session.code(), "session expired");
                report.expired.push(*id);
            } else if session.purge_due(now, self.config.grace_period) {
                purge.push((*id, session.code().clone()));
            }
        }

        for id in &report.expired {
            self.transport.close(*id).await;
        }

        if !purge.is_empty() {
            let mut sessions = self.write_sessions();
            let mut codes = self.lock_codes();
            for (id, code) in purge {
                sessions.remove(&id);
                codes.release(&code);
                tracing::debug!(session = %id, code = %code, "session purged, code released");
                report.purged.push(id);
            }
        }

        for id in &report.purged {
            self.transport.forget(*id).await;
        }
        report
    }

    /// Run `reap` every `reaper_interval` until the manager is dropped. A zero interval is
    /// raised to `MIN_REAPER_INTERVAL`.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.reaper_interval.max(MIN_REAPER_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let report = manager.reap().await;
                if !report.expired.is_empty() || !report.purged.is_empty() {
                    tracing::debug!(
                        expired = report.expired.len(),
                        purged = report.purged.len(),
                        "reaper pass"
                    );
                }
            }
        })
    }

    /// Cancel every live session, close their transports, and empty the tables.
    pub async fn shutdown(&self) {
        let entries: Vec<(SessionId, Arc<SessionEntry>)> = {
            let mut sessions = self.write_sessions();
            self.lock_codes().clear();
            sessions.drain().collect()
        };
        let now = Instant::now();
        let mut cancelled = 0usize;
        for (id, entry) in entries {
            let live = {
                let mut session = entry.lock();
                let live = session.cancel(now);
                if live {
                    entry.publish(&session);
                }
                live
            };
            if live {
                cancelled += 1;
                self.transport.close(id).await;
            }
            self.transport.forget(id).await;
        }
        tracing::info!(cancelled, "session manager shut down");
    }

    fn entry(&self, id: SessionId) -> Result<Arc<SessionEntry>, ShareError> {
        self.read_sessions()
            .get(&id)
            .cloned()
            .ok_or(ShareError::UnknownSession)
    }

    fn read_sessions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Arc<SessionEntry>>> {
        match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("session table poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_sessions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Arc<SessionEntry>>> {
        match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("session table poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn lock_codes(&self) -> MutexGuard<'_, CodeRegistry<SessionId>> {
        match self.codes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("code registry poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Receiver side of a session: pulls chunks off the transport and verifies them against the
/// declared checksum independently of the sender-side check.
pub struct Download {
    file: FileDescriptor,
    stream: ChunkStream,
    running: StreamingChecksum,
}

impl Download {
    fn new(file: FileDescriptor, stream: ChunkStream) -> Self {
        Self {
            file,
            stream,
            running: StreamingChecksum::new(),
        }
    }

    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    pub fn bytes_received(&self) -> u64 {
        self.running.bytes()
    }

    /// Next chunk, or `None` once the session's transport is closed and drained.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        let chunk = self.stream.next().await?;
        self.running.update(&chunk);
        Some(chunk)
    }

    /// Verify what was received. Call after `next_chunk` returns `None`.
    pub fn finish(self) -> Result<Checksum, ShareError> {
        let received = self.running.bytes();
        if received != self.file.total_size {
            return Err(ShareError::IncompleteTransfer {
                received,
                expected: self.file.total_size,
            });
        }
        let digest = self.running.finalize();
        if digest != self.file.checksum {
            return Err(ShareError::ChecksumMismatch);
        }
        Ok(digest)
    }

    /// Collect the whole file and verify it.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, ShareError> {
        let mut out = Vec::with_capacity(self.file.total_size as usize);
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk);
        }
        self.finish()?;
        Ok(out)
    }
}
