//! Transfer session: lifecycle and byte accounting for one file moving from one sender to one
//! receiver.
//!
//! `TransferSession` is plain state. It never blocks and never does I/O; the manager wraps each
//! session in its own lock and performs transport sends outside it. All transitions go through
//! the methods here so the progress invariants hold:
//!
//! - `bytes_transferred` only grows, and only while `Active`.
//! - `bytes_transferred` never exceeds `file.total_size`.
//! - progress is exactly 1.0 only in `Completed`.
//! - terminal states are final.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::chunk::{self, ChunkError, ChunkRange};
use crate::code::TransferCode;
use crate::config::Config;
use crate::error::ShareError;
use crate::format::format_file_size;
use crate::identity::{Role, SessionId};
use crate::integrity::{Checksum, StreamingChecksum};

/// Metadata the sender declares up front. Immutable for the life of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub total_size: u64,
    pub checksum: Checksum,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, total_size: u64, checksum: Checksum) -> Self {
        Self {
            name: name.into(),
            total_size,
            checksum,
        }
    }

    /// Describe an in-memory payload.
    pub fn for_payload(name: impl Into<String>, payload: &[u8]) -> Self {
        Self::new(name, payload.len() as u64, Checksum::of(payload))
    }

    pub fn validate(&self, max_file_size: u64) -> Result<(), ShareError> {
        if self.name.trim().is_empty() {
            return Err(ShareError::InvalidFile("file name is empty".into()));
        }
        if self.total_size == 0 {
            return Err(ShareError::InvalidFile("file is empty".into()));
        }
        if self.total_size > max_file_size {
            return Err(ShareError::InvalidFile(format!(
                "{} exceeds the {} limit",
                format_file_size(self.total_size),
                format_file_size(max_file_size)
            )));
        }
        Ok(())
    }
}

impl fmt::Display for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, format_file_size(self.total_size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Code issued, waiting for the receiver.
    Pending,
    /// Both ends bound; chunks flowing.
    Active,
    Completed,
    Cancelled,
    Failed,
    Expired,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Cancelled
                | SessionState::Failed
                | SessionState::Expired
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
            SessionState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ChecksumMismatch,
    Transport(String),
    /// An endpoint went away without cancelling.
    Disconnected(Role),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ChecksumMismatch => f.write_str("checksum mismatch"),
            FailureReason::Transport(msg) => write!(f, "transport failure: {}", msg),
            FailureReason::Disconnected(role) => write!(f, "{} disconnected", role),
        }
    }
}

/// Point-in-time view returned by status queries and published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Fraction of bytes moved, in [0, 1]. Exactly 1.0 only when `Completed`.
    pub progress: f64,
    pub bytes_transferred: u64,
    pub total_size: u64,
    pub failure: Option<FailureReason>,
}

/// Result of accounting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    InProgress,
    Completed,
    ChecksumMismatch,
}

pub struct TransferSession {
    id: SessionId,
    code: TransferCode,
    file: FileDescriptor,
    state: SessionState,
    bytes_transferred: u64,
    created_at: Instant,
    last_activity_at: Instant,
    ended_at: Option<Instant>,
    receiver_joined: bool,
    download_open: bool,
    running: StreamingChecksum,
    failure: Option<FailureReason>,
}

impl TransferSession {
    pub fn new(id: SessionId, code: TransferCode, file: FileDescriptor, now: Instant) -> Self {
        Self {
            id,
            code,
            file,
            state: SessionState::Pending,
            bytes_transferred: 0,
            created_at: now,
            last_activity_at: now,
            ended_at: None,
            receiver_joined: false,
            download_open: false,
            running: StreamingChecksum::new(),
            failure: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn code(&self) -> &TransferCode {
        &self.code
    }

    pub fn file(&self) -> &FileDescriptor {
        &self.file
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn progress(&self) -> f64 {
        if self.state == SessionState::Completed {
            return 1.0;
        }
        let ratio = (self.bytes_transferred as f64 / self.file.total_size as f64).clamp(0.0, 1.0);
        if ratio >= 1.0 {
            // All bytes counted but not verified: stay just short of done.
            1.0 - f64::EPSILON
        } else {
            ratio
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            progress: self.progress(),
            bytes_transferred: self.bytes_transferred,
            total_size: self.file.total_size,
            failure: self.failure.clone(),
        }
    }

    /// Record endpoint liveness. Only the sender keeps a pending session alive; once active,
    /// only chunk traffic counts.
    pub fn touch(&mut self, role: Role, now: Instant) {
        if self.state == SessionState::Pending && role == Role::Sender {
            self.last_activity_at = now;
        }
    }

    /// Bind the receiver. Moves `Pending` to `Active`.
    pub fn join_receiver(&mut self, now: Instant) -> Result<(), ShareError> {
        if self.state.is_terminal() {
            return Err(ShareError::CodeExpired);
        }
        if self.receiver_joined {
            return Err(ShareError::SessionAlreadyJoined);
        }
        self.receiver_joined = true;
        self.state = SessionState::Active;
        self.last_activity_at = now;
        Ok(())
    }

    /// Mark the receive stream as taken. It can only be opened once.
    pub fn open_download(&mut self) -> Result<(), ShareError> {
        if self.download_open {
            return Err(ShareError::DownloadAlreadyOpen);
        }
        if self.state != SessionState::Active {
            return Err(ShareError::NotActive(self.state));
        }
        self.download_open = true;
        Ok(())
    }

    /// Check that a chunk of `len` bytes may be sent now. Does not change state.
    pub fn admit_chunk(&self, len: u64) -> Result<ChunkRange, ShareError> {
        if self.state != SessionState::Active {
            return Err(ShareError::NotActive(self.state));
        }
        chunk::next_range(self.bytes_transferred, self.file.total_size, len).map_err(|e| match e {
            ChunkError::Empty => ShareError::EmptyChunk,
            ChunkError::Overflow { len, remaining } => ShareError::ChunkOverflow { len, remaining },
        })
    }

    /// Account a chunk the transport accepted. On the final byte, verifies the running checksum
    /// and moves to `Completed` or `Failed`.
    pub fn commit_chunk(&mut self, chunk: &[u8], now: Instant) -> Result<ChunkOutcome, ShareError> {
        let range = self.admit_chunk(chunk.len() as u64)?;
        self.running.update(chunk);
        self.bytes_transferred = range.end;
        self.last_activity_at = now;
        if self.bytes_transferred < self.file.total_size {
            return Ok(ChunkOutcome::InProgress);
        }
        let digest = std::mem::take(&mut self.running).finalize();
        if digest == self.file.checksum {
            self.finish(SessionState::Completed, now);
            Ok(ChunkOutcome::Completed)
        } else {
            self.failure = Some(FailureReason::ChecksumMismatch);
            self.finish(SessionState::Failed, now);
            Ok(ChunkOutcome::ChecksumMismatch)
        }
    }

    /// Explicit cancel by either party. Returns false if already terminal.
    pub fn cancel(&mut self, now: Instant) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.finish(SessionState::Cancelled, now);
        true
    }

    /// Returns false if already terminal.
    pub fn fail(&mut self, reason: FailureReason, now: Instant) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.failure = Some(reason);
        self.finish(SessionState::Failed, now);
        true
    }

    /// Apply join and idle timeouts. Returns true if the session just expired.
    pub fn expire_if_due(&mut self, now: Instant, config: &Config) -> bool {
        let due = match self.state {
            SessionState::Pending => {
                elapsed(self.created_at, now) >= config.join_timeout
                    || elapsed(self.last_activity_at, now) >= config.idle_timeout
            }
            SessionState::Active => elapsed(self.last_activity_at, now) >= config.idle_timeout,
            _ => false,
        };
        if due {
            self.finish(SessionState::Expired, now);
        }
        due
    }

    /// True once a terminal session has outlived the grace period.
    pub fn purge_due(&self, now: Instant, grace: Duration) -> bool {
        match self.ended_at {
            Some(ended) => elapsed(ended, now) >= grace,
            None => false,
        }
    }

    fn finish(&mut self, state: SessionState, now: Instant) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.ended_at = Some(now);
    }
}

fn elapsed(since: Instant, now: Instant) -> Duration {
    now.saturating_duration_since(since)
}
