//! Error taxonomy shared by the registry, sessions, and manager.

use serde::{Deserialize, Serialize};

use crate::session::SessionState;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShareError {
    /// Session table or code space is full; retry later.
    #[error("capacity exhausted")]
    CapacityExhausted,
    #[error("code not found")]
    CodeNotFound,
    #[error("code expired")]
    CodeExpired,
    #[error("session already joined")]
    SessionAlreadyJoined,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("invalid file: {0}")]
    InvalidFile(String),
    #[error("chunk of {len} bytes exceeds remaining {remaining} bytes")]
    ChunkOverflow { len: u64, remaining: u64 },
    #[error("empty chunk")]
    EmptyChunk,
    #[error("unknown session")]
    UnknownSession,
    #[error("operation not permitted for this endpoint")]
    WrongRole,
    #[error("session is {0}")]
    NotActive(SessionState),
    #[error("download already open")]
    DownloadAlreadyOpen,
    #[error("transfer incomplete: {received} of {expected} bytes")]
    IncompleteTransfer { received: u64, expected: u64 },
}

/// Wire form of `ShareError`: the kind only, message travels alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    CapacityExhausted,
    CodeNotFound,
    CodeExpired,
    SessionAlreadyJoined,
    TransportTransient,
    TransportPermanent,
    ChecksumMismatch,
    InvalidFile,
    ChunkOverflow,
    UnknownSession,
    WrongRole,
    NotActive,
    IncompleteTransfer,
    Protocol,
}

impl ShareError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShareError::CapacityExhausted => ErrorKind::CapacityExhausted,
            ShareError::CodeNotFound => ErrorKind::CodeNotFound,
            ShareError::CodeExpired => ErrorKind::CodeExpired,
            ShareError::SessionAlreadyJoined => ErrorKind::SessionAlreadyJoined,
            ShareError::Transport(TransportError::Transient(_)) => ErrorKind::TransportTransient,
            ShareError::Transport(TransportError::Permanent(_)) => ErrorKind::TransportPermanent,
            ShareError::ChecksumMismatch => ErrorKind::ChecksumMismatch,
            ShareError::InvalidFile(_) => ErrorKind::InvalidFile,
            ShareError::ChunkOverflow { .. } | ShareError::EmptyChunk => ErrorKind::ChunkOverflow,
            ShareError::UnknownSession => ErrorKind::UnknownSession,
            ShareError::WrongRole | ShareError::DownloadAlreadyOpen => ErrorKind::WrongRole,
            ShareError::NotActive(_) => ErrorKind::NotActive,
            ShareError::IncompleteTransfer { .. } => ErrorKind::IncompleteTransfer,
        }
    }

    /// Errors the user can fix by re-entering input (as opposed to system faults).
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, ShareError::CodeNotFound | ShareError::CodeExpired)
    }
}
