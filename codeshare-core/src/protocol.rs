//! Relay wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::code::TransferCode;
use crate::error::{ErrorKind, ShareError};
use crate::session::{FileDescriptor, SessionStatus};

/// Current protocol version. Exchanged in `Hello` before anything else.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
///
/// A connection carries one endpoint: the first successful `CreateUpload` makes it the sender,
/// the first successful `Join` the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Both directions, first frame on a connection.
    Hello { protocol_version: u8 },
    /// Client: open an upload session for this file.
    CreateUpload { file: FileDescriptor },
    /// Relay: upload session opened; share this code with the receiver. The session waits for a
    /// receiver up to the join timeout for as long as this connection stays open.
    UploadCreated { code: TransferCode },
    /// Client: join the session behind a code (as typed by the user).
    Join { code: String },
    /// Relay: joined; the file being received.
    Joined { file: FileDescriptor },
    /// Relay to sender: the receiver is bound, start pushing chunks.
    ReceiverJoined,
    /// Sender to relay: next chunk of the file, in order.
    Chunk { payload: Vec<u8> },
    /// Relay to receiver: next chunk of the file, in order.
    ChunkData { payload: Vec<u8> },
    /// Client: request a status report.
    Status,
    /// Relay: current status (also sent unprompted when the session ends).
    StatusReport { status: SessionStatus },
    /// Client: cancel the session.
    Cancel,
    /// Relay: the last request failed.
    Error { kind: ErrorKind, message: String },
}

impl Message {
    pub fn error(err: &ShareError) -> Self {
        Message::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Message::Error {
            kind: ErrorKind::Protocol,
            message: message.into(),
        }
    }
}
