//! Code-mediated file transfer: short transfer codes, per-file transfer sessions, and the
//! session manager that pairs senders with receivers and moves chunks between them.
//! No sockets here; hosts supply a `ChunkTransport` and drive the manager.

pub mod chunk;
pub mod code;
pub mod config;
pub mod error;
pub mod format;
pub mod identity;
pub mod integrity;
pub mod manager;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod wire;

pub use code::{CodeRegistry, TransferCode};
pub use config::Config;
pub use error::{ErrorKind, ShareError};
pub use identity::{Role, SessionHandle, SessionId};
pub use integrity::Checksum;
pub use manager::{Download, ReapReport, SessionManager};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use session::{FailureReason, FileDescriptor, SessionState, SessionStatus};
pub use transport::{ChunkStream, ChunkTransport, MemoryTransport, TransportError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
