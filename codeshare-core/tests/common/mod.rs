#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use codeshare_core::{
    ChunkStream, ChunkTransport, Config, MemoryTransport, SessionId, SessionManager,
    TransportError,
};

pub const MIB: usize = 1024 * 1024;

/// Deterministic file contents of `len` bytes.
pub fn file_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 256) as u8).collect()
}

pub fn manager_with(config: Config, transport: Arc<dyn ChunkTransport>) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(config, transport))
}

pub fn memory_manager(config: Config) -> Arc<SessionManager> {
    let transport = Arc::new(MemoryTransport::new(config.lane_capacity));
    manager_with(config, transport)
}

/// What the faulty transport does once `after_bytes` have been delivered.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Fail every later send permanently.
    Permanent,
    /// Fail the next `times` sends transiently, then recover.
    Transient { times: u32 },
}

/// Lossless in-memory transport that starts failing after a byte threshold.
pub struct FaultyTransport {
    inner: MemoryTransport,
    after_bytes: u64,
    fault: Fault,
    delivered: AtomicU64,
    injected: AtomicU32,
    attempts: AtomicU32,
}

impl FaultyTransport {
    pub fn new(after_bytes: u64, fault: Fault) -> Self {
        Self {
            inner: MemoryTransport::new(64),
            after_bytes,
            fault,
            delivered: AtomicU64::new(0),
            injected: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    /// Send calls made, including failed ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Faults injected so far.
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkTransport for FaultyTransport {
    async fn send(&self, session: SessionId, chunk: Vec<u8>) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.delivered.load(Ordering::SeqCst) >= self.after_bytes {
            match self.fault {
                Fault::Permanent => {
                    self.injected.fetch_add(1, Ordering::SeqCst);
                    return Err(TransportError::Permanent("link reset".into()));
                }
                Fault::Transient { times } => {
                    if self.injected.load(Ordering::SeqCst) < times {
                        self.injected.fetch_add(1, Ordering::SeqCst);
                        return Err(TransportError::Transient("congested".into()));
                    }
                }
            }
        }
        let len = chunk.len() as u64;
        self.inner.send(session, chunk).await?;
        self.delivered.fetch_add(len, Ordering::SeqCst);
        Ok(())
    }

    fn receive(&self, session: SessionId) -> Result<ChunkStream, TransportError> {
        self.inner.receive(session)
    }

    async fn close(&self, session: SessionId) {
        self.inner.close(session).await
    }

    async fn forget(&self, session: SessionId) {
        self.inner.forget(session).await
    }
}
