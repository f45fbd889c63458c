//! Chunk transport: the byte channel between a session's sender and receiver.
//!
//! The session manager only needs ordered per-session delivery, a finite receive stream,
//! and a close signal. `MemoryTransport` is the in-process adapter used by the relay daemon,
//! where both endpoints are connections to the same process.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::identity::SessionId;

/// Lazy, finite, non-restartable sequence of chunks for one session.
pub type ChunkStream = BoxStream<'static, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Worth retrying: congestion, momentary link loss.
    #[error("transient: {0}")]
    Transient(String),
    /// Not worth retrying: channel closed, peer gone.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

#[async_trait]
pub trait ChunkTransport: Send + Sync + 'static {
    /// Deliver one chunk. Chunks of one session arrive in the order sent.
    async fn send(&self, session: SessionId, chunk: Vec<u8>) -> Result<(), TransportError>;

    /// Take the receive side of a session. May only be taken once.
    fn receive(&self, session: SessionId) -> Result<ChunkStream, TransportError>;

    /// Stop accepting chunks for a session. Buffered chunks still reach the receiver.
    async fn close(&self, session: SessionId);

    /// Drop everything still held for a session. Called once the session is purged; the id
    /// is never used again.
    async fn forget(&self, session: SessionId);
}

/// Default chunks buffered per session before `send` waits.
pub const DEFAULT_LANE_CAPACITY: usize = 8;

struct Lane {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
    closed: CancellationToken,
}

#[derive(Default)]
struct Lanes {
    open: HashMap<SessionId, Lane>,
    closed: HashSet<SessionId>,
}

/// Lossless in-process transport: one bounded queue per session.
pub struct MemoryTransport {
    capacity: usize,
    lanes: Mutex<Lanes>,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lanes: Mutex::new(Lanes::default()),
        }
    }

    /// Sessions with a lane or a close marker.
    pub fn tracked_sessions(&self) -> usize {
        let lanes = self.lock();
        lanes.open.len() + lanes.closed.len()
    }

    /// Sender half and close token for a session, creating the lane on first use.
    fn lane_handle(
        &self,
        session: SessionId,
    ) -> Result<(mpsc::Sender<Vec<u8>>, CancellationToken), TransportError> {
        let mut lanes = self.lock();
        if lanes.closed.contains(&session) {
            return Err(TransportError::Permanent("session closed".into()));
        }
        let capacity = self.capacity;
        let lane = lanes.open.entry(session).or_insert_with(|| new_lane(capacity));
        Ok((lane.tx.clone(), lane.closed.clone()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lanes> {
        match self.lanes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("transport lane table poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn new_lane(capacity: usize) -> Lane {
    let (tx, rx) = mpsc::channel(capacity);
    Lane {
        tx,
        rx: Some(rx),
        closed: CancellationToken::new(),
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(DEFAULT_LANE_CAPACITY)
    }
}

#[async_trait]
impl ChunkTransport for MemoryTransport {
    async fn send(&self, session: SessionId, chunk: Vec<u8>) -> Result<(), TransportError> {
        let (tx, closed) = self.lane_handle(session)?;
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(TransportError::Permanent("session closed".into())),
            sent = tx.send(chunk) => sent.map_err(|_| TransportError::Permanent("receiver dropped".into())),
        }
    }

    fn receive(&self, session: SessionId) -> Result<ChunkStream, TransportError> {
        let mut lanes = self.lock();
        if lanes.closed.contains(&session) {
            return Err(TransportError::Permanent("session closed".into()));
        }
        let capacity = self.capacity;
        let lane = lanes.open.entry(session).or_insert_with(|| new_lane(capacity));
        let rx = lane
            .rx
            .take()
            .ok_or_else(|| TransportError::Permanent("receive stream already taken".into()))?;
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })))
    }

    async fn close(&self, session: SessionId) {
        let mut lanes = self.lock();
        if let Some(lane) = lanes.open.remove(&session) {
            lane.closed.cancel();
        }
        lanes.closed.insert(session);
    }

    async fn forget(&self, session: SessionId) {
        let mut lanes = self.lock();
        if let Some(lane) = lanes.open.remove(&session) {
            lane.closed.cancel();
        }
        lanes.closed.remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn chunks_arrive_in_order() {
        let t = MemoryTransport::new(4);
        let id = SessionId::generate();
        let mut rx = t.receive(id).unwrap();
        for i in 0..3u8 {
            t.send(id, vec![i; 4]).await.unwrap();
        }
        for i in 0..3u8 {
            assert_eq!(rx.next().await, Some(vec![i; 4]));
        }
    }

    #[tokio::test]
    async fn send_before_receive_is_buffered() {
        let t = MemoryTransport::new(2);
        let id = SessionId::generate();
        t.send(id, vec![1]).await.unwrap();
        let mut rx = t.receive(id).unwrap();
        assert_eq!(rx.next().await, Some(vec![1]));
    }

    #[tokio::test]
    async fn receive_is_not_restartable() {
        let t = MemoryTransport::default();
        let id = SessionId::generate();
        let _rx = t.receive(id).unwrap();
        assert!(matches!(t.receive(id), Err(TransportError::Permanent(_))));
    }

    #[tokio::test]
    async fn close_drains_buffer_then_ends_stream() {
        let t = MemoryTransport::new(4);
        let id = SessionId::generate();
        let mut rx = t.receive(id).unwrap();
        t.send(id, vec![7]).await.unwrap();
        t.send(id, vec![8]).await.unwrap();
        t.close(id).await;
        assert_eq!(rx.next().await, Some(vec![7]));
        assert_eq!(rx.next().await, Some(vec![8]));
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn send_after_close_is_permanent() {
        let t = MemoryTransport::default();
        let id = SessionId::generate();
        t.close(id).await;
        let err = t.send(id, vec![1]).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(t.receive(id).is_err());
    }

    #[tokio::test]
    async fn close_unblocks_full_lane() {
        let t = Arc::new(MemoryTransport::new(1));
        let id = SessionId::generate();
        let _rx = t.receive(id).unwrap();
        t.send(id, vec![1]).await.unwrap();

        let blocked = {
            let t = t.clone();
            tokio::spawn(async move { t.send(id, vec![2]).await })
        };
        tokio::task::yield_now().await;
        t.close(id).await;
        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(TransportError::Permanent(_))));
    }

    #[tokio::test]
    async fn dropped_receiver_fails_send() {
        let t = MemoryTransport::default();
        let id = SessionId::generate();
        drop(t.receive(id).unwrap());
        assert!(matches!(
            t.send(id, vec![1]).await,
            Err(TransportError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn forget_drops_close_marker() {
        let t = MemoryTransport::default();
        let id = SessionId::generate();
        let _rx = t.receive(id).unwrap();
        t.close(id).await;
        assert_eq!(t.tracked_sessions(), 1);
        t.forget(id).await;
        assert_eq!(t.tracked_sessions(), 0);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let t = MemoryTransport::default();
        let a = SessionId::generate();
        let b = SessionId::generate();
        let mut rx_a = t.receive(a).unwrap();
        let mut rx_b = t.receive(b).unwrap();
        t.send(b, vec![2]).await.unwrap();
        t.send(a, vec![1]).await.unwrap();
        t.close(b).await;
        assert_eq!(rx_a.next().await, Some(vec![1]));
        assert_eq!(rx_b.next().await, Some(vec![2]));
        assert_eq!(rx_b.next().await, None);
    }
}
