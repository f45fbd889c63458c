//! Relay server: accepts TCP clients, binds each connection to one end of a session, and moves
//! chunks between sender and receiver connections through the session manager.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use codeshare_core::wire::{read_frame, write_frame};
use codeshare_core::{
    Download, Message, SessionHandle, SessionManager, SessionState, PROTOCOL_VERSION,
};
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Outbound frames queued per connection before the reader stops pulling more work.
const OUTBOUND_CAPACITY: usize = 16;

type Outbound = mpsc::Sender<Message>;

/// Accept clients until the listener fails. Each connection runs on its own task.
pub async fn run_relay(listener: TcpListener, manager: Arc<SessionManager>) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "relay listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = run_connection(stream, peer, manager).await {
                tracing::debug!(%peer, "connection closed: {}", e);
            }
        });
    }
}

async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<SessionManager>,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &msg).await {
                tracing::debug!("writer stopped: {}", e);
                break;
            }
        }
    });

    let result = match handshake(&mut reader, &tx).await {
        Ok(true) => serve(&mut reader, &tx, peer, &manager).await,
        Ok(false) => Ok(None),
        Err(e) => Err(e),
    };

    let bound = match &result {
        Ok(bound) => *bound,
        Err(_) => None,
    };
    // A live session whose endpoint vanished fails; terminal sessions are left alone.
    if let Some(handle) = bound {
        if let Ok(status) = manager.disconnect(handle).await {
            tracing::debug!(%peer, role = %handle.role(), state = %status.state, "endpoint left");
        }
    }
    drop(tx);
    let _ = writer_task.await;
    result.map(|_| ())
}

/// Exchange `Hello`. Returns false if the client speaks another protocol version.
async fn handshake<R: AsyncRead + Unpin>(reader: &mut R, tx: &Outbound) -> std::io::Result<bool> {
    match read_frame(reader).await? {
        Some(Message::Hello { protocol_version }) if protocol_version == PROTOCOL_VERSION => {
            send(
                tx,
                Message::Hello {
                    protocol_version: PROTOCOL_VERSION,
                },
            )
            .await;
            Ok(true)
        }
        Some(Message::Hello { protocol_version }) => {
            send(
                tx,
                Message::protocol_error(format!(
                    "unsupported protocol version {} (relay speaks {})",
                    protocol_version, PROTOCOL_VERSION
                )),
            )
            .await;
            Ok(false)
        }
        Some(_) => {
            send(tx, Message::protocol_error("expected Hello")).await;
            Ok(false)
        }
        None => Ok(false),
    }
}

/// Request loop. Returns the handle the connection was bound to, if any.
async fn serve<R: AsyncRead + Unpin>(
    reader: &mut R,
    tx: &Outbound,
    peer: SocketAddr,
    manager: &Arc<SessionManager>,
) -> std::io::Result<Option<SessionHandle>> {
    let mut bound: Option<SessionHandle> = None;
    while let Some(msg) = read_frame(reader).await? {
        match (msg, bound) {
            (Message::CreateUpload { file }, None) => {
                match manager.create_upload_session(file) {
                    Ok((code, handle)) => {
                        tracing::debug!(%peer, session = %handle.id(), "connection bound as sender");
                        send(tx, Message::UploadCreated { code }).await;
                        spawn_sender_watch(manager, handle, tx.clone())?;
                        bound = Some(handle);
                    }
                    Err(e) => send(tx, Message::error(&e)).await,
                }
            }
            (Message::Join { code }, None) => match manager.join_as_receiver(&code) {
                Ok((file, handle)) => {
                    tracing::debug!(%peer, session = %handle.id(), "connection bound as receiver");
                    bound = Some(handle);
                    match manager.open_download(handle) {
                        Ok(download) => {
                            send(tx, Message::Joined { file }).await;
                            tokio::spawn(stream_download(
                                manager.clone(),
                                handle,
                                download,
                                tx.clone(),
                            ));
                        }
                        Err(e) => send(tx, Message::error(&e)).await,
                    }
                }
                Err(e) => {
                    if e.is_user_correctable() {
                        tracing::debug!(%peer, "join refused: {}", e);
                    } else {
                        tracing::warn!(%peer, "join failed: {}", e);
                    }
                    send(tx, Message::error(&e)).await;
                }
            },
            (Message::CreateUpload { .. } | Message::Join { .. }, Some(_)) => {
                send(tx, Message::protocol_error("connection already bound to a session")).await;
            }
            (Message::Chunk { payload }, Some(handle)) => {
                if let Err(e) = manager.push_chunk(handle, payload).await {
                    send(tx, Message::error(&e)).await;
                }
            }
            (Message::Status, Some(handle)) => match manager.get_status(handle) {
                Ok(status) => send(tx, Message::StatusReport { status }).await,
                Err(e) => send(tx, Message::error(&e)).await,
            },
            (Message::Cancel, Some(handle)) => {
                if let Err(e) = manager.cancel(handle).await {
                    send(tx, Message::error(&e)).await;
                }
            }
            (Message::Chunk { .. } | Message::Status | Message::Cancel, None) => {
                send(tx, Message::protocol_error("no session on this connection")).await;
            }
            (other, _) => {
                tracing::debug!(%peer, "unexpected message from client: {:?}", other);
                send(tx, Message::protocol_error("unexpected message")).await;
            }
        }
    }
    Ok(bound)
}

/// Tell the sender when the receiver arrives, then report the final status.
///
/// While the session is pending the open connection counts as sender activity, so a connected
/// sender waits out the join timeout instead of the idle timeout.
fn spawn_sender_watch(
    manager: &Arc<SessionManager>,
    handle: SessionHandle,
    tx: Outbound,
) -> std::io::Result<()> {
    let mut updates = manager
        .subscribe(handle)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let manager = manager.clone();
    let period = (manager.config().idle_timeout / 3).max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut keep_alive = tokio::time::interval(period);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut announced = false;
        loop {
            let status = updates.borrow_and_update().clone();
            if !announced && status.state != SessionState::Pending {
                announced = true;
                if status.state == SessionState::Active {
                    send(&tx, Message::ReceiverJoined).await;
                }
            }
            if status.state.is_terminal() {
                send(&tx, Message::StatusReport { status }).await;
                break;
            }
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = keep_alive.tick(), if status.state == SessionState::Pending => {
                    // A sender status read counts as activity.
                    let _ = manager.get_status(handle);
                }
            }
        }
    });
    Ok(())
}

/// Forward the session's chunks to the receiver, then report the final status.
async fn stream_download(
    manager: Arc<SessionManager>,
    handle: SessionHandle,
    mut download: Download,
    tx: Outbound,
) {
    while let Some(payload) = download.next_chunk().await {
        if tx.send(Message::ChunkData { payload }).await.is_err() {
            return;
        }
    }
    let received = download.bytes_received();
    if let Err(e) = download.finish() {
        tracing::warn!(session = %handle.id(), received, "download did not verify: {}", e);
    }
    match manager.get_status(handle) {
        Ok(status) => send(&tx, Message::StatusReport { status }).await,
        Err(e) => send(&tx, Message::error(&e)).await,
    }
}

async fn send(tx: &Outbound, msg: Message) {
    // Only fails once the writer has stopped, i.e. the client is gone.
    let _ = tx.send(msg).await;
}
