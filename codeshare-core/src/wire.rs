//! Relay framing: every message is a little-endian `u32` payload length followed by the bincode
//! payload. Frames larger than `MAX_FRAME_LEN` are refused on both sides.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
/// Fits a 1 MiB chunk with plenty of headroom.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(FrameEncodeError::TooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(LEN_SIZE + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("cannot serialize message: {0}")]
    Encode(#[from] bincode::Error),
    #[error("message of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
}

/// Payload length announced by a frame header.
pub fn frame_len(header: &[u8]) -> Result<usize, FrameDecodeError> {
    let prefix: [u8; LEN_SIZE] = header
        .get(..LEN_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(FrameDecodeError::NeedMore)?;
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len as usize)
}

/// Decode the frame at the front of `buf`, returning the message and the bytes it used.
/// `NeedMore` means `buf` holds only part of a frame.
pub fn decode_frame(buf: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = frame_len(buf)?;
    let end = LEN_SIZE + len;
    let body = buf.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((decode_payload(body)?, end))
}

/// Decode a frame body whose length prefix was already consumed.
pub fn decode_payload(payload: &[u8]) -> Result<Message, FrameDecodeError> {
    Ok(bincode::deserialize(payload)?)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete frame")]
    NeedMore,
    #[error("announced frame of {0} bytes exceeds the limit")]
    TooLarge(u32),
    #[error("cannot deserialize message: {0}")]
    Decode(#[from] bincode::Error),
}

/// Read one frame from a byte stream. `Ok(None)` on EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Message>> {
    let mut header = [0u8; LEN_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = frame_len(&header).map_err(invalid_data)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload).map(Some).map_err(invalid_data)
}

/// Encode and write one frame, then flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> std::io::Result<()> {
    let frame = encode_frame(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn invalid_data(e: FrameDecodeError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}
