//! Wire format between the sender and the receiver.
//!
//! Strict request/response: the sender writes one request frame and waits
//! for exactly one response frame before issuing the next call.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8).
//! Frame format: len:u32 | type:u8 | payload

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version announced in the identity check
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    CheckIdentity = 0x01,
    StartStorageGroup = 0x02,
    InitTransfer = 0x03,
    SendChunk = 0x04,
    CheckDigest = 0x05,
    NotifyDeletedName = 0x06,
    EndSession = 0x07,
    Status = 0x10,
    Digest = 0x11,
    Fatal = 0x12,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::CheckIdentity),
            0x02 => Some(Self::StartStorageGroup),
            0x03 => Some(Self::InitTransfer),
            0x04 => Some(Self::SendChunk),
            0x05 => Some(Self::CheckDigest),
            0x06 => Some(Self::NotifyDeletedName),
            0x07 => Some(Self::EndSession),
            0x10 => Some(Self::Status),
            0x11 => Some(Self::Digest),
            0x12 => Some(Self::Fatal),
            _ => None,
        }
    }
}

// =============================================================================
// Requests (sender -> receiver)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CheckIdentity { version: u16, address: String },
    StartStorageGroup { name: String },
    InitTransfer { name: String },
    SendChunk { data: Bytes },
    CheckDigest { digest: String },
    NotifyDeletedName { name: String },
    EndSession,
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::CheckIdentity { .. } => MessageType::CheckIdentity,
            Request::StartStorageGroup { .. } => MessageType::StartStorageGroup,
            Request::InitTransfer { .. } => MessageType::InitTransfer,
            Request::SendChunk { .. } => MessageType::SendChunk,
            Request::CheckDigest { .. } => MessageType::CheckDigest,
            Request::NotifyDeletedName { .. } => MessageType::NotifyDeletedName,
            Request::EndSession => MessageType::EndSession,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        match self {
            Request::CheckIdentity { version, address } => {
                payload.put_u16(*version);
                put_string(&mut payload, address)?;
            }
            Request::StartStorageGroup { name }
            | Request::InitTransfer { name }
            | Request::NotifyDeletedName { name } => put_string(&mut payload, name)?,
            Request::SendChunk { data } => {
                payload.put_u32(data.len() as u32);
                payload.put_slice(data);
            }
            Request::CheckDigest { digest } => put_string(&mut payload, digest)?,
            Request::EndSession => {}
        }
        frame(self.message_type(), payload)
    }

    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> Result<Self> {
        let request = match msg_type {
            MessageType::CheckIdentity => {
                if payload.remaining() < 2 {
                    anyhow::bail!("CheckIdentity payload too short");
                }
                let version = payload.get_u16();
                let address = get_string(&mut payload, "CheckIdentity address")?;
                Request::CheckIdentity { version, address }
            }
            MessageType::StartStorageGroup => Request::StartStorageGroup {
                name: get_string(&mut payload, "StartStorageGroup name")?,
            },
            MessageType::InitTransfer => Request::InitTransfer {
                name: get_string(&mut payload, "InitTransfer name")?,
            },
            MessageType::SendChunk => {
                if payload.remaining() < 4 {
                    anyhow::bail!("SendChunk payload too short");
                }
                let len = payload.get_u32() as usize;
                if payload.remaining() < len {
                    anyhow::bail!(
                        "SendChunk data truncated: expected {} bytes, got {}",
                        len,
                        payload.remaining()
                    );
                }
                Request::SendChunk {
                    data: payload.copy_to_bytes(len),
                }
            }
            MessageType::CheckDigest => Request::CheckDigest {
                digest: get_string(&mut payload, "CheckDigest digest")?,
            },
            MessageType::NotifyDeletedName => Request::NotifyDeletedName {
                name: get_string(&mut payload, "NotifyDeletedName name")?,
            },
            MessageType::EndSession => Request::EndSession,
            other => anyhow::bail!("{:?} is not a request", other),
        };
        Ok(request)
    }
}

// =============================================================================
// Responses (receiver -> sender)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Status { ok: bool },
    Digest { digest: String },
    Fatal { code: u16, message: String },
}

impl Response {
    pub const STATUS_OK: u8 = 0;
    pub const STATUS_FAILURE: u8 = 1;

    pub fn ok() -> Self {
        Response::Status { ok: true }
    }

    pub fn failure() -> Self {
        Response::Status { ok: false }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        let msg_type = match self {
            Response::Status { ok } => {
                payload.put_u8(if *ok {
                    Self::STATUS_OK
                } else {
                    Self::STATUS_FAILURE
                });
                MessageType::Status
            }
            Response::Digest { digest } => {
                put_string(&mut payload, digest)?;
                MessageType::Digest
            }
            Response::Fatal { code, message } => {
                payload.put_u16(*code);
                put_string(&mut payload, message)?;
                MessageType::Fatal
            }
        };
        frame(msg_type, payload)
    }

    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> Result<Self> {
        let response = match msg_type {
            MessageType::Status => {
                if payload.remaining() < 1 {
                    anyhow::bail!("Status payload too short");
                }
                Response::Status {
                    ok: payload.get_u8() == Self::STATUS_OK,
                }
            }
            MessageType::Digest => Response::Digest {
                digest: get_string(&mut payload, "Digest")?,
            },
            MessageType::Fatal => {
                if payload.remaining() < 2 {
                    anyhow::bail!("Fatal payload too short");
                }
                let code = payload.get_u16();
                let message = get_string(&mut payload, "Fatal message")?;
                Response::Fatal { code, message }
            }
            other => anyhow::bail!("{:?} is not a response", other),
        };
        Ok(response)
    }
}

// =============================================================================
// Field helpers
// =============================================================================

fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len())
        .with_context(|| format!("String of {} bytes does not fit a frame field", bytes.len()))?;
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} length truncated", what);
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        );
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .with_context(|| format!("Invalid UTF-8 in {}", what))
}

fn frame(msg_type: MessageType, payload: BytesMut) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_SIZE as usize {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            payload.len(),
            MAX_FRAME_SIZE
        );
    }
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type).context("Unknown message type")?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    w.flush().await.context("Failed to flush frame")?;
    Ok(())
}
