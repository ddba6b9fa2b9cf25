use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::radtunnel::net;

const MAGIC_CONTROL: &[u8; 4] = b"RTCL"; // RadTunnel Control
const PROTOCOL_V1: u8 = 1;

/// Upper bound for the destination carried by an address frame.
pub const MAX_ADDRESS_BYTES: u16 = 1024;

const KIND_PING: u8 = 1;
const KIND_PONG: u8 = 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("truncated frame")]
    Truncated,
    #[error("empty destination address")]
    EmptyAddress,
    #[error("destination address too long: {0} bytes")]
    AddressTooLong(usize),
    #[error("destination address is not valid utf-8")]
    InvalidUtf8,
    #[error("destination address {0:?} is not host:port")]
    InvalidAddress(String),
    #[error("unknown control frame kind {0}")]
    UnknownControlKind(u8),
    #[error("unknown dial reply {0}")]
    UnknownReply(u8),
    #[error("io: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(err)
        }
    }
}

/// Validate a destination and build its address frame:
/// `u16be len` + `len` bytes of UTF-8 `host:port`.
pub fn encode_address_frame(target: &str) -> Result<BytesMut, ProtocolError> {
    let target = validate_address(target)?;
    let b = target.as_bytes();
    let mut out = BytesMut::with_capacity(2 + b.len());
    // validate_address bounds the length to MAX_ADDRESS_BYTES.
    out.put_u16(b.len() as u16);
    out.put_slice(b);
    Ok(out)
}

/// Write the address frame in a single write so no relayed byte can precede it.
pub async fn write_address_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    target: &str,
) -> Result<(), ProtocolError> {
    let frame = encode_address_frame(target)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Read exactly one address frame. Never reads past the frame.
pub async fn read_address_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    let n = r.read_u16().await?;
    if n == 0 {
        return Err(ProtocolError::EmptyAddress);
    }
    if n > MAX_ADDRESS_BYTES {
        return Err(ProtocolError::AddressTooLong(n as usize));
    }

    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    let s = String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(validate_address(&s)?.to_string())
}

fn validate_address(target: &str) -> Result<&str, ProtocolError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(ProtocolError::EmptyAddress);
    }
    if target.len() > MAX_ADDRESS_BYTES as usize {
        return Err(ProtocolError::AddressTooLong(target.len()));
    }
    if net::split_host_port(target).is_none() {
        return Err(ProtocolError::InvalidAddress(target.to_string()));
    }
    Ok(target)
}

/// Outcome of rad-server's destination dial, sent back as one byte before any
/// relayed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DialReply {
    Connected = 0,
    BadRequest = 1,
    Refused = 2,
    Unreachable = 3,
    TimedOut = 4,
    Failed = 5,
}

impl DialReply {
    pub fn from_io_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => DialReply::Refused,
            ErrorKind::TimedOut => DialReply::TimedOut,
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable | ErrorKind::NotFound => {
                DialReply::Unreachable
            }
            _ => DialReply::Failed,
        }
    }
}

impl TryFrom<u8> for DialReply {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => DialReply::Connected,
            1 => DialReply::BadRequest,
            2 => DialReply::Refused,
            3 => DialReply::Unreachable,
            4 => DialReply::TimedOut,
            5 => DialReply::Failed,
            other => return Err(ProtocolError::UnknownReply(other)),
        })
    }
}

impl std::fmt::Display for DialReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DialReply::Connected => "connected",
            DialReply::BadRequest => "bad request",
            DialReply::Refused => "connection refused",
            DialReply::Unreachable => "destination unreachable",
            DialReply::TimedOut => "connect timed out",
            DialReply::Failed => "connect failed",
        };
        f.write_str(s)
    }
}

pub async fn write_dial_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    reply: DialReply,
) -> Result<(), ProtocolError> {
    w.write_u8(reply as u8).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_dial_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<DialReply, ProtocolError> {
    DialReply::try_from(r.read_u8().await?)
}

/// Liveness frames carried on the control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Ping(u64),
    Pong(u64),
}

pub async fn write_control_hello<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), ProtocolError> {
    let mut out = [0u8; 5];
    out[..4].copy_from_slice(MAGIC_CONTROL);
    out[4] = PROTOCOL_V1;
    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_control_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != MAGIC_CONTROL {
        return Err(ProtocolError::BadMagic);
    }
    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }
    Ok(())
}

pub async fn write_control_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: ControlFrame,
) -> Result<(), ProtocolError> {
    let (kind, seq) = match frame {
        ControlFrame::Ping(seq) => (KIND_PING, seq),
        ControlFrame::Pong(seq) => (KIND_PONG, seq),
    };
    let mut out = BytesMut::with_capacity(9);
    out.put_u8(kind);
    out.put_u64(seq);
    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_control_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ControlFrame, ProtocolError> {
    let kind = r.read_u8().await?;
    let seq = r.read_u64().await?;
    match kind {
        KIND_PING => Ok(ControlFrame::Ping(seq)),
        KIND_PONG => Ok(ControlFrame::Pong(seq)),
        other => Err(ProtocolError::UnknownControlKind(other)),
    }
}
