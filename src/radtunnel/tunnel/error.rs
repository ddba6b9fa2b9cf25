use thiserror::Error;

use crate::radtunnel::tunnel::protocol::{DialReply, ProtocolError};

/// Failures at the session and logical-stream layer.
///
/// Only `SessionLost` is session-wide; everything else is scoped to one
/// logical stream and is handled at the stream handler / front-end boundary.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("startup: {0:#}")]
    Startup(anyhow::Error),
    #[error("no tunnel session connected")]
    NoTunnel,
    #[error("open stream: {0:#}")]
    StreamOpen(anyhow::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("dial {target}: {reason}")]
    Dial { target: String, reason: DialReply },
    #[error("relay: {0}")]
    Relay(#[source] std::io::Error),
    #[error("session lost: {0}")]
    SessionLost(String),
}

impl TunnelError {
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::Startup(_) => "startup",
            TunnelError::NoTunnel => "no_tunnel",
            TunnelError::StreamOpen(_) => "stream_open",
            TunnelError::Protocol(_) => "protocol",
            TunnelError::Dial { .. } => "dial",
            TunnelError::Relay(_) => "relay",
            TunnelError::SessionLost(_) => "session_lost",
        }
    }
}
