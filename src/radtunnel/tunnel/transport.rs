use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// One logical stream of a multiplexed session.
pub struct TransportStream {
    /// Identifier assigned by the transport (QUIC stream index / yamux id).
    pub id: u64,
    pub io: BoxedStream,
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

pub const ALPN: &[u8] = b"radtunnel/1";

#[derive(Debug, Clone, Default)]
pub struct TlsListenOptions {
    /// PEM certificate chain; empty together with `key_file` to self-sign.
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct TlsDialOptions {
    pub server_name: String,
    pub insecure_skip_verify: bool,
    /// PEM roots to trust instead of the webpki set.
    pub ca_file: Option<PathBuf>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(
        &self,
        addr: &str,
        opts: TlsListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(
        &self,
        addr: &str,
        opts: TlsDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

/// Returned by [`TransportListener::accept`] once the listener can no longer
/// produce sessions. Any other accept error concerns a single peer.
#[derive(Debug, thiserror::Error)]
#[error("tunnel: listener closed")]
pub struct ListenerClosed;

/// One accepted session, or the reason a single peer failed its handshake.
pub type Accepted = anyhow::Result<Arc<dyn TransportSession>>;

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// Capability set of a multiplexed tunnel connection.
///
/// Closing the session must make every pending stream operation, on every
/// stream of this session, return promptly.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<TransportStream>;
    async fn accept_stream(&self) -> anyhow::Result<TransportStream>;
    async fn close(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
    #[allow(dead_code)]
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "quic".into();
    }
    match n.as_str() {
        "quic" | "tcp" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected quic|tcp)"),
    }
}

pub mod quic;
pub mod tcp;
pub mod tls;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        _ => Ok(Arc::new(quic::QuicTransport::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names() {
        assert_eq!(parse_transport("").unwrap(), "quic");
        assert_eq!(parse_transport(" TCP ").unwrap(), "tcp");
        assert!(parse_transport("udp").is_err());
        assert_eq!(transport_by_name("quic").unwrap().name(), "quic");
        assert_eq!(transport_by_name("tcp").unwrap().name(), "tcp");
    }
}
