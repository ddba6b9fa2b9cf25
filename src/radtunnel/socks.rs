//! SOCKS5 (RFC 1928) front-end, CONNECT only.
//!
//! The engine parses the handshake and hands the requested destination to a
//! [`Connector`]; whatever stream the connector returns is relayed to the
//! client.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinSet,
};

use crate::radtunnel::net;
use crate::radtunnel::tunnel::{
    error::TunnelError,
    relay::{self, RelayOptions},
    transport::BoxedStream,
};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// RFC 1928 reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Dial hook of the engine: produce a stream to `target`, or the reply code
/// to report to the client.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &TargetAddr) -> Result<BoxedStream, Reply>;
}

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported socks version {0}")]
    BadVersion(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("authentication failed for user {0:?}")]
    AuthFailed(String),
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),
    #[error("invalid domain name")]
    InvalidDomain,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SocksOptions {
    pub listen_addr: String,
    pub handshake_timeout: Duration,
    /// When set, clients must authenticate with RFC 1929 username/password.
    pub credentials: Option<Credentials>,
    pub relay: Arc<RelayOptions>,
    pub shutdown_grace: Duration,
}

pub struct SocksServer {
    ln: TcpListener,
    connector: Arc<dyn Connector>,
    opts: Arc<SocksOptions>,
}

impl SocksServer {
    pub async fn bind(opts: SocksOptions, connector: Arc<dyn Connector>) -> Result<Self, TunnelError> {
        let addr = net::normalize_bind_addr(&opts.listen_addr).into_owned();
        let ln = TcpListener::bind(&addr).await.map_err(|err| {
            TunnelError::Startup(anyhow::Error::new(err).context(format!("socks: bind {addr}")))
        })?;
        Ok(Self {
            ln,
            connector,
            opts: Arc::new(opts),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    /// Accept clients until shutdown, then give open connections
    /// `shutdown_grace` to finish before aborting them.
    pub async fn serve(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            auth = self.opts.credentials.is_some(),
            "socks: listening"
        );

        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                acc = self.ln.accept() => match acc {
                    Ok((c, peer)) => {
                        let connector = self.connector.clone();
                        let opts = self.opts.clone();
                        conns.spawn(async move {
                            handle_conn(c, peer, connector, opts).await;
                        });
                    }
                    Err(err) => {
                        // Usually fd exhaustion; avoid a hot loop.
                        tracing::warn!(err = %err, "socks: accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
        drop(self.ln);

        let open = conns.len();
        if open > 0 {
            tracing::info!(open, grace = %humantime::format_duration(self.opts.shutdown_grace), "socks: draining connections");
            let drained = tokio::time::timeout(self.opts.shutdown_grace, async {
                while conns.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(remaining = conns.len(), "socks: grace period elapsed; aborting connections");
                conns.shutdown().await;
            }
        }
        Ok(())
    }
}

async fn handle_conn(
    mut c: TcpStream,
    peer: SocketAddr,
    connector: Arc<dyn Connector>,
    opts: Arc<SocksOptions>,
) {
    let _ = c.set_nodelay(true);

    let target = match tokio::time::timeout(
        opts.handshake_timeout,
        handshake(&mut c, opts.credentials.as_ref()),
    )
    .await
    {
        Ok(Ok(target)) => target,
        Ok(Err(err)) => {
            tracing::debug!(client = %peer, err = %err, "socks: handshake failed");
            return;
        }
        Err(_) => {
            tracing::debug!(client = %peer, "socks: handshake timed out");
            return;
        }
    };

    let stream = match connector.connect(&target).await {
        Ok(stream) => stream,
        Err(reply) => {
            let _ = write_reply(&mut c, reply).await;
            return;
        }
    };

    if let Err(err) = write_reply(&mut c, Reply::Succeeded).await {
        tracing::debug!(client = %peer, err = %err, "socks: write reply failed");
        return;
    }

    match relay::relay(c, stream, &opts.relay).await {
        Ok(stats) => tracing::debug!(
            client = %peer,
            target = %target,
            tx = stats.forward,
            rx = stats.backward,
            "socks: connection closed"
        ),
        Err(err) => tracing::debug!(client = %peer, target = %target, err = %err, "socks: relay ended"),
    }
}

/// Run method negotiation, optional authentication and the request phase.
/// Error replies are written before returning an error.
pub async fn handshake<S>(s: &mut S, creds: Option<&Credentials>) -> Result<TargetAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ver = s.read_u8().await?;
    if ver != SOCKS_VERSION {
        return Err(SocksError::BadVersion(ver));
    }
    let nmethods = s.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    s.read_exact(&mut methods).await?;

    let wanted = if creds.is_some() {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    if !methods.contains(&wanted) {
        s.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(SocksError::NoAcceptableMethod);
    }
    s.write_all(&[SOCKS_VERSION, wanted]).await?;

    if let Some(creds) = creds {
        authenticate(s, creds).await?;
    }

    let mut head = [0u8; 4];
    s.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(head[0]));
    }
    let cmd = head[1];
    let atyp = head[3];

    let target = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            s.read_exact(&mut ip).await?;
            let port = s.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(ip), port)))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            s.read_exact(&mut ip).await?;
            let port = s.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(ip), port)))
        }
        ATYP_DOMAIN => {
            let len = s.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            s.read_exact(&mut name).await?;
            let port = s.read_u16().await?;
            match String::from_utf8(name) {
                Ok(host) if !host.is_empty() => TargetAddr::Domain(host, port),
                _ => {
                    write_reply(s, Reply::GeneralFailure).await?;
                    return Err(SocksError::InvalidDomain);
                }
            }
        }
        other => {
            write_reply(s, Reply::AddressTypeNotSupported).await?;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };

    if cmd != CMD_CONNECT {
        write_reply(s, Reply::CommandNotSupported).await?;
        return Err(SocksError::UnsupportedCommand(cmd));
    }
    Ok(target)
}

// RFC 1929 sub-negotiation.
async fn authenticate<S>(s: &mut S, creds: &Credentials) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ver = s.read_u8().await?;
    if ver != AUTH_VERSION {
        return Err(SocksError::BadVersion(ver));
    }
    let ulen = s.read_u8().await? as usize;
    let mut user = vec![0u8; ulen];
    s.read_exact(&mut user).await?;
    let plen = s.read_u8().await? as usize;
    let mut pass = vec![0u8; plen];
    s.read_exact(&mut pass).await?;

    let ok = user == creds.username.as_bytes() && pass == creds.password.as_bytes();
    s.write_all(&[AUTH_VERSION, if ok { 0x00 } else { 0x01 }]).await?;
    if !ok {
        return Err(SocksError::AuthFailed(String::from_utf8_lossy(&user).into_owned()));
    }
    Ok(())
}

/// Replies always carry the bound address `0.0.0.0:0`.
pub async fn write_reply<W: AsyncWrite + Unpin>(w: &mut W, reply: Reply) -> std::io::Result<()> {
    w.write_all(&[SOCKS_VERSION, reply as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    w.flush().await
}
