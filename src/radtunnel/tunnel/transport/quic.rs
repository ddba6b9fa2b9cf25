use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig};
use tokio::sync::mpsc;

use crate::radtunnel::net;
use crate::radtunnel::tunnel::transport::{
    Accepted, ListenerClosed, TlsDialOptions, TlsListenOptions, Transport, TransportListener,
    TransportSession, TransportStream, tls,
};

const MAX_CONCURRENT_STREAMS: u32 = 1024;

pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

fn transport_config() -> anyhow::Result<TransportConfig> {
    let mut cfg = TransportConfig::default();
    cfg.max_idle_timeout(Some(Duration::from_secs(60).try_into()?));
    cfg.keep_alive_interval(Some(Duration::from_secs(20)));
    cfg.max_concurrent_bidi_streams(MAX_CONCURRENT_STREAMS.into());
    Ok(cfg)
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TlsListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let addr: SocketAddr = bind_addr.parse()?;

        let server_crypto = tls::server_config(&opts, true)?;
        let mut server_cfg = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_cfg.transport_config(Arc::new(transport_config()?));

        let endpoint = Endpoint::server(server_cfg, addr)?;
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(accept_loop(endpoint.clone(), tx));
        Ok(Box::new(QuicTransportListener {
            endpoint,
            incoming: tokio::sync::Mutex::new(rx),
            task,
        }))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TlsDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let client_crypto = tls::client_config(&opts, true)?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_cfg.transport_config(Arc::new(transport_config()?));

        let remote = net::resolve_socket_addr(addr).await?;
        let bind: SocketAddr = if remote.is_ipv6() {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        let name = tls::server_name_str(&opts.server_name);
        let connecting = endpoint.connect(remote, name)?;
        let conn = connecting.await?;
        Ok(Arc::new(QuicSession::new(conn, Some(endpoint))))
    }
}

pub struct QuicTransportListener {
    endpoint: Endpoint,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
    task: tokio::task::JoinHandle<()>,
}

// Handshakes run concurrently so one slow peer cannot hold up the others.
async fn accept_loop(endpoint: Endpoint, tx: mpsc::Sender<Accepted>) {
    while let Some(incoming) = endpoint.accept().await {
        let tx = tx.clone();
        tokio::spawn(async move {
            let remote = incoming.remote_address();
            let res = match incoming.await {
                Ok(conn) => Ok(Arc::new(QuicSession::new(conn, None)) as Arc<dyn TransportSession>),
                Err(err) => {
                    Err(anyhow::Error::new(err).context(format!("tunnel: quic handshake with {remote}")))
                }
            };
            let _ = tx.send(res).await;
        });
    }
}

#[async_trait]
impl TransportListener for QuicTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(ListenerClosed)?
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.task.abort();
        self.endpoint.close(0u32.into(), b"");
        Ok(())
    }
}

impl Drop for QuicTransportListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct QuicSession {
    conn: Connection,
    // Client sessions own their endpoint; server sessions share the listener's.
    endpoint: Option<Endpoint>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<(quinn::SendStream, quinn::RecvStream)>>,
    task: tokio::task::JoinHandle<()>,
}

impl QuicSession {
    fn new(conn: Connection, endpoint: Option<Endpoint>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let c = conn.clone();
        let task = tokio::spawn(async move {
            while let Ok(st) = c.accept_bi().await {
                if tx.send(st).await.is_err() {
                    break;
                }
            }
        });
        Self {
            conn,
            endpoint,
            incoming: tokio::sync::Mutex::new(rx),
            task,
        }
    }
}

fn bi_stream(send: quinn::SendStream, recv: quinn::RecvStream) -> TransportStream {
    TransportStream {
        id: send.id().index(),
        io: Box::new(QuicBiStream { send, recv }),
    }
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> anyhow::Result<TransportStream> {
        let (send, recv) = self.conn.open_bi().await?;
        Ok(bi_stream(send, recv))
    }

    async fn accept_stream(&self) -> anyhow::Result<TransportStream> {
        let mut rx = self.incoming.lock().await;
        let (send, recv) = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(bi_stream(send, recv))
    }

    async fn close(&self) {
        self.task.abort();
        self.conn.close(0u32.into(), b"");
        if let Some(ep) = &self.endpoint {
            ep.close(0u32.into(), b"");
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(|ep| ep.local_addr().ok())
    }
}

pin_project! {
    struct QuicBiStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl tokio::io::AsyncRead for QuicBiStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncRead::poll_read(self.project().recv, cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicBiStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(self.project().send, cx, data)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}
