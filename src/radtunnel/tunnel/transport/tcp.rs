use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{net::TcpListener, net::TcpStream, sync::mpsc};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::radtunnel::net;
use crate::radtunnel::tunnel::transport::{
    Accepted, BoxedStream, ListenerClosed, TlsDialOptions, TlsListenOptions, Transport, TransportListener,
    TransportSession, TransportStream, tls,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS over TCP, multiplexed with yamux (stream ids travel in yamux frame headers).
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TlsListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&opts, false)?));
        let ln = TcpListener::bind(net::normalize_bind_addr(addr).as_ref()).await?;
        let local = ln.local_addr().ok();
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(accept_loop(ln, acceptor, tx));
        Ok(Box::new(TcpTransportListener {
            local,
            incoming: tokio::sync::Mutex::new(rx),
            task,
        }))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TlsDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let connector = TlsConnector::from(Arc::new(tls::client_config(&opts, false)?));
        let name = tls::server_name(&opts.server_name)?;

        let c = TcpStream::connect(addr).await?;
        let _ = c.set_nodelay(true);
        let remote = c.peer_addr().ok();
        let local = c.local_addr().ok();
        let tls = connector
            .connect(name, c)
            .await
            .context("tunnel: tls handshake")?;
        Ok(Arc::new(YamuxSession::client(Box::new(tls), remote, local)))
    }
}

pub struct TcpTransportListener {
    local: Option<SocketAddr>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
    task: tokio::task::JoinHandle<()>,
}

// Handshakes run concurrently so one slow peer cannot hold up the others.
async fn accept_loop(ln: TcpListener, acceptor: TlsAcceptor, tx: mpsc::Sender<Accepted>) {
    loop {
        let (c, peer) = match ln.accept().await {
            Ok(v) => v,
            Err(err) => {
                // Usually fd exhaustion; avoid a hot loop.
                tracing::warn!(err = %err, "tunnel: tcp accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        if tx.is_closed() {
            return;
        }
        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(handshake(acceptor, c, peer).await).await;
        });
    }
}

async fn handshake(acceptor: TlsAcceptor, c: TcpStream, peer: SocketAddr) -> Accepted {
    let _ = c.set_nodelay(true);
    let local = c.local_addr().ok();
    let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(c))
        .await
        .with_context(|| format!("tunnel: tls handshake with {peer} timed out"))?
        .with_context(|| format!("tunnel: tls handshake with {peer}"))?;
    Ok(Arc::new(YamuxSession::server(Box::new(tls), Some(peer), local)))
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(ListenerClosed)?
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    async fn close(&self) -> anyhow::Result<()> {
        // The accept task owns the socket; aborting it closes the listener.
        self.task.abort();
        Ok(())
    }
}

impl Drop for TcpTransportListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) struct YamuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    pub(crate) fn server(
        io: BoxedStream,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self {
        let session = tokio_yamux::Session::new_server(io, tokio_yamux::Config::default());
        Self::from_session(session, remote, local)
    }

    pub(crate) fn client(
        io: BoxedStream,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self {
        let session = tokio_yamux::Session::new_client(io, tokio_yamux::Config::default());
        Self::from_session(session, remote, local)
    }

    fn from_session(
        mut session: tokio_yamux::Session<BoxedStream>,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self {
        let control = session.control();

        // The session future drives all streams; dropping it (on close) fails them.
        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            remote,
            local,
            task,
        }
    }
}

fn yamux_stream(st: tokio_yamux::StreamHandle) -> TransportStream {
    TransportStream {
        id: u64::from(st.id()),
        io: Box::new(st),
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<TransportStream> {
        if self.task.is_finished() {
            anyhow::bail!("tunnel: session closed");
        }
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(yamux_stream(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<TransportStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(yamux_stream(st))
    }

    async fn close(&self) {
        // Stop the driver first; a shutdown command that is never processed
        // must not keep the session alive.
        self.task.abort();
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

/// Two connected in-memory yamux sessions (`client`, `server`).
#[cfg(test)]
pub(crate) fn memory_pair() -> (Arc<dyn TransportSession>, Arc<dyn TransportSession>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let client = YamuxSession::client(Box::new(a), None, None);
    let server = YamuxSession::server(Box::new(b), None, None);
    (Arc::new(client), Arc::new(server))
}
