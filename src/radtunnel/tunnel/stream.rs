use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Instant,
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::radtunnel::tunnel::{
    session::TunnelSession,
    transport::{BoxedStream, TransportStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Opening,
    AddressSent,
    Relaying,
    Closed,
}

/// A logical tunnel stream presented as a plain async socket.
///
/// Reads and writes go straight to the transport stream; `poll_shutdown`
/// half-closes the write side. The stream only counts as `Closed` once both
/// directions have finished.
pub struct TunnelStream {
    id: u64,
    target: String,
    state: StreamState,
    read_eof: bool,
    write_closed: bool,
    session: Weak<TunnelSession>,
    io: BoxedStream,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TunnelStream {
    pub fn new(st: TransportStream, target: impl Into<String>, session: &Arc<TunnelSession>) -> Self {
        Self {
            id: st.id,
            target: target.into(),
            state: StreamState::Opening,
            read_eof: false,
            write_closed: false,
            session: Arc::downgrade(session),
            io: st.io,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> StreamState {
        if self.read_eof && self.write_closed {
            StreamState::Closed
        } else {
            self.state
        }
    }

    pub fn mark_address_sent(&mut self) {
        self.state = StreamState::AddressSent;
    }

    pub fn mark_relaying(&mut self) {
        self.state = StreamState::Relaying;
    }

    /// Whether the owning session still exists and is connected.
    pub fn session_alive(&self) -> bool {
        self.session.upgrade().is_some_and(|s| s.is_connected())
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.upgrade().map(|s| s.id())
    }

    // Neither transport variant exposes per-stream deadlines.
    pub fn set_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
        Ok(())
    }

    pub fn set_read_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
        Ok(())
    }

    pub fn set_write_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.io).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            if buf.filled().len() == before && buf.remaining() > 0 {
                this.read_eof = true;
            }
        }
        res
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.io).poll_shutdown(cx);
        if res.is_ready() {
            this.write_closed = true;
        }
        res
    }
}
