use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::radtunnel::socks::{Connector, Reply, TargetAddr};
use crate::radtunnel::telemetry::{SharedStreams, StreamGuard};
use crate::radtunnel::tunnel::{
    error::TunnelError,
    manager::Manager,
    protocol::{self, DialReply, ProtocolError},
    stream::TunnelStream,
    transport::BoxedStream,
};

/// SOCKS dial hook on mid-server: each CONNECT becomes one logical stream on
/// the current tunnel session.
pub struct TunnelConnector {
    manager: Arc<Manager>,
    reply_timeout: Duration,
    streams: SharedStreams,
}

impl TunnelConnector {
    pub fn new(manager: Arc<Manager>, reply_timeout: Duration, streams: SharedStreams) -> Self {
        Self {
            manager,
            reply_timeout,
            streams,
        }
    }

    /// Open a logical stream to `target` and wait for rad-server to report
    /// that the destination was reached.
    pub async fn dial(&self, target: &str) -> Result<TunnelStream, TunnelError> {
        let (sess, st) = self.manager.open_stream().await?;
        let mut ts = TunnelStream::new(st, target, &sess);

        protocol::write_address_frame(&mut ts, target).await?;
        ts.mark_address_sent();
        metrics::counter!("radtunnel_streams_opened_total").increment(1);

        let reply = match tokio::time::timeout(self.reply_timeout, protocol::read_dial_reply(&mut ts)).await {
            Ok(Ok(reply)) => reply,
            // rad-server went away before answering.
            Ok(Err(ProtocolError::Truncated)) => {
                return Err(TunnelError::StreamOpen(anyhow::anyhow!(
                    "stream {} closed before dial reply",
                    ts.id()
                )));
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(TunnelError::Dial {
                    target: target.to_string(),
                    reason: DialReply::TimedOut,
                });
            }
        };

        if reply != DialReply::Connected {
            return Err(TunnelError::Dial {
                target: target.to_string(),
                reason: reply,
            });
        }
        ts.mark_relaying();
        Ok(ts)
    }
}

/// SOCKS5 reply for a failed dial. Only the code crosses the SOCKS boundary.
pub fn reply_for(err: &TunnelError) -> Reply {
    match err {
        TunnelError::NoTunnel | TunnelError::StreamOpen(_) | TunnelError::SessionLost(_) => {
            Reply::HostUnreachable
        }
        TunnelError::Dial { reason, .. } => match reason {
            DialReply::Refused => Reply::ConnectionRefused,
            DialReply::Unreachable => Reply::NetworkUnreachable,
            DialReply::TimedOut => Reply::HostUnreachable,
            DialReply::BadRequest | DialReply::Connected | DialReply::Failed => {
                Reply::GeneralFailure
            }
        },
        TunnelError::Protocol(_) | TunnelError::Relay(_) | TunnelError::Startup(_) => {
            Reply::GeneralFailure
        }
    }
}

#[async_trait]
impl Connector for TunnelConnector {
    async fn connect(&self, target: &TargetAddr) -> Result<BoxedStream, Reply> {
        let target = target.to_string();
        match self.dial(&target).await {
            Ok(ts) => {
                tracing::debug!(
                    sid = ts.session_id().unwrap_or_default(),
                    stream = ts.id(),
                    target = %target,
                    "tunnel: stream connected"
                );
                let guard = self
                    .streams
                    .register(ts.session_id().unwrap_or_default(), ts.id(), &target, "mid");
                Ok(Box::new(Tracked { inner: ts, _guard: guard }))
            }
            Err(err) => {
                match &err {
                    TunnelError::NoTunnel => {
                        tracing::warn!(target = %target, err = %err, "tunnel: connect rejected")
                    }
                    _ => tracing::info!(
                        target = %target,
                        kind = err.kind(),
                        err = %err,
                        "tunnel: connect failed"
                    ),
                }
                Err(reply_for(&err))
            }
        }
    }
}

/// A tunnel stream that stays listed in the stream registry while it lives.
struct Tracked {
    inner: TunnelStream,
    _guard: StreamGuard,
}

impl AsyncRead for Tracked {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tracked {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::radtunnel::telemetry::StreamRegistry;
    use crate::radtunnel::tunnel::{
        session::TunnelSession,
        stream::StreamState,
        transport::{TransportSession, tcp::memory_pair},
    };

    async fn connected() -> (TunnelConnector, Arc<dyn TransportSession>, SharedStreams) {
        let (rad, mid) = memory_pair();
        let mgr = Arc::new(Manager::new());
        mgr.install(TunnelSession::new(mgr.next_session_id(), "tcp", mid)).await;
        let streams = Arc::new(StreamRegistry::new());
        (
            TunnelConnector::new(mgr, Duration::from_secs(2), streams.clone()),
            rad,
            streams,
        )
    }

    #[tokio::test]
    async fn no_session_fails_immediately() {
        let conn = TunnelConnector::new(
            Arc::new(Manager::new()),
            Duration::from_secs(30),
            Arc::new(StreamRegistry::new()),
        );
        let started = std::time::Instant::now();
        let err = conn.dial("10.0.0.1:80").await.unwrap_err();
        assert!(matches!(err, TunnelError::NoTunnel));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(reply_for(&err), Reply::HostUnreachable);

        let target = TargetAddr::Domain("intranet".into(), 80);
        assert_eq!(conn.connect(&target).await.err(), Some(Reply::HostUnreachable));
    }

    #[tokio::test]
    async fn frame_precedes_payload_and_reply_gates_relay() {
        let (conn, rad, streams) = connected().await;

        let peer = tokio::spawn(async move {
            let mut st = rad.accept_stream().await.unwrap();
            let target = protocol::read_address_frame(&mut st.io).await.unwrap();
            protocol::write_dial_reply(&mut st.io, DialReply::Connected).await.unwrap();
            let mut payload = [0u8; 4];
            st.io.read_exact(&mut payload).await.unwrap();
            st.io.write_all(b"pong").await.unwrap();
            (target, payload)
        });

        let target = TargetAddr::Domain("git.internal".into(), 22);
        let mut s = conn.connect(&target).await.unwrap();
        assert_eq!(streams.len(), 1);
        s.write_all(b"ping").await.unwrap();
        let mut back = [0u8; 4];
        s.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"pong");

        let (seen, payload) = peer.await.unwrap();
        assert_eq!(seen, "git.internal:22");
        assert_eq!(&payload, b"ping");

        drop(s);
        assert_eq!(streams.len(), 0);
    }

    #[tokio::test]
    async fn dial_reply_maps_to_socks_code() {
        let (conn, rad, _streams) = connected().await;
        tokio::spawn(async move {
            while let Ok(mut st) = rad.accept_stream().await {
                let _ = protocol::read_address_frame(&mut st.io).await;
                let _ = protocol::write_dial_reply(&mut st.io, DialReply::Refused).await;
            }
        });

        let err = conn.dial("10.1.2.3:5432").await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Dial { reason: DialReply::Refused, ref target } if target == "10.1.2.3:5432"
        ));
        assert_eq!(reply_for(&err), Reply::ConnectionRefused);
    }

    #[tokio::test]
    async fn stream_closed_before_reply_is_a_stream_error() {
        let (conn, rad, _streams) = connected().await;
        tokio::spawn(async move {
            let mut st = rad.accept_stream().await.unwrap();
            let _ = protocol::read_address_frame(&mut st.io).await;
            let _ = st.io.shutdown().await;
        });

        let err = conn.dial("10.1.2.3:5432").await.unwrap_err();
        assert!(matches!(err, TunnelError::StreamOpen(_)));
    }

    #[tokio::test]
    async fn dial_returns_relaying_adapter() {
        let (conn, rad, _streams) = connected().await;
        tokio::spawn(async move {
            let mut st = rad.accept_stream().await.unwrap();
            let _ = protocol::read_address_frame(&mut st.io).await;
            let _ = protocol::write_dial_reply(&mut st.io, DialReply::Connected).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let ts = conn.dial("db:5432").await.unwrap();
        assert_eq!(ts.state(), StreamState::Relaying);
        assert_eq!(ts.target(), "db:5432");
        assert!(ts.session_alive());
    }
}
