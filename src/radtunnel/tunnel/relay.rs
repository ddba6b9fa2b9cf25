use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
};

use crate::radtunnel::telemetry::SharedStreams;
use crate::radtunnel::tunnel::{
    error::TunnelError,
    protocol::{self, DialReply, ProtocolError},
    transport::TransportStream,
};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub dial_timeout: Duration,
    pub frame_timeout: Duration,
    pub buffer_size: usize,
    /// How long the second direction may keep running after the first one
    /// reached a clean EOF.
    pub half_close_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            frame_timeout: Duration::from_secs(10),
            buffer_size: 32 * 1024,
            half_close_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the first endpoint to the second.
    pub forward: u64,
    /// Bytes copied from the second endpoint to the first.
    pub backward: u64,
}

/// Per-stream entry point on rad-server: read the address frame, dial the
/// destination, report the outcome, then relay.
pub async fn handle_stream(
    mut st: TransportStream,
    session_id: u64,
    opts: Arc<RelayOptions>,
    streams: SharedStreams,
) -> Result<RelayStats, TunnelError> {
    let target = match tokio::time::timeout(
        opts.frame_timeout,
        protocol::read_address_frame(&mut st.io),
    )
    .await
    {
        Ok(Ok(target)) => target,
        Ok(Err(err)) => {
            reject(&mut st, DialReply::BadRequest).await;
            return Err(err.into());
        }
        Err(_) => {
            reject(&mut st, DialReply::BadRequest).await;
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "address frame timed out",
            ))
            .into());
        }
    };

    tracing::debug!(sid = session_id, stream = st.id, target = %target, "tunnel: dialing");

    let dest = match tokio::time::timeout(opts.dial_timeout, TcpStream::connect(&target)).await {
        Ok(Ok(c)) => c,
        Ok(Err(err)) => {
            let reason = DialReply::from_io_error(&err);
            metrics::counter!("radtunnel_dial_failures_total", "reason" => reason.to_string())
                .increment(1);
            tracing::debug!(sid = session_id, stream = st.id, target = %target, err = %err, "tunnel: dial failed");
            reject(&mut st, reason).await;
            return Err(TunnelError::Dial { target, reason });
        }
        Err(_) => {
            let reason = DialReply::TimedOut;
            metrics::counter!("radtunnel_dial_failures_total", "reason" => reason.to_string())
                .increment(1);
            reject(&mut st, reason).await;
            return Err(TunnelError::Dial { target, reason });
        }
    };
    let _ = dest.set_nodelay(true);

    protocol::write_dial_reply(&mut st.io, DialReply::Connected).await?;

    let _guard = streams.register(session_id, st.id, &target, "rad");
    let stats = relay(st.io, dest, &opts).await?;
    tracing::debug!(
        sid = session_id,
        target = %target,
        tx = stats.forward,
        rx = stats.backward,
        "tunnel: stream closed"
    );
    Ok(stats)
}

async fn reject(st: &mut TransportStream, reply: DialReply) {
    let _ = protocol::write_dial_reply(&mut st.io, reply).await;
    let _ = st.io.shutdown().await;
}

/// Aborts the wrapped task when dropped, so cancelling a relay never leaks
/// its copy loops.
struct Direction(JoinHandle<io::Result<()>>);

impl Drop for Direction {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Direction {
    async fn join(&mut self) -> io::Result<()> {
        match (&mut self.0).await {
            Ok(res) => res,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(io::Error::other(err)),
        }
    }

    async fn abort(&mut self) {
        self.0.abort();
        let _ = (&mut self.0).await;
    }
}

/// Copy bytes both ways between `a` and `b` until both directions finish.
///
/// A clean EOF on one side shuts down the write half of the other side; the
/// remaining direction then has `half_close_timeout` to finish. An error in
/// either direction aborts the other one immediately.
pub async fn relay<A, B>(a: A, b: B, opts: &RelayOptions) -> Result<RelayStats, TunnelError>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);

    let buf_size = opts.buffer_size.max(1024);
    let counters = RelayMetrics::start();

    let mut up = Direction(tokio::spawn(copy_half(ar, bw, buf_size, counters.forward.clone())));
    let mut down = Direction(tokio::spawn(copy_half(br, aw, buf_size, counters.backward.clone())));

    let (first, up_finished) = tokio::select! {
        r = up.join() => (r, true),
        r = down.join() => (r, false),
    };
    let other = if up_finished { &mut down } else { &mut up };

    let res = match first {
        Ok(()) => match tokio::time::timeout(opts.half_close_timeout, other.join()).await {
            Ok(r) => r,
            Err(_) => {
                other.abort().await;
                Ok(())
            }
        },
        Err(err) => {
            other.abort().await;
            Err(err)
        }
    };

    res.map(|()| counters.stats()).map_err(TunnelError::Relay)
}

/// Active-relay gauge and byte counters for one relay. Settled on drop, so a
/// relay cancelled mid-copy is still accounted for.
struct RelayMetrics {
    forward: Arc<AtomicU64>,
    backward: Arc<AtomicU64>,
}

impl RelayMetrics {
    fn start() -> Self {
        metrics::gauge!("radtunnel_active_relays").increment(1.0);
        Self {
            forward: Arc::new(AtomicU64::new(0)),
            backward: Arc::new(AtomicU64::new(0)),
        }
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            forward: self.forward.load(Ordering::Relaxed),
            backward: self.backward.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RelayMetrics {
    fn drop(&mut self) {
        let stats = self.stats();
        metrics::gauge!("radtunnel_active_relays").decrement(1.0);
        metrics::counter!("radtunnel_bytes_relayed_total", "direction" => "forward")
            .increment(stats.forward);
        metrics::counter!("radtunnel_bytes_relayed_total", "direction" => "backward")
            .increment(stats.backward);
    }
}

async fn copy_half<R, W>(
    mut r: R,
    mut w: W,
    buf_size: usize,
    counter: Arc<AtomicU64>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_size];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    w.flush().await?;
    match w.shutdown().await {
        Ok(()) => Ok(()),
        // The peer may already be gone; the data made it through.
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::radtunnel::telemetry::StreamRegistry;
    use crate::radtunnel::tunnel::transport::{TransportSession, tcp::memory_pair};

    fn quick() -> Arc<RelayOptions> {
        Arc::new(RelayOptions {
            dial_timeout: Duration::from_secs(2),
            frame_timeout: Duration::from_secs(2),
            buffer_size: 4096,
            half_close_timeout: Duration::from_millis(200),
        })
    }

    async fn spawn_rad_acceptor(
        rad: Arc<dyn TransportSession>,
        opts: Arc<RelayOptions>,
    ) -> tokio::sync::mpsc::Receiver<Result<RelayStats, TunnelError>> {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            while let Ok(st) = rad.accept_stream().await {
                let opts = opts.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let streams = Arc::new(StreamRegistry::new());
                    let _ = tx.send(handle_stream(st, 1, opts, streams).await).await;
                });
            }
        });
        rx
    }

    #[tokio::test]
    async fn frame_and_payload_reach_exactly_the_named_destination() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = dest.local_addr().unwrap().to_string();

        let (rad, mid) = memory_pair();
        let _results = spawn_rad_acceptor(rad, quick()).await;

        // TLS ClientHello prefix: must arrive verbatim after the frame.
        let payload: &[u8] = &[0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc];
        let mut st = mid.open_stream().await.unwrap();
        protocol::write_address_frame(&mut st.io, &target).await.unwrap();
        st.io.write_all(payload).await.unwrap();

        let (mut conn, _) = tokio::time::timeout(Duration::from_secs(5), dest.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            protocol::read_dial_reply(&mut st.io).await.unwrap(),
            DialReply::Connected
        );

        let mut got = vec![0u8; payload.len()];
        conn.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);

        // Exactly N bytes: after the client half-closes, the destination sees EOF.
        st.io.shutdown().await.unwrap();
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // No second connection was made.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), dest.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn truncated_frame_is_rejected_without_dialing() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (rad, mid) = memory_pair();
        let mut results = spawn_rad_acceptor(rad, quick()).await;

        // Claims 32 bytes of address, carries 5, then EOF.
        let mut st = mid.open_stream().await.unwrap();
        st.io.write_all(&[0x00, 0x20, b'a', b'b', b'c', b'd', b'e']).await.unwrap();
        st.io.shutdown().await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            res,
            Err(TunnelError::Protocol(ProtocolError::Truncated))
        ));
        assert_eq!(
            protocol::read_dial_reply(&mut st.io).await.unwrap(),
            DialReply::BadRequest
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(200), dest.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn refused_destination_is_reported_back() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = closed.local_addr().unwrap().to_string();
        drop(closed);

        let (rad, mid) = memory_pair();
        let mut results = spawn_rad_acceptor(rad, quick()).await;

        let mut st = mid.open_stream().await.unwrap();
        protocol::write_address_frame(&mut st.io, &target).await.unwrap();

        assert_eq!(
            protocol::read_dial_reply(&mut st.io).await.unwrap(),
            DialReply::Refused
        );
        let res = results.recv().await.unwrap();
        assert!(matches!(
            res,
            Err(TunnelError::Dial { reason: DialReply::Refused, .. })
        ));
    }

    #[tokio::test]
    async fn eof_in_one_direction_ends_job_within_bound() {
        let (mut client, a) = tokio::io::duplex(1024);
        let (b, mut server) = tokio::io::duplex(1024);

        let job = tokio::spawn(async move { relay(a, b, &quick()).await });

        client.write_all(b"abc").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"abc");

        // `server` never closes its side; the linger bound ends the job.
        let stats = tokio::time::timeout(Duration::from_secs(2), job)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.forward, 3);
        assert_eq!(stats.backward, 0);

        // Both endpoints were dropped.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(server.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn destination_bytes_arrive_in_order_exactly_once() {
        let (mut client, a) = tokio::io::duplex(8 * 1024);
        let (b, mut server) = tokio::io::duplex(8 * 1024);
        let job = tokio::spawn(async move { relay(a, b, &quick()).await });

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let writer = tokio::spawn(async move {
            server.write_all(&data).await.unwrap();
            server.shutdown().await.unwrap();
            server
        });

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got.len(), expected.len());
        assert!(got == expected);

        client.shutdown().await.unwrap();
        drop(writer.await.unwrap());
        let stats = job.await.unwrap().unwrap();
        assert_eq!(stats.backward, expected.len() as u64);
    }

    #[tokio::test]
    async fn session_teardown_terminates_every_stream() {
        const K: usize = 4;

        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((c, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = c.into_split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let (rad, mid) = memory_pair();
        let mut results = spawn_rad_acceptor(rad, quick()).await;

        let mut mids = Vec::new();
        for i in 0..K {
            let mut st = mid.open_stream().await.unwrap();
            protocol::write_address_frame(&mut st.io, &target).await.unwrap();
            assert_eq!(
                protocol::read_dial_reply(&mut st.io).await.unwrap(),
                DialReply::Connected
            );
            let msg = format!("stream-{i}");
            st.io.write_all(msg.as_bytes()).await.unwrap();
            let mut back = vec![0u8; msg.len()];
            st.io.read_exact(&mut back).await.unwrap();
            assert_eq!(back, msg.as_bytes());
            mids.push(st);
        }

        mid.close().await;

        for _ in 0..K {
            let res = tokio::time::timeout(Duration::from_secs(5), results.recv())
                .await
                .expect("every relay must end after session teardown");
            assert!(res.is_some());
        }
        for mut st in mids {
            let mut buf = [0u8; 16];
            let res = tokio::time::timeout(Duration::from_secs(5), st.io.read(&mut buf))
                .await
                .unwrap();
            assert!(matches!(res, Ok(0) | Err(_)));
        }
    }

    fn rendered_value(out: &str, series: &str) -> f64 {
        out.lines()
            .find_map(|l| l.strip_prefix(series)?.strip_prefix(' '))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_else(|| panic!("{series} missing from:\n{out}"))
    }

    #[test]
    fn aborted_relay_settles_gauge_and_byte_counters() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async {
                let (a, mut a_peer) = tokio::io::duplex(4096);
                let (b, mut b_peer) = tokio::io::duplex(4096);
                let opts = RelayOptions::default();
                let task = tokio::spawn(async move { relay(a, b, &opts).await });

                a_peer.write_all(b"hello").await.unwrap();
                let mut got = [0u8; 5];
                b_peer.read_exact(&mut got).await.unwrap();
                assert_eq!(&got, b"hello");

                task.abort();
                assert!(task.await.unwrap_err().is_cancelled());
            })
        });

        let out = handle.render();
        assert_eq!(rendered_value(&out, "radtunnel_active_relays"), 0.0);
        assert_eq!(
            rendered_value(&out, r#"radtunnel_bytes_relayed_total{direction="forward"}"#),
            5.0
        );
    }
}
