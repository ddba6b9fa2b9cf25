use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::{RngExt, rng};
use tokio::{sync::watch, task::JoinSet, time::Instant};

use crate::radtunnel::net;
use crate::radtunnel::telemetry::SharedStreams;
use crate::radtunnel::tunnel::{
    error::TunnelError,
    protocol::{self, ControlFrame},
    relay::{self, RelayOptions},
    session::{ControlReader, TunnelSession},
    transport::{TlsDialOptions, parse_transport, transport_by_name},
};

pub const DEFAULT_TUNNEL_PORT: u16 = 8100;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `host[:port]`, optionally prefixed with `quic://` or `tcp://`.
    pub server_addr: String,
    /// Used when `server_addr` carries no scheme.
    pub transport: String,
    pub tls: TlsDialOptions,
    pub connect_timeout: Duration,
    pub liveness_interval: Duration,
    pub max_liveness_failures: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub relay: RelayOptions,
    pub shutdown_grace: Duration,
    pub streams: SharedStreams,
}

/// Tunnel dialer on rad-server.
pub struct Client {
    opts: ClientOptions,
    transport: String,
    authority: String,
    relay: Arc<RelayOptions>,
    session_seq: AtomicU64,
}

#[derive(Debug)]
enum Ended {
    Shutdown,
    Lost(TunnelError),
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        let raw = if opts.server_addr.trim().is_empty() {
            "localhost"
        } else {
            opts.server_addr.as_str()
        };
        let addr = net::parse_server_addr(raw, DEFAULT_TUNNEL_PORT)?;
        let transport = parse_transport(addr.transport.as_deref().unwrap_or(&opts.transport))?;
        if opts.tls.server_name.trim().is_empty() {
            opts.tls.server_name = addr.host.clone();
        }
        if opts.liveness_interval.is_zero() {
            opts.liveness_interval = Duration::from_secs(5);
        }
        opts.max_liveness_failures = opts.max_liveness_failures.max(1);
        if opts.backoff_initial.is_zero() {
            opts.backoff_initial = Duration::from_millis(500);
        }
        opts.backoff_max = opts.backoff_max.max(opts.backoff_initial);

        Ok(Self {
            relay: Arc::new(opts.relay.clone()),
            authority: addr.authority(),
            transport,
            opts,
            session_seq: AtomicU64::new(1),
        })
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn server(&self) -> &str {
        &self.authority
    }

    /// Keep a tunnel session up until shutdown, reconnecting with backoff.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = self.opts.backoff_initial;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let started = Instant::now();
            match self.run_once(shutdown.clone()).await {
                Ok(Ended::Shutdown) => return Ok(()),
                Ok(Ended::Lost(err)) => {
                    // The connect itself succeeded: start over from the initial delay.
                    backoff = self.opts.backoff_initial;
                    tracing::warn!(
                        transport = %self.transport,
                        server = %self.authority,
                        err = %err,
                        up = %humantime::format_duration(Duration::from_secs(started.elapsed().as_secs())),
                        "tunnel: session lost; reconnecting"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        transport = %self.transport,
                        server = %self.authority,
                        err = %format!("{err:#}"),
                        backoff = %humantime::format_duration(backoff),
                        "tunnel: connect failed; retrying"
                    );
                }
            }

            let delay = jitter(backoff);
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }

            backoff = (backoff * 2).min(self.opts.backoff_max);
        }
    }

    async fn connect(&self) -> anyhow::Result<Arc<TunnelSession>> {
        let tr = transport_by_name(&self.transport)?;
        let dial = tr.dial(&self.authority, self.opts.tls.clone());
        let raw = tokio::time::timeout(self.opts.connect_timeout, dial)
            .await
            .map_err(|_| anyhow::anyhow!("tunnel: connect timed out after {:?}", self.opts.connect_timeout))??;
        let id = self.session_seq.fetch_add(1, Ordering::Relaxed);
        Ok(TunnelSession::new(id, tr.name(), raw))
    }

    /// One session lifetime. `Err` means the session never came up.
    async fn run_once(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<Ended> {
        let sess = self.connect().await?;
        self.serve(sess, shutdown).await
    }

    /// Run an established session until it is lost or shutdown is signalled.
    async fn serve(&self, sess: Arc<TunnelSession>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<Ended> {
        sess.mark_connected();
        let reader = match sess.open_control().await {
            Ok(rd) => rd,
            Err(err) => {
                sess.close().await;
                return Err(anyhow::Error::new(err).context("tunnel: open control stream"));
            }
        };

        tracing::info!(
            sid = sess.id(),
            transport = %sess.transport(),
            server = %self.authority,
            "tunnel: connected"
        );
        metrics::gauge!("radtunnel_tunnel_connected").set(1.0);

        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        let pong_task = tokio::spawn(pong_loop(reader, pong_tx));
        let mut liveness = tokio::spawn(liveness_loop(
            sess.clone(),
            pong_rx,
            self.opts.liveness_interval,
            self.opts.max_liveness_failures,
        ));
        let mut tasks: JoinSet<()> = JoinSet::new();

        let ended = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break Ended::Shutdown;
                    }
                }
                res = &mut liveness => {
                    break Ended::Lost(res.unwrap_or_else(|err| {
                        TunnelError::SessionLost(format!("liveness task: {err}"))
                    }));
                }
                st = sess.accept_stream() => match st {
                    Ok(st) => {
                        let opts = self.relay.clone();
                        let streams = self.opts.streams.clone();
                        let sid = sess.id();
                        tasks.spawn(async move {
                            let stream = st.id;
                            match relay::handle_stream(st, sid, opts, streams).await {
                                Ok(_) => {}
                                Err(err @ TunnelError::Dial { .. }) => {
                                    tracing::info!(stream, err = %err, "tunnel: destination dial failed");
                                }
                                Err(err) => {
                                    tracing::debug!(stream, kind = err.kind(), err = %err, "tunnel: stream ended");
                                }
                            }
                        });
                    }
                    Err(err) => break Ended::Lost(err),
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        liveness.abort();
        pong_task.abort();
        metrics::gauge!("radtunnel_tunnel_connected").set(0.0);
        sess.close().await;

        match ended {
            Ended::Shutdown => {
                if !tasks.is_empty() {
                    let grace = self.opts.shutdown_grace;
                    tracing::info!(open = tasks.len(), grace = %humantime::format_duration(grace), "tunnel: draining streams");
                    let drained = tokio::time::timeout(grace, async {
                        while tasks.join_next().await.is_some() {}
                    })
                    .await;
                    if drained.is_err() {
                        tracing::warn!(remaining = tasks.len(), "tunnel: grace period elapsed; aborting streams");
                    }
                }
                tasks.shutdown().await;
            }
            // Every stream belonged to the lost session.
            Ended::Lost(_) => tasks.shutdown().await,
        }
        Ok(ended)
    }
}

/// Publishes the arrival time of every PONG until the control stream ends.
async fn pong_loop(mut rd: ControlReader, tx: watch::Sender<Instant>) {
    loop {
        match protocol::read_control_frame(&mut rd).await {
            Ok(ControlFrame::Pong(_)) => {
                let _ = tx.send(Instant::now());
            }
            Ok(ControlFrame::Ping(_)) => {}
            Err(err) => {
                tracing::debug!(err = %err, "tunnel: control stream ended");
                return;
            }
        }
    }
}

/// Sends a PING every `interval` and returns once the session is judged dead:
/// `max_failures` consecutive send failures, no PONG for
/// `interval * max_failures`, or the control stream closing.
async fn liveness_loop(
    sess: Arc<TunnelSession>,
    mut pongs: watch::Receiver<Instant>,
    interval: Duration,
    max_failures: u32,
) -> TunnelError {
    let stale_after = interval * max_failures;
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seq = 0u64;
    let mut failures = 0u32;

    loop {
        tokio::select! {
            res = pongs.changed() => {
                if res.is_err() {
                    return TunnelError::SessionLost("control stream closed".into());
                }
            }
            _ = tick.tick() => {
                let last_pong = *pongs.borrow();
                if last_pong.elapsed() >= stale_after {
                    return TunnelError::SessionLost(format!(
                        "no liveness reply for {}",
                        humantime::format_duration(Duration::from_millis(last_pong.elapsed().as_millis() as u64))
                    ));
                }
                seq += 1;
                match tokio::time::timeout(interval, sess.send_liveness(seq)).await {
                    Ok(Ok(())) => failures = 0,
                    Ok(Err(err)) => {
                        failures += 1;
                        tracing::debug!(seq, failures, err = %err, "tunnel: liveness send failed");
                    }
                    Err(_) => {
                        failures += 1;
                        tracing::debug!(seq, failures, "tunnel: liveness send timed out");
                    }
                }
                if failures >= max_failures {
                    return TunnelError::SessionLost(format!("{failures} consecutive liveness failures"));
                }
            }
        }
    }
}

// +/- 20% so a fleet of dialers does not reconnect in lockstep.
fn jitter(d: Duration) -> Duration {
    let factor: f64 = rng().random_range(0.8..1.2);
    d.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::radtunnel::telemetry::StreamRegistry;
    use crate::radtunnel::tunnel::{session::SessionState, transport::tcp::memory_pair};

    pub(crate) fn options(server_addr: &str) -> ClientOptions {
        ClientOptions {
            server_addr: server_addr.into(),
            transport: "quic".into(),
            tls: TlsDialOptions::default(),
            connect_timeout: Duration::from_secs(2),
            liveness_interval: Duration::from_secs(5),
            max_liveness_failures: 3,
            backoff_initial: Duration::from_millis(20),
            backoff_max: Duration::from_millis(100),
            relay: RelayOptions::default(),
            shutdown_grace: Duration::from_millis(200),
            streams: Arc::new(StreamRegistry::new()),
        }
    }

    #[test]
    fn server_addr_defaults_and_scheme() {
        let c = Client::new(options("")).unwrap();
        assert_eq!(c.server(), "localhost:8100");
        assert_eq!(c.transport(), "quic");
        assert_eq!(c.opts.tls.server_name, "localhost");

        let c = Client::new(options("tcp://mid.example.net:9000")).unwrap();
        assert_eq!(c.server(), "mid.example.net:9000");
        assert_eq!(c.transport(), "tcp");
        assert_eq!(c.opts.tls.server_name, "mid.example.net");

        assert!(Client::new(options("ws://mid.example.net")).is_err());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let d = jitter(Duration::from_secs(1));
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[tokio::test]
    async fn run_retries_until_shutdown() {
        // Nothing listens here; every attempt fails fast.
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let c = Client::new(options(&format!("tcp://{addr}"))).unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { c.run(rx).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!task.is_finished());
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    // 50ms PINGs with a limit of 3: dead after 150ms without replies.
    fn fast_client() -> Client {
        let mut o = options("tcp://127.0.0.1:9");
        o.liveness_interval = Duration::from_millis(50);
        o.max_liveness_failures = 3;
        Client::new(o).unwrap()
    }

    #[tokio::test]
    async fn unanswered_pings_end_session_within_bound() {
        let c = fast_client();
        let (rad, mid) = memory_pair();
        // Reads the control stream but never replies.
        tokio::spawn(async move {
            let mut st = mid.accept_stream().await.unwrap();
            let mut sink = Vec::new();
            let _ = st.io.read_to_end(&mut sink).await;
        });

        let sess = TunnelSession::new(1, "tcp", rad);
        let (_tx, rx) = watch::channel(false);
        let started = Instant::now();
        let ended = tokio::time::timeout(Duration::from_secs(2), c.serve(sess.clone(), rx))
            .await
            .expect("session must be declared lost")
            .unwrap();

        match ended {
            Ended::Lost(TunnelError::SessionLost(why)) => {
                assert!(why.contains("no liveness reply"), "{why}")
            }
            other => panic!("unexpected end: {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(sess.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_pings_are_counted_to_the_limit() {
        let (rad, _mid) = memory_pair();
        // No control stream attached, so every PING fails to send.
        let sess = TunnelSession::new(1, "tcp", rad);
        let (_pong_tx, pongs) = watch::channel(Instant::now());

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            liveness_loop(sess, pongs, Duration::from_millis(50), 3),
        )
        .await
        .unwrap();
        match err {
            TunnelError::SessionLost(why) => assert!(why.contains("3 consecutive"), "{why}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn answered_pings_keep_session_until_shutdown() {
        let c = fast_client();
        let (rad, mid_raw) = memory_pair();
        let mid = TunnelSession::new(2, "tcp", mid_raw);
        tokio::spawn(async move {
            let st = mid.accept_stream().await.unwrap();
            let mut rd = mid.attach_control(st).await.unwrap();
            while let Ok(frame) = protocol::read_control_frame(&mut rd).await {
                if let ControlFrame::Ping(seq) = frame {
                    if mid.send_pong(seq).await.is_err() {
                        break;
                    }
                }
            }
        });

        let sess = TunnelSession::new(1, "tcp", rad);
        let (tx, rx) = watch::channel(false);
        let serve = tokio::spawn(async move { c.serve(sess, rx).await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!serve.is_finished());

        tx.send(true).unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(ended, Ended::Shutdown));
    }
}
