use std::{sync::Arc, time::Duration};

use tokio::io::AsyncWriteExt;

use crate::radtunnel::tunnel::{
    error::TunnelError,
    manager::Manager,
    protocol::{self, ControlFrame},
    session::{ControlReader, TunnelSession},
    transport::{
        ListenerClosed, TlsListenOptions, TransportListener, TransportSession, transport_by_name,
    },
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub transport: String,
    pub tls: TlsListenOptions,
    pub liveness_interval: Duration,
    pub liveness_miss_limit: u32,
    pub manager: Arc<Manager>,
}

/// Tunnel acceptor on mid-server.
pub struct Server {
    opts: ServerOptions,
    transport: &'static str,
    ln: Box<dyn TransportListener>,
}

impl Server {
    /// Bind the tunnel listener. Failure here is fatal for the process.
    pub async fn bind(opts: ServerOptions) -> Result<Self, TunnelError> {
        let tr = transport_by_name(&opts.transport).map_err(TunnelError::Startup)?;
        let ln = tr
            .listen(&opts.listen_addr, opts.tls.clone())
            .await
            .map_err(|err| {
                TunnelError::Startup(err.context(format!(
                    "tunnel: bind {} ({})",
                    opts.listen_addr,
                    tr.name()
                )))
            })?;
        Ok(Self {
            transport: tr.name(),
            opts,
            ln,
        })
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.ln.local_addr()
    }

    pub fn manager(&self) -> Arc<Manager> {
        self.opts.manager.clone()
    }

    pub async fn serve(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_else(|| self.opts.listen_addr.clone()),
            transport = %self.transport,
            "tunnel: listening"
        );

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                sess = self.ln.accept() => {
                    let sess = match sess {
                        Ok(sess) => sess,
                        Err(err) if err.is::<ListenerClosed>() => {
                            tracing::warn!("tunnel: listener closed");
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(err = %format!("{err:#}"), "tunnel: handshake failed");
                            continue;
                        }
                    };
                    let opts = self.opts.clone();
                    let transport = self.transport;
                    tokio::spawn(async move {
                        handle_session(opts, transport, sess).await;
                    });
                }
            }
        }

        self.ln.close().await?;
        Ok(())
    }
}

async fn handle_session(opts: ServerOptions, transport: &'static str, raw: Arc<dyn TransportSession>) {
    let mgr = opts.manager.clone();
    let sess = TunnelSession::new(mgr.next_session_id(), transport, raw);
    let sid = sess.id();
    let remote = sess.remote().to_string();

    metrics::counter!("radtunnel_sessions_accepted_total").increment(1);
    if let Some(old) = mgr.install(sess.clone()).await {
        metrics::counter!("radtunnel_sessions_replaced_total").increment(1);
        tracing::info!(sid, replaced = old, remote = %remote, "tunnel: session replaced");
    }
    metrics::gauge!("radtunnel_tunnel_connected").set(1.0);
    tracing::info!(sid, remote = %remote, transport, "tunnel: rad-server connected");

    let reason = supervise(&sess, opts.liveness_interval, opts.liveness_miss_limit).await;

    if mgr.remove(&sess).await {
        metrics::gauge!("radtunnel_tunnel_connected").set(0.0);
    }
    sess.close().await;
    tracing::info!(sid, remote = %remote, reason = %reason, "tunnel: rad-server disconnected");
}

/// Runs until the session is over and returns why.
async fn supervise(sess: &Arc<TunnelSession>, interval: Duration, miss_limit: u32) -> String {
    let deadline = interval * miss_limit.max(1);

    // The first stream rad-server opens is the control stream. Accepting it
    // and reading its hello share one liveness deadline.
    let handshake = async {
        let control = sess.accept_stream().await?;
        sess.attach_control(control).await
    };
    let reader = match tokio::time::timeout(deadline, handshake).await {
        Ok(Ok(rd)) => rd,
        Ok(Err(err)) => {
            tracing::warn!(sid = sess.id(), err = %err, "tunnel: bad control stream");
            return err.to_string();
        }
        Err(_) => {
            tracing::warn!(sid = sess.id(), "tunnel: no control stream; closing session");
            return "no control stream".into();
        }
    };

    let mut control_task = tokio::spawn(control_loop(sess.clone(), reader));
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            res = &mut control_task => {
                break match res {
                    Ok(err) => err.to_string(),
                    Err(err) => format!("control task: {err}"),
                };
            }
            _ = tick.tick() => {
                let idle = sess.idle_for();
                if idle >= deadline {
                    tracing::warn!(
                        sid = sess.id(),
                        idle = %humantime::format_duration(Duration::from_millis(idle.as_millis() as u64)),
                        "tunnel: liveness timeout; tearing down session"
                    );
                    break "liveness timeout".into();
                }
            }
            st = sess.accept_stream() => match st {
                // Data streams only flow mid -> rad.
                Ok(mut st) => {
                    tracing::debug!(sid = sess.id(), stream = st.id, "tunnel: closing unexpected inbound stream");
                    let _ = tokio::time::timeout(Duration::from_secs(1), st.io.shutdown()).await;
                }
                Err(err) => break err.to_string(),
            },
            _ = sess.closed() => break "closed".into(),
        }
    };
    control_task.abort();
    reason
}

/// Answers every PING with a PONG; returns the error that ended the stream.
async fn control_loop(sess: Arc<TunnelSession>, mut rd: ControlReader) -> TunnelError {
    loop {
        match protocol::read_control_frame(&mut rd).await {
            Ok(ControlFrame::Ping(seq)) => {
                sess.touch();
                if let Err(err) = sess.send_pong(seq).await {
                    return err;
                }
            }
            // Not expected from rad-server; still proof of life.
            Ok(ControlFrame::Pong(_)) => sess.touch(),
            Err(err) => return TunnelError::SessionLost(format!("control stream: {err}")),
        }
    }
}
