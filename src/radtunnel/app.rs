use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::radtunnel::{
    admin, config, logging, net, socks, telemetry,
    telemetry::SharedStreams,
    tunnel::{
        client::{Client, ClientOptions},
        error::TunnelError,
        frontend::TunnelConnector,
        manager::Manager,
        server::{Server, ServerOptions},
        transport::{TlsDialOptions, TlsListenOptions, parse_transport},
    },
};

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone)]
pub enum Role {
    Mid {
        socks_addr: Option<String>,
        tunnel_addr: Option<String>,
        transport: Option<String>,
    },
    Rad {
        server: Option<String>,
        transport: Option<String>,
        insecure: bool,
    },
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Mid { .. } => "mid",
            Role::Rad { .. } => "rad",
        }
    }

    pub fn apply(&self, cfg: &mut config::Config) -> anyhow::Result<()> {
        match self {
            Role::Mid {
                socks_addr,
                tunnel_addr,
                transport,
            } => {
                if let Some(a) = socks_addr {
                    cfg.socks.listen_addr = a.clone();
                }
                if let Some(a) = tunnel_addr {
                    cfg.mid.tunnel_addr = a.clone();
                }
                if let Some(t) = transport {
                    cfg.mid.transport = parse_transport(t).context("--transport")?;
                }
            }
            Role::Rad {
                server,
                transport,
                insecure,
            } => {
                if let Some(s) = server {
                    cfg.rad.server_addr = s.clone();
                }
                if let Some(t) = transport {
                    cfg.rad.transport = parse_transport(t).context("--transport")?;
                }
                if *insecure {
                    cfg.rad.insecure_skip_verify = true;
                }
            }
        }
        Ok(())
    }
}

pub async fn run(config_path: Option<PathBuf>, role: Role) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let loaded = config::load_resolved(&resolved)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    let from_file = loaded.is_some();
    let mut cfg = match loaded {
        Some(cfg) => cfg,
        None => config::Config::defaults()?,
    };
    role.apply(&mut cfg)?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if from_file {
        tracing::info!(path = %resolved.path.display(), source = %resolved.source, "config: loaded");
    } else {
        tracing::info!(path = %resolved.path.display(), "config: no file; using defaults");
    }

    let prom = Arc::new(telemetry::init_prometheus()?);
    let streams: SharedStreams = Arc::new(telemetry::StreamRegistry::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let manager = match &role {
        Role::Mid { .. } => {
            let mid = Mid::bind(&cfg, streams.clone()).await.inspect_err(|err| {
                tracing::error!(err = %format!("{err:#}"), "radtunnel: startup failed");
            })?;
            let manager = mid.manager();
            tracing::info!(
                socks_addr = %display_addr(mid.socks_addr(), &cfg.socks.listen_addr),
                tunnel_addr = %display_addr(mid.tunnel_addr(), &cfg.mid.tunnel_addr),
                transport = %cfg.mid.transport,
                auth = cfg.socks.credentials.is_some(),
                "radtunnel: mid-server starting"
            );
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { mid.serve(shutdown).await });
            Some(manager)
        }
        Role::Rad { .. } => {
            let client = Client::new(client_options(&cfg, streams.clone()))?;
            if cfg.rad.insecure_skip_verify {
                tracing::warn!(
                    server = %client.server(),
                    "tunnel: TLS certificate verification is disabled (insecure_skip_verify)"
                );
            }
            tracing::info!(
                server = %client.server(),
                transport = %client.transport(),
                "radtunnel: rad-server starting"
            );
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { client.run(shutdown).await });
            None
        }
    };

    if let Some(raw) = cfg.admin_addr.as_deref().filter(|a| !a.trim().is_empty()) {
        let addr: SocketAddr = net::normalize_bind_addr(raw)
            .parse()
            .with_context(|| format!("invalid admin_addr: {raw}"))?;
        let state = admin::AdminState {
            role: role.name(),
            prometheus: prom.clone(),
            streams: streams.clone(),
            tunnel: manager,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(addr, state, shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                let _ = shutdown_tx.send(true);
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Each role drains its own streams within shutdown_grace; this only
    // catches a task that ignores the signal.
    let drain_timeout = cfg.shutdown_grace + Duration::from_secs(1);
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(remaining = tasks.len(), "shutdown: tasks still running; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("shutdown: done");
    Ok(())
}

fn display_addr(bound: Option<SocketAddr>, configured: &str) -> String {
    bound.map(|a| a.to_string()).unwrap_or_else(|| configured.to_string())
}

/// Both listeners of mid-server, bound and ready to serve.
pub struct Mid {
    tunnel: Server,
    socks: socks::SocksServer,
    manager: Arc<Manager>,
}

impl Mid {
    pub async fn bind(cfg: &config::Config, streams: SharedStreams) -> Result<Self, TunnelError> {
        let manager = Arc::new(Manager::new());
        let tunnel = Server::bind(ServerOptions {
            listen_addr: cfg.mid.tunnel_addr.clone(),
            transport: cfg.mid.transport.clone(),
            tls: TlsListenOptions {
                cert_file: cfg.mid.cert_file.clone(),
                key_file: cfg.mid.key_file.clone(),
            },
            liveness_interval: cfg.mid.liveness_interval,
            liveness_miss_limit: cfg.mid.liveness_miss_limit,
            manager: manager.clone(),
        })
        .await?;

        let connector = Arc::new(TunnelConnector::new(
            manager.clone(),
            cfg.mid.dial_reply_timeout,
            streams,
        ));
        let socks = socks::SocksServer::bind(
            socks::SocksOptions {
                listen_addr: cfg.socks.listen_addr.clone(),
                handshake_timeout: cfg.socks.handshake_timeout,
                credentials: cfg.socks.credentials.clone(),
                relay: Arc::new(cfg.relay.clone()),
                shutdown_grace: cfg.shutdown_grace,
            },
            connector,
        )
        .await?;

        Ok(Self {
            tunnel,
            socks,
            manager,
        })
    }

    pub fn manager(&self) -> Arc<Manager> {
        self.manager.clone()
    }

    pub fn tunnel_addr(&self) -> Option<SocketAddr> {
        self.tunnel.local_addr()
    }

    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks.local_addr()
    }

    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let Mid {
            tunnel,
            socks,
            manager,
        } = self;

        // Closing the session on shutdown ends every relaying stream, so the
        // SOCKS drain below finishes well inside its grace period.
        let mut on_shutdown = shutdown.clone();
        let closer = async move {
            let _ = on_shutdown.wait_for(|v| *v).await;
            manager.shutdown().await;
            Ok::<_, anyhow::Error>(())
        };

        tokio::try_join!(tunnel.serve(shutdown.clone()), socks.serve(shutdown), closer)?;
        Ok(())
    }
}

pub fn client_options(cfg: &config::Config, streams: SharedStreams) -> ClientOptions {
    ClientOptions {
        server_addr: cfg.rad.server_addr.clone(),
        transport: cfg.rad.transport.clone(),
        tls: TlsDialOptions {
            server_name: cfg.rad.server_name.clone(),
            insecure_skip_verify: cfg.rad.insecure_skip_verify,
            ca_file: cfg.rad.ca_file.clone(),
        },
        connect_timeout: cfg.rad.connect_timeout,
        liveness_interval: cfg.rad.liveness_interval,
        max_liveness_failures: cfg.rad.max_liveness_failures,
        backoff_initial: cfg.rad.backoff_initial,
        backoff_max: cfg.rad.backoff_max,
        relay: cfg.relay.clone(),
        shutdown_grace: cfg.shutdown_grace,
        streams,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable; Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
