use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{
    io::{ReadHalf, WriteHalf},
    sync::{Mutex, watch},
};

use crate::radtunnel::tunnel::{
    error::TunnelError,
    protocol::{self, ControlFrame},
    transport::{BoxedStream, TransportSession, TransportStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Connected,
    Closing,
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub transport: &'static str,
    pub remote: String,
    pub state: SessionState,
    pub uptime_secs: u64,
    pub idle_ms: u64,
}

/// The control read half handed back once a control stream is attached.
pub type ControlReader = ReadHalf<BoxedStream>;

/// One multiplexed tunnel connection between mid-server and rad-server.
///
/// Owns the transport session. Closing it closes the transport, which fails
/// every logical stream opened on it.
pub struct TunnelSession {
    id: u64,
    transport: &'static str,
    inner: Arc<dyn TransportSession>,
    remote: String,
    started: Instant,
    // Milliseconds since `started` at which the last control frame arrived.
    last_seen_ms: AtomicU64,
    state: watch::Sender<SessionState>,
    control_tx: Mutex<Option<WriteHalf<BoxedStream>>>,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TunnelSession {
    pub fn new(id: u64, transport: &'static str, inner: Arc<dyn TransportSession>) -> Arc<Self> {
        let remote = inner.remote_addr().map(|a| a.to_string()).unwrap_or_default();
        let (state, _rx) = watch::channel(SessionState::Connecting);
        Arc::new(Self {
            id,
            transport,
            inner,
            remote,
            started: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            state,
            control_tx: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> &'static str {
        self.transport
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// `Connecting -> Connected`. No effect once closing has begun.
    pub fn mark_connected(&self) {
        self.state.send_if_modified(|s| {
            if *s == SessionState::Connecting {
                *s = SessionState::Connected;
                true
            } else {
                false
            }
        });
    }

    pub async fn open_stream(&self) -> Result<TransportStream, TunnelError> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(TunnelError::StreamOpen(anyhow::anyhow!(
                "session {} is {state}",
                self.id
            )));
        }
        self.inner.open_stream().await.map_err(TunnelError::StreamOpen)
    }

    pub async fn accept_stream(&self) -> Result<TransportStream, TunnelError> {
        self.inner
            .accept_stream()
            .await
            .map_err(|err| TunnelError::SessionLost(format!("{err:#}")))
    }

    /// Open the control stream (rad-server side): sends the hello and keeps
    /// the write half for liveness frames.
    pub async fn open_control(&self) -> Result<ControlReader, TunnelError> {
        let mut st = self.inner.open_stream().await.map_err(TunnelError::StreamOpen)?;
        protocol::write_control_hello(&mut st.io).await?;
        Ok(self.install_control(st.io).await)
    }

    /// Adopt a stream opened by the peer as the control stream (mid-server
    /// side). Fails unless it starts with the control hello.
    pub async fn attach_control(&self, mut st: TransportStream) -> Result<ControlReader, TunnelError> {
        protocol::read_control_hello(&mut st.io).await?;
        self.touch();
        Ok(self.install_control(st.io).await)
    }

    async fn install_control(&self, io: BoxedStream) -> ControlReader {
        let (rd, wr) = tokio::io::split(io);
        *self.control_tx.lock().await = Some(wr);
        rd
    }

    pub async fn send_liveness(&self, seq: u64) -> Result<(), TunnelError> {
        self.send_control(ControlFrame::Ping(seq)).await
    }

    pub async fn send_pong(&self, seq: u64) -> Result<(), TunnelError> {
        self.send_control(ControlFrame::Pong(seq)).await
    }

    async fn send_control(&self, frame: ControlFrame) -> Result<(), TunnelError> {
        let mut guard = self.control_tx.lock().await;
        let Some(wr) = guard.as_mut() else {
            return Err(TunnelError::SessionLost("control stream not attached".into()));
        };
        protocol::write_control_frame(wr, frame)
            .await
            .map_err(|err| TunnelError::SessionLost(format!("control write: {err}")))
    }

    /// Record that a liveness frame was just received.
    pub fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Time since the last liveness frame (or since creation if none arrived).
    pub fn idle_for(&self) -> Duration {
        let seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(seen)
    }

    /// Close the transport session. Idempotent; concurrent callers return
    /// without waiting for the first close to finish.
    pub async fn close(&self) {
        let first = self.state.send_if_modified(|s| match s {
            SessionState::Connecting | SessionState::Connected => {
                *s = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Disconnected => false,
        });
        if !first {
            return;
        }
        self.inner.close().await;
        self.state.send_replace(SessionState::Disconnected);
    }

    /// Resolves once the session has started closing.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|s| matches!(s, SessionState::Closing | SessionState::Disconnected))
            .await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            transport: self.transport,
            remote: self.remote.clone(),
            state: self.state(),
            uptime_secs: self.started.elapsed().as_secs(),
            idle_ms: self.idle_for().as_millis() as u64,
        }
    }
}
