use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::RwLock;

use crate::radtunnel::tunnel::{
    error::TunnelError,
    session::{SessionSnapshot, TunnelSession},
    transport::TransportStream,
};

/// Holder of the single current tunnel session on mid-server.
///
/// Install, replace and clear all happen under the write lock, so at most one
/// Connected session is reachable through the holder at any time.
pub struct Manager {
    id_seq: AtomicU64,
    current: RwLock<Option<Arc<TunnelSession>>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            id_seq: AtomicU64::new(1),
            current: RwLock::new(None),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.id_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Make `sess` the current session and close the one it replaces.
    ///
    /// Returns the id of the replaced session, if any.
    pub async fn install(&self, sess: Arc<TunnelSession>) -> Option<u64> {
        sess.mark_connected();
        let old = {
            let mut cur = self.current.write().await;
            cur.replace(sess)
        };

        let old = old?;
        let id = old.id();
        old.close().await;
        Some(id)
    }

    /// Clear the slot, but only if it still holds `sess`.
    pub async fn remove(&self, sess: &Arc<TunnelSession>) -> bool {
        let mut cur = self.current.write().await;
        if cur.as_ref().is_some_and(|c| Arc::ptr_eq(c, sess)) {
            cur.take();
            true
        } else {
            false
        }
    }

    /// The current session if it is Connected.
    pub async fn current(&self) -> Option<Arc<TunnelSession>> {
        let cur = self.current.read().await;
        cur.as_ref().filter(|s| s.is_connected()).cloned()
    }

    /// Open a logical stream on the current session. Fails immediately with
    /// `NoTunnel` when nothing is connected.
    pub async fn open_stream(&self) -> Result<(Arc<TunnelSession>, TransportStream), TunnelError> {
        let sess = self.current().await.ok_or(TunnelError::NoTunnel)?;
        let st = sess.open_stream().await?;
        Ok((sess, st))
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let cur = self.current.read().await;
        cur.as_ref().map(|s| s.snapshot())
    }

    /// Clear the slot and close whatever it held.
    pub async fn shutdown(&self) {
        let old = self.current.write().await.take();
        if let Some(old) = old {
            old.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radtunnel::tunnel::{
        session::SessionState,
        transport::{TransportSession, tcp::memory_pair},
    };

    // The peer half must outlive the session or the transport sees EOF.
    fn session(mgr: &Manager) -> (Arc<TunnelSession>, Arc<dyn TransportSession>) {
        let (client, server) = memory_pair();
        (TunnelSession::new(mgr.next_session_id(), "tcp", client), server)
    }

    #[tokio::test]
    async fn empty_holder_fails_fast_with_no_tunnel() {
        let mgr = Manager::new();
        let started = std::time::Instant::now();
        assert!(matches!(mgr.open_stream().await, Err(TunnelError::NoTunnel)));
        assert!(started.elapsed() < std::time::Duration::from_millis(100));
        assert!(mgr.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn install_replaces_and_closes_previous_session() {
        let mgr = Manager::new();

        let (first, _first_peer) = session(&mgr);
        assert_eq!(mgr.install(first.clone()).await, None);
        assert!(mgr.current().await.is_some_and(|c| Arc::ptr_eq(&c, &first)));

        let (second, _second_peer) = session(&mgr);
        assert_eq!(mgr.install(second.clone()).await, Some(first.id()));
        assert_eq!(first.state(), SessionState::Disconnected);
        assert!(mgr.current().await.is_some_and(|c| Arc::ptr_eq(&c, &second)));

        // A stale session's cleanup must not evict its replacement.
        assert!(!mgr.remove(&first).await);
        assert!(mgr.current().await.is_some());

        assert!(mgr.remove(&second).await);
        assert!(mgr.current().await.is_none());
    }

    #[tokio::test]
    async fn open_stream_uses_current_session() {
        let mgr = Manager::new();
        let (sess, _sess_peer) = session(&mgr);
        mgr.install(sess.clone()).await;

        let (owner, _st) = mgr.open_stream().await.unwrap();
        assert_eq!(owner.id(), sess.id());
        assert_eq!(mgr.snapshot().await.unwrap().state, SessionState::Connected);

        mgr.shutdown().await;
        assert_eq!(sess.state(), SessionState::Disconnected);
        assert!(matches!(mgr.open_stream().await, Err(TunnelError::NoTunnel)));
    }

    #[tokio::test]
    async fn closed_session_in_slot_is_not_current() {
        let mgr = Manager::new();
        let (sess, _sess_peer) = session(&mgr);
        mgr.install(sess.clone()).await;
        sess.close().await;
        assert!(mgr.current().await.is_none());
        assert!(matches!(mgr.open_stream().await, Err(TunnelError::NoTunnel)));
    }

    #[tokio::test]
    async fn shutdown_leaves_nothing_for_late_cleanup() {
        let mgr = Manager::new();
        let (sess, _sess_peer) = session(&mgr);
        mgr.install(sess.clone()).await;

        mgr.shutdown().await;
        assert!(!mgr.remove(&sess).await);
        assert!(mgr.snapshot().await.is_none());

        let (next, _next_peer) = session(&mgr);
        assert_eq!(mgr.install(next.clone()).await, None);
        assert!(next.id() > sess.id());
    }
}
