use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// One logical stream currently relaying, as shown by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub key: u64,
    pub session_id: u64,
    pub stream_id: u64,
    pub target: String,
    /// `"mid"` for front-end streams, `"rad"` for destination streams.
    pub role: &'static str,
    pub started_at_unix_ms: u64,
}

#[derive(Debug)]
pub struct StreamRegistry {
    seq: AtomicU64,
    streams: DashMap<u64, StreamInfo>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
            streams: DashMap::new(),
        }
    }

    /// Record a stream; it stays listed until the returned guard is dropped.
    pub fn register(
        self: &Arc<Self>,
        session_id: u64,
        stream_id: u64,
        target: &str,
        role: &'static str,
    ) -> StreamGuard {
        let key = self.seq.fetch_add(1, Ordering::Relaxed);
        self.streams.insert(
            key,
            StreamInfo {
                key,
                session_id,
                stream_id,
                target: target.to_string(),
                role,
                started_at_unix_ms: now_unix_ms(),
            },
        );
        StreamGuard {
            registry: self.clone(),
            key,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn snapshot(&self) -> Vec<StreamInfo> {
        let mut out = Vec::with_capacity(self.streams.len());
        for s in self.streams.iter() {
            out.push(s.value().clone());
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms).then(a.key.cmp(&b.key)));
        out
    }
}

pub struct StreamGuard {
    registry: Arc<StreamRegistry>,
    key: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.streams.remove(&self.key);
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedStreams = Arc<StreamRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_unregisters_on_drop() {
        let reg = Arc::new(StreamRegistry::new());
        let a = reg.register(1, 4, "example.com:443", "mid");
        let b = reg.register(1, 8, "10.0.0.5:22", "mid");
        assert_eq!(reg.len(), 2);

        drop(a);
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].target, "10.0.0.5:22");
        assert_eq!(snap[0].stream_id, 8);

        drop(b);
        assert_eq!(reg.len(), 0);
    }
}
