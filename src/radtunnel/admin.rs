use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::radtunnel::telemetry;
use crate::radtunnel::tunnel::{
    manager::Manager,
    session::{SessionSnapshot, SessionState},
};

#[derive(Clone)]
pub struct AdminState {
    pub role: &'static str,
    pub prometheus: telemetry::SharedPrometheusHandle,
    pub streams: telemetry::SharedStreams,
    /// Only mid-server holds a session slot.
    pub tunnel: Option<Arc<Manager>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/tunnel", get(tunnel))
        .route("/streams", get(streams))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    role: &'static str,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            role: st.role,
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prometheus.render(),
    )
}

#[derive(Debug, Serialize)]
struct TunnelResponse {
    connected: bool,
    session: Option<SessionSnapshot>,
}

async fn tunnel(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let session = match &st.tunnel {
        Some(mgr) => mgr.snapshot().await,
        None => None,
    };
    let connected = session
        .as_ref()
        .is_some_and(|s| s.state == SessionState::Connected);
    (StatusCode::OK, Json(TunnelResponse { connected, session }))
}

async fn streams(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.streams.snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut c = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: admin\r\nConnection: close\r\n\r\n");
        c.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        c.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn reports_tunnel_and_streams() {
        let streams = Arc::new(telemetry::StreamRegistry::new());
        let state = AdminState {
            role: "mid",
            prometheus: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            streams: streams.clone(),
            tunnel: Some(Arc::new(Manager::new())),
        };
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(ln, router(state)).await });

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains(r#""role":"mid""#));

        let tunnel = get(addr, "/tunnel").await;
        let (_, body) = tunnel.split_once("\r\n\r\n").unwrap();
        let v: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(v["connected"], false);
        assert!(v["session"].is_null());

        let _guard = streams.register(7, 3, "example.com:443", "mid");
        let listed = get(addr, "/streams").await;
        assert!(listed.contains("example.com:443"));

        assert!(get(addr, "/metrics").await.starts_with("HTTP/1.1 200"));
    }
}
