use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::edgeproxy::net;
use crate::edgeproxy::server::auth::Authenticator;
use crate::edgeproxy::telemetry::{self, SharedPrometheusHandle, SharedTunnels, TunnelInfo, TunnelRegistry};
use crate::edgeproxy::tunnel::{
    muxer::{Muxer, MuxerError},
    router::{Router as ForwardRouter, RouterError},
    session::SessionConfig,
    transport::{BoxedStream, ws::WsStream},
};

#[derive(Clone)]
pub struct ServerState {
    pub router: Arc<ForwardRouter>,
    pub authenticator: Arc<dyn Authenticator>,
    pub session_config: SessionConfig,
    pub tunnels: SharedTunnels,
    pub prom: Option<SharedPrometheusHandle>,
    ready: Arc<AtomicBool>,
    closing: CancellationToken,
}

impl ServerState {
    pub fn new(router: Arc<ForwardRouter>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            router,
            authenticator,
            session_config: SessionConfig::default(),
            tunnels: Arc::new(TunnelRegistry::new()),
            prom: None,
            ready: Arc::new(AtomicBool::new(false)),
            closing: CancellationToken::new(),
        }
    }

    pub fn with_prometheus(mut self, prom: SharedPrometheusHandle) -> Self {
        self.prom = Some(prom);
        self
    }
}

pub fn build_app(state: ServerState) -> Router {
    Router::new()
        .route("/", get(tunnel))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    listen_addr: &str,
    state: ServerState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let listener = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("server: bind {listen_addr}"))?;
    serve_listener(listener, state, shutdown).await
}

/// Serves until `shutdown` flips to true. Live tunnels are torn down at that point too.
pub async fn serve_listener(
    listener: TcpListener,
    state: ServerState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local = listener.local_addr().context("server: local addr")?;
    tracing::info!(listen_addr = %local, "server: listening");

    let closing = state.closing.clone();
    state.ready.store(true, Ordering::SeqCst);
    let ready = state.ready.clone();

    let app = build_app(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            ready.store(false, Ordering::SeqCst);
            closing.cancel();
        })
        .await
        .context("server: serve")?;

    tracing::info!(listen_addr = %local, "server: stopped");
    Ok(())
}

async fn tunnel(
    State(st): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(subject) = st.authenticator.authenticate(&headers) else {
        tracing::info!(peer = %peer, "server: unauthenticated tunnel request");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let muxer = match Muxer::from_headers(&headers, &st.session_config) {
        Ok(m) => m,
        Err(err) => {
            tracing::debug!(peer = %peer, subject = %subject, err = %err, "server: bad tunnel request");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let conn: BoxedStream = Box::new(WsStream::<_, Message>::new(socket));
        let muxer_type = muxer.muxer_type();
        telemetry::record_tunnel_connection(muxer_type);

        let _tracked = st.tunnels.clone().track(TunnelInfo {
            id: telemetry::new_tunnel_id(),
            subject: subject.clone(),
            peer: peer.to_string(),
            muxer: muxer_type.as_str(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        });
        tracing::debug!(peer = %peer, subject = %subject, muxer = %muxer_type, "server: tunnel attached");

        tokio::select! {
            res = muxer.execute(st.router.clone(), conn, subject.clone()) => match res {
                Ok(()) | Err(MuxerError::Router(RouterError::Denied { .. })) => {}
                Err(err) => {
                    tracing::warn!(peer = %peer, subject = %subject, err = %err, "server: tunnel ended with error");
                }
            },
            _ = st.closing.cancelled() => {
                tracing::debug!(peer = %peer, subject = %subject, "server: tunnel closed by shutdown");
            }
        }
    })
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

async fn readyz(State(st): State<ServerState>) -> impl IntoResponse {
    let ready = st.ready.load(Ordering::SeqCst);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(serde_json::json!({ "ready": ready })))
}

async fn version() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(st): State<ServerState>) -> Response {
    match &st.prom {
        Some(prom) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            prom.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn conns(State(st): State<ServerState>) -> impl IntoResponse {
    Json(st.tunnels.snapshot())
}
