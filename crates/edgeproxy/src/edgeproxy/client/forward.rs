use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

use crate::edgeproxy::client::dialer::Dialer;
use crate::edgeproxy::net;
use crate::edgeproxy::telemetry::ActiveConnGuard;
use crate::edgeproxy::tunnel::relay;

/// A local listener whose every connection goes to one fixed destination.
#[derive(Debug, Clone)]
pub struct PortForward {
    pub network: String,
    pub destination: String,
}

pub async fn bind(listen_addr: &str) -> anyhow::Result<TcpListener> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))
}

/// Accepts until shutdown, handing each connection to `handle`.
///
/// Dials still pending when the loop stops see `ctx` cancelled.
pub(crate) async fn accept_loop<F, Fut>(
    ln: TcpListener,
    kind: &'static str,
    mut shutdown: watch::Receiver<bool>,
    handle: F,
) -> anyhow::Result<()>
where
    F: Fn(TcpStream, SocketAddr, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let local = ln.local_addr().context("local addr")?;
    tracing::info!(listen_addr = %local, kind, "client: listening");

    let ctx = CancellationToken::new();
    let _cancel_on_exit = ctx.clone().drop_guard();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(listen_addr = %local, err = %err, "client: accept failed");
                        continue;
                    }
                };
                let _ = conn.set_nodelay(true);
                tracing::debug!(client = %peer, kind, "client: accepted");
                tokio::spawn(handle(conn, peer, ctx.clone()));
            }
        }
    }

    Ok(())
}

pub async fn serve_port_forward(
    ln: TcpListener,
    fwd: PortForward,
    dialer: Arc<dyn Dialer>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let fwd = Arc::new(fwd);
    accept_loop(ln, "port-forward", shutdown, move |conn, peer, ctx| {
        let fwd = fwd.clone();
        let dialer = dialer.clone();
        async move {
            let _guard = ActiveConnGuard::new();
            match dialer.dial_context(&ctx, &fwd.network, &fwd.destination).await {
                Ok(remote) => {
                    relay::relay(conn, remote, "client", "tunnel").await;
                }
                Err(err) => {
                    tracing::warn!(
                        client = %peer,
                        destination = %fwd.destination,
                        dialer = dialer.name(),
                        err = %err,
                        "forward: dial failed"
                    );
                }
            }
        }
    })
    .await
}
