use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::edgeproxy::client::{
    self,
    dialer::{Dialer, LbDialer, LocalTcpDialer},
    forward::{self, PortForward},
    mux::{MuxDialer, MuxDialerOptions},
    nomux::NoMuxDialer,
};
use crate::edgeproxy::config::{
    self, AuthorizationConfig, ClientAuthConfig, ClientConfig, ClientTransport, ServerAuthConfig,
    ServerConfig,
};
use crate::edgeproxy::server::{
    self,
    acl::AclAuthorizer,
    authorize::{AllowAll, Authorizer},
    http::ServerState,
};
use crate::edgeproxy::tunnel::{router::Router, session::SessionConfig, transport::ws::WsConnector};
use crate::edgeproxy::{logging, telemetry};

type Tasks = JoinSet<anyhow::Result<()>>;

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logging = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    if cfg.server.is_none() && cfg.client.is_none() {
        anyhow::bail!("config: nothing to run (set server and/or client)");
    }

    // Both aws-lc-rs and ring may be linked; pick one for the process.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        server = cfg.server.is_some(),
        client = cfg.client.as_ref().map(|c| c.transport.as_str()),
        "edgeproxy: starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let root = CancellationToken::new();
    let mut tasks = Tasks::new();

    if let Some(sc) = &cfg.server {
        start_server(sc, &mut tasks, &shutdown_rx)?;
    }
    if let Some(cc) = &cfg.client {
        start_client(cc, &mut tasks, &shutdown_rx, &root).await?;
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                let failed = match res {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err),
                    Err(join_err) => Some(join_err.into()),
                };
                if let Some(err) = failed {
                    let _ = shutdown_tx.send(true);
                    root.cancel();
                    return Err(err);
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    root.cancel();

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: tasks did not stop in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn start_server(sc: &ServerConfig, tasks: &mut Tasks, shutdown: &watch::Receiver<bool>) -> anyhow::Result<()> {
    let authenticator: Arc<dyn server::auth::Authenticator> = match &sc.auth {
        ServerAuthConfig::None => {
            tracing::warn!("server: authentication disabled; every client is \"anonymous\"");
            Arc::new(server::auth::NoopAuthenticator)
        }
        ServerAuthConfig::Jwt(jc) => Arc::new(server::auth::JwtAuthenticator::from_config(jc)?),
    };

    let authorizer: Arc<dyn Authorizer> = match &sc.authorization {
        AuthorizationConfig::None => Arc::new(AllowAll),
        AuthorizationConfig::Acl {
            policy_file,
            reload_poll_interval,
        } => {
            let acl = Arc::new(AclAuthorizer::load(policy_file)?);
            tracing::info!(
                policy_file = %policy_file.display(),
                poll = %humantime::format_duration(*reload_poll_interval),
                "acl: watching policy file"
            );
            let watcher = acl.clone().watch(*reload_poll_interval, shutdown.clone());
            tasks.spawn(async move {
                watcher.await;
                Ok(())
            });
            acl
        }
    };

    let dialer = Arc::new(LocalTcpDialer::new().with_timeout(sc.dial_timeout));
    let router = Arc::new(Router::with_dialer(authorizer, dialer));
    let prom = Arc::new(telemetry::init_prometheus()?);
    let state = ServerState::new(router, authenticator).with_prometheus(prom);

    let listen_addr = sc.listen_addr.clone();
    let shutdown = shutdown.clone();
    tasks.spawn(async move { server::http::serve_with_shutdown(&listen_addr, state, shutdown).await });
    Ok(())
}

async fn start_client(
    cc: &ClientConfig,
    tasks: &mut Tasks,
    shutdown: &watch::Receiver<bool>,
    root: &CancellationToken,
) -> anyhow::Result<()> {
    let dialer = build_dialer(cc, root)?;

    if let Some(s) = &cc.socks5 {
        let ln = forward::bind(&s.listen_addr).await?;
        let dialer = dialer.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { client::socks::serve_socks5(ln, dialer, shutdown).await });
    }

    if let Some(h) = &cc.http_proxy {
        let ln = forward::bind(&h.listen_addr).await?;
        let dialer = dialer.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { client::http_proxy::serve_http_proxy(ln, dialer, shutdown).await });
    }

    for pf in &cc.port_forwards {
        let ln = forward::bind(&pf.listen_addr).await?;
        let fwd = PortForward {
            network: pf.network.clone(),
            destination: pf.destination.clone(),
        };
        let dialer = dialer.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { forward::serve_port_forward(ln, fwd, dialer, shutdown).await });
    }

    Ok(())
}

fn build_dialer(cc: &ClientConfig, root: &CancellationToken) -> anyhow::Result<Arc<dyn Dialer>> {
    let mux = match cc.transport {
        ClientTransport::Direct => return Ok(Arc::new(LocalTcpDialer::new())),
        ClientTransport::WebsocketMux => true,
        ClientTransport::Websocket => false,
    };

    let authenticator: Arc<dyn client::auth::Authenticator> = match &cc.auth {
        ClientAuthConfig::None => Arc::new(client::auth::NoopAuthenticator),
        ClientAuthConfig::Jwt(jc) => Arc::new(client::auth::JwtAuthenticator::from_config(jc)?),
    };
    let connector = Arc::new(WsConnector::new());

    let mut dialers: Vec<Arc<dyn Dialer>> = Vec::with_capacity(cc.endpoints.len());
    for ep in &cc.endpoints {
        let d: Arc<dyn Dialer> = if mux {
            let opts = MuxDialerOptions {
                keepalive_interval: cc.keepalive_interval,
                reconnect_delay: cc.reconnect_delay,
                open_retry_delay: cc.open_retry_delay,
                session: SessionConfig {
                    keepalive_interval: cc.keepalive_interval,
                    liveness_timeout: cc.keepalive_interval * 3,
                    ..SessionConfig::default()
                },
                ..MuxDialerOptions::new(ep.clone())
            };
            Arc::new(MuxDialer::start(opts, connector.clone(), authenticator.clone(), root))
        } else {
            Arc::new(NoMuxDialer::new(ep.clone(), connector.clone(), authenticator.clone()))
        };
        tracing::info!(endpoint = %ep, dialer = d.name(), "client: endpoint configured");
        dialers.push(d);
    }

    if dialers.len() == 1 {
        return Ok(dialers.remove(0));
    }
    Ok(Arc::new(LbDialer::new(dialers)))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
