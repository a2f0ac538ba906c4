//! Session-mux dialer: many logical streams over one long-lived, self-healing tunnel.
//!
//! The physical session starts `Disconnected`. A monitor task owns all session
//! replacement and is driven by reconnect requests; a keep-alive task pings the
//! current session and requests a reconnect when the ping fails. `dial()` only
//! reads the current session and opens a stream on it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use http::{HeaderMap, HeaderValue};
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::edgeproxy::client::{
    auth::Authenticator,
    dialer::{DialError, Dialer, tcp_only},
};
use crate::edgeproxy::tunnel::{
    muxer::MuxerType,
    protocol::{self, HEADER_MUXER_TYPE},
    session::{MuxSession, SessionConfig, SessionError, YamuxSession},
    transport::{BoxedStream, Connector},
};

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_OPEN_RETRY_DELAY: Duration = Duration::from_secs(5);

const RECONNECT_QUEUE: usize = 2;

#[derive(Debug, Clone)]
pub struct MuxDialerOptions {
    pub endpoint: String,
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
    pub open_retry_delay: Duration,
    pub session: SessionConfig,
}

impl MuxDialerOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            open_retry_delay: DEFAULT_OPEN_RETRY_DELAY,
            session: SessionConfig::default(),
        }
    }
}

struct ActiveSession {
    session: Arc<dyn MuxSession>,
    generation: u64,
}

struct Inner {
    opts: MuxDialerOptions,
    connector: Arc<dyn Connector>,
    authenticator: Arc<dyn Authenticator>,
    ctx: CancellationToken,
    current: ArcSwapOption<ActiveSession>,
    reconnect_lock: Mutex<()>,
    reconnect_tx: mpsc::Sender<()>,
    generation: AtomicU64,
}

pub struct MuxDialer {
    inner: Arc<Inner>,
    tasks: std::sync::Mutex<Option<JoinSet<()>>>,
}

impl MuxDialer {
    /// Starts the background tasks; the first connection is made by the monitor.
    ///
    /// Everything stops when `parent` is cancelled or the dialer is shut down.
    pub fn start(
        opts: MuxDialerOptions,
        connector: Arc<dyn Connector>,
        authenticator: Arc<dyn Authenticator>,
        parent: &CancellationToken,
    ) -> Self {
        let (reconnect_tx, reconnect_rx) = mpsc::channel(RECONNECT_QUEUE);
        let inner = Arc::new(Inner {
            opts,
            connector,
            authenticator,
            ctx: parent.child_token(),
            current: ArcSwapOption::empty(),
            reconnect_lock: Mutex::new(()),
            reconnect_tx,
            generation: AtomicU64::new(0),
        });

        inner.request_reconnect();

        let mut tasks = JoinSet::new();
        tasks.spawn(inner.clone().keep_alive());
        tasks.spawn(inner.clone().monitor(reconnect_rx));

        Self {
            inner,
            tasks: std::sync::Mutex::new(Some(tasks)),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.opts.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current.load().is_some()
    }

    /// Stops background tasks, closes the session and waits for teardown.
    pub async fn shutdown(&self) {
        self.inner.ctx.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut tasks) = tasks {
            while tasks.join_next().await.is_some() {}
        }
    }
}

impl Drop for MuxDialer {
    fn drop(&mut self) {
        self.inner.ctx.cancel();
    }
}

impl Inner {
    fn request_reconnect(&self) {
        // A full queue already holds a pending request.
        let _ = self.reconnect_tx.try_send(());
    }

    async fn ping(&self) -> Result<Duration, SessionError> {
        let Some(active) = self.current.load_full() else {
            return Err(SessionError::Closed);
        };
        active.session.ping().await
    }

    async fn keep_alive(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => return,
                _ = tokio::time::sleep(self.opts.keepalive_interval) => {}
            }
            match self.ping().await {
                Ok(silent) => {
                    tracing::trace!(endpoint = %self.opts.endpoint, silent = ?silent, "mux: ping ok");
                }
                Err(err) => {
                    tracing::debug!(endpoint = %self.opts.endpoint, err = %err, "mux: ping failed");
                    self.request_reconnect();
                }
            }
        }
    }

    async fn monitor(self: Arc<Self>, mut requests: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => break,
                req = requests.recv() => {
                    if req.is_none() {
                        break;
                    }
                    self.reconnect().await;
                }
            }
        }

        if let Some(active) = self.current.swap(None) {
            active.session.close().await;
        }
        tracing::debug!(endpoint = %self.opts.endpoint, "mux: dialer stopped");
    }

    /// Re-establishes the session unless it is alive. Returns whether a new session was installed.
    async fn reconnect(&self) -> bool {
        let _guard = self.reconnect_lock.lock().await;

        // The ping behind this request may be stale by now.
        if self.ping().await.is_ok() {
            return false;
        }

        loop {
            if self.ctx.is_cancelled() {
                return false;
            }
            match self.establish().await {
                Ok(generation) => {
                    tracing::info!(endpoint = %self.opts.endpoint, generation, "mux: session established");
                    return true;
                }
                Err(err) => {
                    tracing::warn!(
                        endpoint = %self.opts.endpoint,
                        err = %err,
                        retry_in = %humantime::format_duration(self.opts.reconnect_delay),
                        "mux: connect failed; retrying"
                    );
                }
            }
            tokio::select! {
                _ = self.ctx.cancelled() => return false,
                _ = tokio::time::sleep(self.opts.reconnect_delay) => {}
            }
        }
    }

    async fn establish(&self) -> Result<u64, DialError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_MUXER_TYPE,
            HeaderValue::from_static(MuxerType::YamuxMuxer.as_str()),
        );
        self.authenticator
            .add_authentication_headers(&mut headers)
            .map_err(DialError::Auth)?;

        let conn = tokio::select! {
            _ = self.ctx.cancelled() => return Err(DialError::Closed),
            res = self.connector.connect(&self.opts.endpoint, &headers) => res.map_err(DialError::Transport)?,
        };

        let session: Arc<dyn MuxSession> = Arc::new(YamuxSession::client(conn, &self.opts.session));
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.current.swap(Some(Arc::new(ActiveSession { session, generation })));
        if let Some(previous) = previous {
            tracing::debug!(generation = previous.generation, "mux: closing replaced session");
            previous.session.close().await;
        }
        Ok(generation)
    }

    async fn open_stream(&self) -> Result<BoxedStream, DialError> {
        if self.ctx.is_cancelled() {
            return Err(DialError::Closed);
        }
        let Some(active) = self.current.load_full() else {
            return Err(DialError::Session(SessionError::Closed));
        };
        Ok(active.session.open_stream().await?)
    }

    /// One retry after `open_retry_delay`, giving an in-flight reconnect time to land.
    async fn open_with_retry(&self, ctx: &CancellationToken) -> Result<BoxedStream, DialError> {
        match self.open_stream().await {
            Ok(st) => Ok(st),
            Err(DialError::Closed) => Err(DialError::Closed),
            Err(err) => {
                tracing::debug!(endpoint = %self.opts.endpoint, err = %err, "mux: open stream failed; retrying once");
                self.request_reconnect();
                tokio::select! {
                    _ = ctx.cancelled() => return Err(DialError::Cancelled),
                    _ = self.ctx.cancelled() => return Err(DialError::Closed),
                    _ = tokio::time::sleep(self.opts.open_retry_delay) => {}
                }
                self.open_stream().await
            }
        }
    }
}

#[async_trait]
impl Dialer for MuxDialer {
    fn name(&self) -> &'static str {
        "websocket-mux"
    }

    async fn dial_context(
        &self,
        ctx: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<BoxedStream, DialError> {
        let net_type = tcp_only(network)?;
        let mut stream = self.inner.open_with_retry(ctx).await?;

        let written = tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            res = protocol::write_forward(&mut stream, addr, net_type) => Some(res),
        };
        match written {
            Some(Ok(())) => Ok(stream),
            Some(Err(err)) => {
                let _ = stream.shutdown().await;
                Err(err.into())
            }
            None => {
                let _ = stream.shutdown().await;
                Err(DialError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::edgeproxy::client::auth::NoopAuthenticator;

    /// Fails the first `fail_first` connects, then serves a yamux session that
    /// answers every stream with its decoded destination.
    struct FlakyTunnel {
        fail_first: usize,
        silent_next: usize,
        attempts: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        connect_delay: Duration,
        servers: std::sync::Mutex<Vec<Arc<YamuxSession>>>,
        silent_peers: std::sync::Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl FlakyTunnel {
        fn new(fail_first: usize) -> Arc<Self> {
            Self::build(fail_first, 0)
        }

        /// After the failures, the next `silent_next` connects reach a peer that never answers.
        fn build(fail_first: usize, silent_next: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                silent_next,
                attempts: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                connect_delay: Duration::from_millis(20),
                servers: std::sync::Mutex::new(Vec::new()),
                silent_peers: std::sync::Mutex::new(Vec::new()),
            })
        }

        async fn drop_servers(&self) {
            let servers: Vec<_> = self.servers.lock().unwrap().drain(..).collect();
            for s in servers {
                s.close().await;
            }
        }
    }

    #[async_trait]
    impl Connector for FlakyTunnel {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn connect(&self, _endpoint: &str, headers: &HeaderMap) -> anyhow::Result<BoxedStream> {
            assert_eq!(headers.get(HEADER_MUXER_TYPE).unwrap(), "yamuxMuxer");

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.connect_delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                anyhow::bail!("tunnel unavailable (attempt {attempt})");
            }

            let (client, server) = tokio::io::duplex(64 * 1024);
            if attempt < self.fail_first + self.silent_next {
                self.silent_peers.lock().unwrap().push(server);
                return Ok(Box::new(client));
            }
            let server = Arc::new(YamuxSession::server(Box::new(server), &SessionConfig::default()));
            self.servers.lock().unwrap().push(server.clone());
            tokio::spawn(async move {
                while let Ok(mut st) = server.accept_stream().await {
                    tokio::spawn(async move {
                        if let Ok((_, fwd)) = protocol::read_request(&mut st).await {
                            let _ = st.write_all(fwd.dst_addr.as_bytes()).await;
                            let _ = st.shutdown().await;
                        }
                    });
                }
            });
            Ok(Box::new(client))
        }
    }

    fn fast_opts() -> MuxDialerOptions {
        MuxDialerOptions {
            keepalive_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(30),
            open_retry_delay: Duration::from_millis(200),
            ..MuxDialerOptions::new("ws://tunnel.test/")
        }
    }

    async fn echo_destination(d: &MuxDialer, addr: &str) -> String {
        let mut st = d.dial("tcp", addr).await.unwrap();
        let mut got = String::new();
        st.read_to_string(&mut got).await.unwrap();
        got
    }

    async fn wait_connected(d: &MuxDialer) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !d.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dialer never connected");
    }

    #[tokio::test]
    async fn dial_succeeds_after_failed_establishes() {
        let tunnel = FlakyTunnel::new(3);
        let root = CancellationToken::new();
        let d = MuxDialer::start(fast_opts(), tunnel.clone(), Arc::new(NoopAuthenticator), &root);

        wait_connected(&d).await;
        assert_eq!(echo_destination(&d, "10.0.0.5:443").await, "10.0.0.5:443");
        assert_eq!(tunnel.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(tunnel.max_in_flight.load(Ordering::SeqCst), 1);

        d.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_reconnects_are_serialized() {
        let tunnel = FlakyTunnel::new(2);
        let root = CancellationToken::new();
        let d = MuxDialer::start(fast_opts(), tunnel.clone(), Arc::new(NoopAuthenticator), &root);

        let mut set = JoinSet::new();
        for _ in 0..8 {
            let inner = d.inner.clone();
            set.spawn(async move { inner.reconnect().await });
        }
        let mut installed = 0;
        while let Some(res) = set.join_next().await {
            if res.unwrap() {
                installed += 1;
            }
        }

        assert_eq!(tunnel.max_in_flight.load(Ordering::SeqCst), 1);
        // The monitor may win the race for the one successful establish.
        assert!(installed <= 1);
        assert_eq!(tunnel.attempts.load(Ordering::SeqCst), 3);

        d.shutdown().await;
    }

    #[tokio::test]
    async fn session_is_replaced_after_tunnel_loss() {
        let tunnel = FlakyTunnel::new(0);
        let root = CancellationToken::new();
        let d = MuxDialer::start(fast_opts(), tunnel.clone(), Arc::new(NoopAuthenticator), &root);

        wait_connected(&d).await;
        assert_eq!(echo_destination(&d, "a:1").await, "a:1");

        tunnel.drop_servers().await;

        // The keep-alive notices the dead session and the monitor reconnects.
        let got = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(mut st) = d.dial("tcp", "b:2").await {
                    let mut got = String::new();
                    if st.read_to_string(&mut got).await.is_ok() && !got.is_empty() {
                        return got;
                    }
                }
            }
        })
        .await
        .expect("dialer did not recover");
        assert_eq!(got, "b:2");
        assert!(tunnel.attempts.load(Ordering::SeqCst) >= 2);

        d.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_tunnel_is_detected_and_replaced() {
        let tunnel = FlakyTunnel::build(0, 1);
        let root = CancellationToken::new();
        let d = MuxDialer::start(fast_opts(), tunnel.clone(), Arc::new(NoopAuthenticator), &root);

        wait_connected(&d).await;
        assert_eq!(tunnel.attempts.load(Ordering::SeqCst), 1);

        tokio::time::timeout(Duration::from_secs(60), async {
            while tunnel.attempts.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("silent session was never replaced");

        assert_eq!(echo_destination(&d, "b:2").await, "b:2");
        assert_eq!(tunnel.max_in_flight.load(Ordering::SeqCst), 1);

        d.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_stops_dialer_and_fails_dials() {
        let tunnel = FlakyTunnel::new(usize::MAX);
        let root = CancellationToken::new();
        let d = MuxDialer::start(fast_opts(), tunnel.clone(), Arc::new(NoopAuthenticator), &root);

        root.cancel();
        tokio::time::timeout(Duration::from_secs(5), d.shutdown())
            .await
            .expect("background tasks did not stop");

        let res = tokio::time::timeout(Duration::from_secs(5), d.dial("tcp", "x:1"))
            .await
            .expect("dial hung after cancellation");
        assert!(matches!(res, Err(DialError::Closed)));
    }

    #[tokio::test]
    async fn per_call_cancellation_interrupts_retry_wait() {
        let tunnel = FlakyTunnel::new(usize::MAX);
        let root = CancellationToken::new();
        let mut opts = fast_opts();
        opts.open_retry_delay = Duration::from_secs(3600);
        let d = MuxDialer::start(opts, tunnel, Arc::new(NoopAuthenticator), &root);

        let call = CancellationToken::new();
        let canceller = {
            let call = call.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                call.cancel();
            })
        };
        let res = tokio::time::timeout(Duration::from_secs(5), d.dial_context(&call, "tcp", "x:1"))
            .await
            .expect("dial ignored cancellation");
        assert!(matches!(res, Err(DialError::Cancelled)));
        canceller.await.unwrap();

        d.shutdown().await;
    }

    #[tokio::test]
    async fn udp_is_rejected() {
        let root = CancellationToken::new();
        let d = MuxDialer::start(fast_opts(), FlakyTunnel::new(0), Arc::new(NoopAuthenticator), &root);
        assert!(matches!(
            d.dial("udp", "1.1.1.1:53").await,
            Err(DialError::UnsupportedNetwork(_))
        ));
        d.shutdown().await;
    }
}
