use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{Mutex, mpsc},
    time::Instant,
};

use crate::edgeproxy::tunnel::transport::BoxedStream;

pub const ACCEPT_BACKLOG: usize = 256;
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);
pub const CONNECTION_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_STREAM_WINDOW: u32 = 1024 * 1024;
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(75);
pub const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const INCOMING_QUEUE: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("open stream timed out after {}", humantime::format_duration(*.0))]
    OpenTimeout(Duration),
    #[error("open stream: {0}")]
    Open(String),
    #[error("peer silent for {}", humantime::format_duration(*.0))]
    Unresponsive(Duration),
}

/// Tunables shared by both ends of a multiplexed session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub accept_backlog: usize,
    /// Cadence of yamux pings. Each one is acked by a live peer.
    pub keepalive_interval: Duration,
    /// A session that has read nothing from its peer for this long is dead.
    pub liveness_timeout: Duration,
    pub connection_write_timeout: Duration,
    pub max_stream_window: u32,
    pub stream_open_timeout: Duration,
    /// How long session teardown waits for in-flight streams before dropping them.
    pub stream_close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            accept_backlog: ACCEPT_BACKLOG,
            keepalive_interval: KEEPALIVE_INTERVAL,
            liveness_timeout: LIVENESS_TIMEOUT,
            connection_write_timeout: CONNECTION_WRITE_TIMEOUT,
            max_stream_window: MAX_STREAM_WINDOW,
            stream_open_timeout: STREAM_OPEN_TIMEOUT,
            stream_close_timeout: STREAM_CLOSE_TIMEOUT,
        }
    }
}

impl SessionConfig {
    fn yamux(&self) -> tokio_yamux::Config {
        tokio_yamux::Config {
            accept_backlog: self.accept_backlog,
            enable_keepalive: true,
            keepalive_interval: self.keepalive_interval,
            connection_write_timeout: self.connection_write_timeout,
            max_stream_window_size: self.max_stream_window,
            ..tokio_yamux::Config::default()
        }
    }
}

/// When the peer was last heard from on the physical connection.
#[derive(Debug)]
struct PeerActivity {
    epoch: Instant,
    last_read_ms: AtomicU64,
}

impl PeerActivity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_read_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_read_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn silent_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_read_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// Physical connection that records inbound traffic.
///
/// Yamux keepalive pings run underneath every session; their acks land here
/// even when no logical stream is busy.
struct ObservedConn {
    inner: BoxedStream,
    activity: Arc<PeerActivity>,
}

impl AsyncRead for ObservedConn {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(res, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.activity.touch();
        }
        res
    }
}

impl AsyncWrite for ObservedConn {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Many logical streams over one physical connection.
#[async_trait]
pub trait MuxSession: Send + Sync {
    async fn open_stream(&self) -> Result<BoxedStream, SessionError>;
    async fn accept_stream(&self) -> Result<BoxedStream, SessionError>;
    /// Liveness check. Returns how long ago the peer was last heard from and
    /// fails once that exceeds the liveness timeout or the connection is gone.
    async fn ping(&self) -> Result<Duration, SessionError>;
    async fn close(&self);
}

pub struct YamuxSession {
    control: Mutex<tokio_yamux::Control>,
    incoming: Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    task: tokio::task::JoinHandle<()>,
    closed: AtomicBool,
    activity: Arc<PeerActivity>,
    liveness_timeout: Duration,
    open_timeout: Duration,
}

impl YamuxSession {
    pub fn server(conn: BoxedStream, cfg: &SessionConfig) -> Self {
        let (conn, activity) = observe(conn);
        let session = tokio_yamux::Session::new_server(conn, cfg.yamux());
        Self::from_session(session, activity, cfg)
    }

    pub fn client(conn: BoxedStream, cfg: &SessionConfig) -> Self {
        let (conn, activity) = observe(conn);
        let session = tokio_yamux::Session::new_client(conn, cfg.yamux());
        Self::from_session(session, activity, cfg)
    }

    fn from_session(
        mut session: tokio_yamux::Session<ObservedConn>,
        activity: Arc<PeerActivity>,
        cfg: &SessionConfig,
    ) -> Self {
        let control = session.control();

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(INCOMING_QUEUE);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "session: driver stopped");
                        break;
                    }
                }
            }
        });

        Self {
            control: Mutex::new(control),
            incoming: Mutex::new(rx),
            task,
            closed: AtomicBool::new(false),
            activity,
            liveness_timeout: cfg.liveness_timeout,
            open_timeout: cfg.stream_open_timeout,
        }
    }

    fn is_dead(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.task.is_finished()
    }

    fn check_alive(&self) -> Result<Duration, SessionError> {
        if self.is_dead() {
            return Err(SessionError::Closed);
        }
        let silent = self.activity.silent_for();
        if silent > self.liveness_timeout {
            return Err(SessionError::Unresponsive(silent));
        }
        Ok(silent)
    }
}

fn observe(conn: BoxedStream) -> (ObservedConn, Arc<PeerActivity>) {
    let activity = Arc::new(PeerActivity::new());
    let conn = ObservedConn {
        inner: conn,
        activity: activity.clone(),
    };
    (conn, activity)
}

#[async_trait]
impl MuxSession for YamuxSession {
    async fn open_stream(&self) -> Result<BoxedStream, SessionError> {
        self.check_alive()?;
        let mut ctrl = self.control.lock().await;
        match tokio::time::timeout(self.open_timeout, ctrl.open_stream()).await {
            Ok(Ok(st)) => Ok(Box::new(st)),
            Ok(Err(err)) => Err(SessionError::Open(err.to_string())),
            Err(_) => Err(SessionError::OpenTimeout(self.open_timeout)),
        }
    }

    async fn accept_stream(&self) -> Result<BoxedStream, SessionError> {
        let mut rx = self.incoming.lock().await;
        let st = rx.recv().await.ok_or(SessionError::Closed)?;
        Ok(Box::new(st))
    }

    async fn ping(&self) -> Result<Duration, SessionError> {
        self.check_alive()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Best effort GoAway; an open_stream in flight may hold the control.
        if let Ok(mut ctrl) = self.control.try_lock() {
            let _ = tokio::time::timeout(CLOSE_GRACE, ctrl.close()).await;
        }
        self.task.abort();
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}
