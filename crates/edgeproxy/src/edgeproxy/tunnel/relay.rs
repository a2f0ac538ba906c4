use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinSet,
};

use crate::edgeproxy::telemetry;

const COPY_BUF_SIZE: usize = 32 * 1024;

/// How long the still-open direction may keep draining after the other one hit EOF.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bytes moved by one relay: `sent` is local to remote, `received` is remote to local.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub sent: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyEnd {
    Eof,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Relay {
    local_name: &'static str,
    remote_name: &'static str,
    drain_timeout: Duration,
}

impl Relay {
    pub fn new(local_name: &'static str, remote_name: &'static str) -> Self {
        Self {
            local_name,
            remote_name,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn drain_timeout(mut self, d: Duration) -> Self {
        self.drain_timeout = d;
        self
    }

    /// Copies bytes both ways until one direction ends, then tears both endpoints down.
    ///
    /// A direction that ends with a clean EOF half-closes its destination and the other
    /// direction gets `drain_timeout` to finish. An I/O error or a panicking copy task ends
    /// the relay immediately. Errors are logged, never returned.
    pub async fn run<L, R>(self, local: L, remote: R) -> RelayStats
    where
        L: AsyncRead + AsyncWrite + Send + 'static,
        R: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (local_rd, local_wr) = tokio::io::split(local);
        let (remote_rd, remote_wr) = tokio::io::split(remote);

        let sent = Arc::new(AtomicU64::new(0));
        let received = Arc::new(AtomicU64::new(0));

        let mut copies = JoinSet::new();
        copies.spawn(copy_half(
            local_rd,
            remote_wr,
            sent.clone(),
            format!("{}->{}", self.local_name, self.remote_name),
        ));
        copies.spawn(copy_half(
            remote_rd,
            local_wr,
            received.clone(),
            format!("{}->{}", self.remote_name, self.local_name),
        ));

        let drain = match copies.join_next().await {
            Some(res) => finished(res) == Some(CopyEnd::Eof),
            None => false,
        };
        if drain && !self.drain_timeout.is_zero() {
            if let Ok(Some(res)) = tokio::time::timeout(self.drain_timeout, copies.join_next()).await {
                finished(res);
            }
        }

        // Dropping the halves closes each endpoint once.
        copies.abort_all();
        while let Some(res) = copies.join_next().await {
            finished(res);
        }

        let stats = RelayStats {
            sent: sent.load(Ordering::Relaxed),
            received: received.load(Ordering::Relaxed),
        };
        telemetry::record_relay_bytes(stats.received, stats.sent);
        tracing::debug!(
            local = self.local_name,
            remote = self.remote_name,
            sent = stats.sent,
            received = stats.received,
            "relay: finished"
        );
        stats
    }
}

/// Relays between `local` and `remote` with default settings.
pub async fn relay<L, R>(local: L, remote: R, local_name: &'static str, remote_name: &'static str) -> RelayStats
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    Relay::new(local_name, remote_name).run(local, remote).await
}

fn finished(res: Result<CopyEnd, tokio::task::JoinError>) -> Option<CopyEnd> {
    match res {
        Ok(end) => Some(end),
        Err(err) if err.is_panic() => {
            tracing::error!(err = %err, "relay: copy task panicked");
            None
        }
        Err(_) => None,
    }
}

async fn copy_half<Rd, Wr>(mut src: Rd, mut dst: Wr, counter: Arc<AtomicU64>, dir: String) -> CopyEnd
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(dir = %dir, err = %err, "relay: read failed");
                return CopyEnd::Failed;
            }
        };
        if let Err(err) = dst.write_all(&buf[..n]).await {
            tracing::debug!(dir = %dir, err = %err, "relay: write failed");
            return CopyEnd::Failed;
        }
        if let Err(err) = dst.flush().await {
            tracing::debug!(dir = %dir, err = %err, "relay: flush failed");
            return CopyEnd::Failed;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    // Propagate EOF so the peer can finish its side.
    if let Err(err) = dst.shutdown().await {
        tracing::debug!(dir = %dir, err = %err, "relay: half-close failed");
    }
    CopyEnd::Eof
}
