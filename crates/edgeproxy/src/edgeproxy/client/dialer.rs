use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::{RngExt, rng};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::edgeproxy::tunnel::{
    protocol::{NetType, ProtocolError},
    session::SessionError,
    transport::BoxedStream,
};

#[derive(Debug, Error)]
pub enum DialError {
    #[error("network {0:?} is not supported")]
    UnsupportedNetwork(String),
    #[error("invalid destination address {0:?}")]
    InvalidAddress(String),
    #[error("connect {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("tunnel transport: {0:#}")]
    Transport(anyhow::Error),
    #[error("authentication: {0:#}")]
    Auth(anyhow::Error),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("dial cancelled")]
    Cancelled,
    #[error("dialer is shut down")]
    Closed,
    #[error("no dialers configured")]
    NoDialers,
}

/// Produces a byte stream connected to `(network, addr)`, through the tunnel or directly.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dial_context(
        &self,
        ctx: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<BoxedStream, DialError>;

    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedStream, DialError> {
        self.dial_context(&CancellationToken::new(), network, addr).await
    }
}

/// UDP is encodable on the wire but nothing dials it.
pub(crate) fn tcp_only(network: &str) -> Result<NetType, DialError> {
    match NetType::from_network(network) {
        Some(NetType::Tcp) => Ok(NetType::Tcp),
        _ => Err(DialError::UnsupportedNetwork(network.to_string())),
    }
}

/// Plain OS TCP connect, no tunnel.
#[derive(Debug, Clone, Default)]
pub struct LocalTcpDialer {
    timeout: Option<Duration>,
}

impl LocalTcpDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = Some(timeout);
        }
        self
    }
}

#[async_trait]
impl Dialer for LocalTcpDialer {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn dial_context(
        &self,
        ctx: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<BoxedStream, DialError> {
        tcp_only(network)?;

        let connect = async {
            match self.timeout {
                Some(t) => tokio::time::timeout(t, TcpStream::connect(addr))
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                    }),
                None => TcpStream::connect(addr).await,
            }
        };

        let conn = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(DialError::Cancelled),
            res = connect => res.map_err(|source| DialError::Connect {
                addr: addr.to_string(),
                source,
            })?,
        };
        let _ = conn.set_nodelay(true);
        Ok(Box::new(conn))
    }
}

/// Picks one of its dialers uniformly at random per call.
///
/// Selection does not track health: a dialer whose tunnel is down keeps receiving
/// its share of calls.
pub struct LbDialer {
    dialers: Vec<Arc<dyn Dialer>>,
}

impl LbDialer {
    pub fn new(dialers: Vec<Arc<dyn Dialer>>) -> Self {
        Self { dialers }
    }

    fn pick(&self) -> Result<&Arc<dyn Dialer>, DialError> {
        match self.dialers.len() {
            0 => Err(DialError::NoDialers),
            1 => Ok(&self.dialers[0]),
            n => Ok(&self.dialers[rng().random_range(0..n)]),
        }
    }
}

#[async_trait]
impl Dialer for LbDialer {
    fn name(&self) -> &'static str {
        "lb"
    }

    async fn dial_context(
        &self,
        ctx: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<BoxedStream, DialError> {
        let d = self.pick()?;
        tracing::debug!(dialer = d.name(), addr = %addr, "lb: selected dialer");
        d.dial_context(ctx, network, addr).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    struct Counting {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn dial_context(
            &self,
            _ctx: &CancellationToken,
            _network: &str,
            _addr: &str,
        ) -> Result<BoxedStream, DialError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let (a, _b) = tokio::io::duplex(16);
            Ok(Box::new(a))
        }
    }

    #[tokio::test]
    async fn lb_reaches_every_dialer() {
        let ds: Vec<Arc<Counting>> = (0..3)
            .map(|_| {
                Arc::new(Counting {
                    hits: AtomicUsize::new(0),
                })
            })
            .collect();
        let lb = LbDialer::new(ds.iter().map(|d| d.clone() as Arc<dyn Dialer>).collect());

        for _ in 0..300 {
            lb.dial("tcp", "example.com:80").await.unwrap();
        }
        for d in &ds {
            assert!(d.hits.load(Ordering::SeqCst) > 0, "a dialer was never selected");
        }
    }

    #[tokio::test]
    async fn lb_without_dialers_fails() {
        let lb = LbDialer::new(Vec::new());
        assert!(matches!(lb.dial("tcp", "x:1").await, Err(DialError::NoDialers)));
    }

    #[tokio::test]
    async fn local_dialer_connects_and_rejects_udp() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut c, _) = ln.accept().await.unwrap();
            c.write_all(b"hi").await.unwrap();
        });

        let d = LocalTcpDialer::new().with_timeout(Duration::from_secs(5));
        let mut s = d.dial("tcp", &addr).await.unwrap();
        let mut buf = [0u8; 2];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        match d.dial("udp", &addr).await {
            Err(DialError::UnsupportedNetwork(n)) => assert_eq!(n, "udp"),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("udp dial succeeded"),
        }
    }

    #[tokio::test]
    async fn cancelled_dial_returns_promptly() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        // Non-routable address: the connect would otherwise hang.
        let res = LocalTcpDialer::new()
            .dial_context(&ctx, "tcp", "10.255.255.1:9")
            .await;
        assert!(matches!(res, Err(DialError::Cancelled)));
    }
}
