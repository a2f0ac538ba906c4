//! HTTP proxy front-end: `CONNECT` tunnels and absolute-form `http://` requests.

use std::{fmt::Write as _, io, sync::Arc, time::Duration};

use http::Uri;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::watch,
};
use tokio_util::sync::CancellationToken;

use crate::edgeproxy::client::{
    dialer::{DialError, Dialer},
    forward::accept_loop,
};
use crate::edgeproxy::net;
use crate::edgeproxy::telemetry::ActiveConnGuard;
use crate::edgeproxy::tunnel::relay::{self, RelayStats};

pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_HEAD_BYTES: usize = 16 * 1024;
const READ_CHUNK: usize = 4 * 1024;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

// Not passed upstream on plain requests.
const HOP_BY_HOP: [&str; 4] = ["connection", "proxy-connection", "keep-alive", "proxy-authorization"];

#[derive(Debug, Error)]
pub enum HttpProxyError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("request head timed out")]
    Timeout,
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("connection closed inside the request head")]
    Incomplete,
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error("unsupported request target {0:?}")]
    UnsupportedTarget(String),
    #[error("dial: {0}")]
    Dial(#[from] DialError),
}

impl HttpProxyError {
    /// Status line sent back before the client connection is dropped.
    fn status(&self) -> Option<&'static str> {
        match self {
            HttpProxyError::HeadTooLarge => Some("431 Request Header Fields Too Large"),
            HttpProxyError::Malformed(_) | HttpProxyError::UnsupportedTarget(_) => Some("400 Bad Request"),
            HttpProxyError::Dial(_) => Some("502 Bad Gateway"),
            HttpProxyError::Io(_) | HttpProxyError::Timeout | HttpProxyError::Incomplete => None,
        }
    }
}

#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

#[derive(Debug)]
enum Plan {
    /// `CONNECT`: answer 200, then relay raw bytes.
    Tunnel { destination: String },
    /// Plain request: send the rewritten head upstream, then relay.
    Forward { destination: String, head: String },
}

impl Plan {
    fn destination(&self) -> &str {
        match self {
            Plan::Tunnel { destination } | Plan::Forward { destination, .. } => destination,
        }
    }
}

/// Reads through the blank line that ends the head. Bytes after it are returned too.
async fn read_head<S: AsyncRead + Unpin>(s: &mut S) -> Result<(RequestHead, Vec<u8>), HttpProxyError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = s.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpProxyError::Incomplete);
        }
        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf[scan_from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let end = scan_from + pos + 4;
            if end > MAX_HEAD_BYTES {
                return Err(HttpProxyError::HeadTooLarge);
            }
            let head = parse_head(&buf[..end])?;
            return Ok((head, buf[end..].to_vec()));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(HttpProxyError::HeadTooLarge);
        }
    }
}

fn parse_head(raw: &[u8]) -> Result<RequestHead, HttpProxyError> {
    let text = std::str::from_utf8(raw).map_err(|_| HttpProxyError::Malformed("head is not utf-8"))?;
    let mut lines = text.split("\r\n");

    let mut parts = lines.next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(target), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpProxyError::Malformed("request line"));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HttpProxyError::Malformed("http version"));
    }

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpProxyError::Malformed("header line"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}

fn plan(head: &RequestHead) -> Result<Plan, HttpProxyError> {
    let unsupported = || HttpProxyError::UnsupportedTarget(head.target.clone());

    if head.method.eq_ignore_ascii_case("CONNECT") {
        net::split_host_port(&head.target).ok_or_else(unsupported)?;
        return Ok(Plan::Tunnel {
            destination: head.target.clone(),
        });
    }

    let uri: Uri = head.target.parse().map_err(|_| unsupported())?;
    if uri.scheme_str() != Some("http") {
        return Err(unsupported());
    }
    let host = uri.host().ok_or_else(unsupported)?;
    let destination = format!("{host}:{}", uri.port_u16().unwrap_or(80));
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let mut out = format!("{} {} {}\r\n", head.method, path, head.version);
    let mut has_host = false;
    for (name, value) in &head.headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        has_host |= name.eq_ignore_ascii_case("host");
        let _ = write!(out, "{name}: {value}\r\n");
    }
    if !has_host {
        let _ = write!(out, "Host: {destination}\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");

    Ok(Plan::Forward { destination, head: out })
}

async fn write_status<S: AsyncWrite + Unpin>(s: &mut S, status: &str) -> io::Result<()> {
    let resp = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    s.write_all(resp.as_bytes()).await?;
    s.flush().await
}

async fn reject<S: AsyncWrite + Unpin>(s: &mut S, err: HttpProxyError) -> HttpProxyError {
    if let Some(status) = err.status() {
        let _ = write_status(s, status).await;
    }
    err
}

/// Serves one proxy client to completion.
pub async fn handle_conn<S>(
    mut conn: S,
    dialer: &dyn Dialer,
    ctx: &CancellationToken,
) -> Result<RelayStats, HttpProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (head, rest) = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut conn)).await {
        Err(_) => return Err(HttpProxyError::Timeout),
        Ok(Ok(v)) => v,
        Ok(Err(err)) => return Err(reject(&mut conn, err).await),
    };

    let plan = match plan(&head) {
        Ok(plan) => plan,
        Err(err) => return Err(reject(&mut conn, err).await),
    };

    let mut remote = match dialer.dial_context(ctx, "tcp", plan.destination()).await {
        Ok(remote) => remote,
        Err(err) => return Err(reject(&mut conn, err.into()).await),
    };

    match &plan {
        Plan::Tunnel { .. } => {
            conn.write_all(ESTABLISHED).await?;
            conn.flush().await?;
        }
        Plan::Forward { head, .. } => remote.write_all(head.as_bytes()).await?,
    }
    if !rest.is_empty() {
        remote.write_all(&rest).await?;
    }
    remote.flush().await?;
    tracing::debug!(method = %head.method, destination = %plan.destination(), "http-proxy: connected");

    Ok(relay::relay(conn, remote, "http-proxy", "tunnel").await)
}

pub async fn serve_http_proxy(
    ln: TcpListener,
    dialer: Arc<dyn Dialer>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    accept_loop(ln, "http-proxy", shutdown, move |conn, peer, ctx| {
        let dialer = dialer.clone();
        async move {
            let _guard = ActiveConnGuard::new();
            match handle_conn(conn, dialer.as_ref(), &ctx).await {
                Ok(_) => {}
                Err(err @ HttpProxyError::Dial(_)) => {
                    tracing::warn!(client = %peer, err = %err, "http-proxy: request failed");
                }
                Err(err) => {
                    tracing::debug!(client = %peer, err = %err, "http-proxy: bad request");
                }
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::edgeproxy::tunnel::transport::BoxedStream;

    /// Upstream that reads everything it is sent, then answers `addr|bytes`.
    struct Recorder;

    #[async_trait]
    impl Dialer for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn dial_context(
            &self,
            _ctx: &CancellationToken,
            _network: &str,
            addr: &str,
        ) -> Result<BoxedStream, DialError> {
            if addr == "refused.test:1" {
                return Err(DialError::Connect {
                    addr: addr.to_string(),
                    source: io::Error::from(io::ErrorKind::ConnectionRefused),
                });
            }
            let (a, mut b) = tokio::io::duplex(4096);
            let addr = addr.to_string();
            tokio::spawn(async move {
                let mut got = Vec::new();
                let _ = b.read_to_end(&mut got).await;
                let reply = format!("{addr}|{}", String::from_utf8_lossy(&got));
                let _ = b.write_all(reply.as_bytes()).await;
                let _ = b.shutdown().await;
            });
            Ok(Box::new(a))
        }
    }

    fn spawn_server() -> (DuplexStream, tokio::task::JoinHandle<Result<RelayStats, HttpProxyError>>) {
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { handle_conn(server, &Recorder, &CancellationToken::new()).await });
        (client, task)
    }

    async fn exchange(c: &mut DuplexStream, req: &[u8]) -> String {
        c.write_all(req).await.unwrap();
        c.shutdown().await.unwrap();
        let mut got = String::new();
        c.read_to_string(&mut got).await.unwrap();
        got
    }

    #[tokio::test]
    async fn connect_answers_200_and_forwards_early_bytes() {
        let (mut c, task) = spawn_server();
        let got = exchange(
            &mut c,
            b"CONNECT db.internal:5432 HTTP/1.1\r\nHost: db.internal:5432\r\n\r\nearly",
        )
        .await;
        assert_eq!(got, "HTTP/1.1 200 Connection Established\r\n\r\ndb.internal:5432|early");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn absolute_request_is_rewritten_to_origin_form() {
        let (mut c, task) = spawn_server();
        let got = exchange(
            &mut c,
            b"GET http://example.com:8080/a?b=1 HTTP/1.1\r\nHost: example.com:8080\r\n\
              Proxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
        )
        .await;
        assert_eq!(
            got,
            "example.com:8080|GET /a?b=1 HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\nConnection: close\r\n\r\n"
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_host_header_is_added_with_default_port() {
        let (mut c, task) = spawn_server();
        let got = exchange(&mut c, b"HEAD http://example.com HTTP/1.0\r\n\r\n").await;
        assert_eq!(
            got,
            "example.com:80|HEAD / HTTP/1.0\r\nHost: example.com:80\r\nConnection: close\r\n\r\n"
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_requests_get_400() {
        let cases: [&[u8]; 4] = [
            b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
            b"GET https://example.com/ HTTP/1.1\r\n\r\n",
            b"CONNECT no-port HTTP/1.1\r\n\r\n",
            b"HELLO\r\n\r\n",
        ];
        for req in cases {
            let (mut c, task) = spawn_server();
            let got = exchange(&mut c, req).await;
            assert!(got.starts_with("HTTP/1.1 400 "), "unexpected reply {got:?}");
            assert!(matches!(
                task.await.unwrap(),
                Err(HttpProxyError::Malformed(_) | HttpProxyError::UnsupportedTarget(_))
            ));
        }
    }

    #[tokio::test]
    async fn dial_failure_is_bad_gateway() {
        let (mut c, task) = spawn_server();
        let got = exchange(&mut c, b"CONNECT refused.test:1 HTTP/1.1\r\n\r\n").await;
        assert!(got.starts_with("HTTP/1.1 502 "), "unexpected reply {got:?}");
        assert!(matches!(task.await.unwrap(), Err(HttpProxyError::Dial(_))));
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let (mut c, task) = spawn_server();
        let filler = format!("GET http://a/ HTTP/1.1\r\nX-Fill: {}\r\n", "f".repeat(MAX_HEAD_BYTES));
        let _ = c.write_all(filler.as_bytes()).await;
        assert!(matches!(task.await.unwrap(), Err(HttpProxyError::HeadTooLarge)));

        let mut got = String::new();
        let _ = c.read_to_string(&mut got).await;
        assert!(got.starts_with("HTTP/1.1 431 "), "unexpected reply {got:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let (_c, task) = spawn_server();
        assert!(matches!(task.await.unwrap(), Err(HttpProxyError::Timeout)));
    }
}
