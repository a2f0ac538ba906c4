//! SOCKS5 front-end (RFC 1928): no authentication, `CONNECT` only.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr},
    sync::Arc,
    time::Duration,
};

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
use crate::edgeproxy::telemetry::ActiveConnGuard;
use crate::edgeproxy::tunnel::relay::{self, RelayStats};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported socks version {0}")]
    UnsupportedVersion(u8),
    #[error("client offered no acceptable auth method")]
    NoAcceptableMethod,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("domain name is not valid utf-8")]
    InvalidDomain,
    #[error("handshake timed out")]
    Timeout,
    #[error("dial: {0}")]
    Dial(#[from] DialError),
}

async fn write_reply<S: AsyncWrite + Unpin>(s: &mut S, reply: Reply) -> io::Result<()> {
    // Bound address is always reported as 0.0.0.0:0.
    s.write_all(&[VERSION, reply as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    s.flush().await
}

/// Runs method selection and reads the request. Returns the `host:port` to connect to.
async fn negotiate<S>(s: &mut S) -> Result<String, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    s.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(SocksError::UnsupportedVersion(head[0]));
    }
    let mut methods = vec![0u8; head[1] as usize];
    s.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        s.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        s.flush().await?;
        return Err(SocksError::NoAcceptableMethod);
    }
    s.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
    s.flush().await?;

    let mut req = [0u8; 4];
    s.read_exact(&mut req).await?;
    let [ver, cmd, _rsv, atyp] = req;
    if ver != VERSION {
        return Err(SocksError::UnsupportedVersion(ver));
    }
    if cmd != CMD_CONNECT {
        write_reply(s, Reply::CommandNotSupported).await?;
        return Err(SocksError::UnsupportedCommand(cmd));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut b = [0u8; 4];
            s.read_exact(&mut b).await?;
            Ipv4Addr::from(b).to_string()
        }
        ATYP_IPV6 => {
            let mut b = [0u8; 16];
            s.read_exact(&mut b).await?;
            format!("[{}]", Ipv6Addr::from(b))
        }
        ATYP_DOMAIN => {
            let len = s.read_u8().await? as usize;
            let mut b = vec![0u8; len];
            s.read_exact(&mut b).await?;
            String::from_utf8(b).map_err(|_| SocksError::InvalidDomain)?
        }
        other => {
            write_reply(s, Reply::AddressTypeNotSupported).await?;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };
    let port = s.read_u16().await?;
    Ok(format!("{host}:{port}"))
}

/// Serves one SOCKS5 client to completion.
pub async fn handle_conn<S>(
    mut conn: S,
    dialer: &dyn Dialer,
    ctx: &CancellationToken,
) -> Result<RelayStats, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let dst = tokio::time::timeout(HANDSHAKE_TIMEOUT, negotiate(&mut conn))
        .await
        .map_err(|_| SocksError::Timeout)??;

    let remote = match dialer.dial_context(ctx, "tcp", &dst).await {
        Ok(remote) => remote,
        Err(err) => {
            let _ = write_reply(&mut conn, Reply::GeneralFailure).await;
            return Err(err.into());
        }
    };
    write_reply(&mut conn, Reply::Succeeded).await?;
    tracing::debug!(destination = %dst, "socks: connected");

    Ok(relay::relay(conn, remote, "socks", "tunnel").await)
}

pub async fn serve_socks5(
    ln: TcpListener,
    dialer: Arc<dyn Dialer>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    accept_loop(ln, "socks5", shutdown, move |conn, peer, ctx| {
        let dialer = dialer.clone();
        async move {
            let _guard = ActiveConnGuard::new();
            match handle_conn(conn, dialer.as_ref(), &ctx).await {
                Ok(_) => {}
                Err(err @ SocksError::Dial(_)) => {
                    tracing::warn!(client = %peer, err = %err, "socks: request failed");
                }
                Err(err) => {
                    tracing::debug!(client = %peer, err = %err, "socks: handshake failed");
                }
            }
        }
    })
    .await
}
