use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use http::HeaderMap;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, task::JoinSet};

use crate::edgeproxy::server::{auth::Subject, authorize::ForwardAction};
use crate::edgeproxy::tunnel::{
    protocol::{
        self, HEADER_ACTION, HEADER_DESTINATION, HEADER_MUXER_TYPE, HEADER_NETWORK, NetType,
        ProtocolError, RouterAction,
    },
    relay::RelayStats,
    router::{Router, RouterError},
    session::{MuxSession, SessionConfig, YamuxSession},
    transport::BoxedStream,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuxerType {
    HttpNoMuxer,
    YamuxMuxer,
}

impl MuxerType {
    pub fn as_str(self) -> &'static str {
        match self {
            MuxerType::HttpNoMuxer => "httpNoMuxer",
            MuxerType::YamuxMuxer => "yamuxMuxer",
        }
    }
}

impl fmt::Display for MuxerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MuxerType {
    type Err = MuxerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "httpNoMuxer" => Ok(MuxerType::HttpNoMuxer),
            "yamuxMuxer" => Ok(MuxerType::YamuxMuxer),
            other => Err(MuxerError::UnknownMuxer(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: &'static str, reason: String },
    #[error("unknown muxer type {0:?}")]
    UnknownMuxer(String),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no stream request within {}", humantime::format_duration(*.0))]
    RequestTimeout(Duration),
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Routing metadata taken from the handshake headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectRoute {
    pub net_type: NetType,
    pub dst_addr: String,
}

/// How one accepted physical connection maps onto logical streams.
#[derive(Debug, Clone)]
pub enum Muxer {
    /// The connection is the single logical stream.
    Direct(DirectRoute),
    /// The connection carries a yamux session; every stream opens with a Frame.
    Session(SessionConfig),
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, MuxerError> {
    let v = headers.get(name).ok_or(MuxerError::MissingHeader(name))?;
    let v = v.to_str().map_err(|e| MuxerError::InvalidHeader {
        name,
        reason: e.to_string(),
    })?;
    Ok(v.trim())
}

impl Muxer {
    pub fn from_headers(headers: &HeaderMap, session: &SessionConfig) -> Result<Self, MuxerError> {
        match header(headers, HEADER_MUXER_TYPE)?.parse::<MuxerType>()? {
            MuxerType::YamuxMuxer => Ok(Muxer::Session(session.clone())),
            MuxerType::HttpNoMuxer => {
                header(headers, HEADER_ACTION)?
                    .parse::<RouterAction>()
                    .map_err(|reason| MuxerError::InvalidHeader {
                        name: HEADER_ACTION,
                        reason,
                    })?;
                let net_type = header(headers, HEADER_NETWORK)?
                    .parse::<NetType>()
                    .map_err(|reason| MuxerError::InvalidHeader {
                        name: HEADER_NETWORK,
                        reason,
                    })?;
                let dst_addr = header(headers, HEADER_DESTINATION)?;
                if dst_addr.is_empty() {
                    return Err(MuxerError::InvalidHeader {
                        name: HEADER_DESTINATION,
                        reason: "empty".into(),
                    });
                }
                Ok(Muxer::Direct(DirectRoute {
                    net_type,
                    dst_addr: dst_addr.to_string(),
                }))
            }
        }
    }

    pub fn muxer_type(&self) -> MuxerType {
        match self {
            Muxer::Direct(_) => MuxerType::HttpNoMuxer,
            Muxer::Session(_) => MuxerType::YamuxMuxer,
        }
    }

    /// Runs until the physical connection is done.
    pub async fn execute(
        self,
        router: Arc<Router>,
        conn: BoxedStream,
        subject: Subject,
    ) -> Result<(), MuxerError> {
        match self {
            Muxer::Direct(route) => {
                let action = ForwardAction::new(subject, route.dst_addr, route.net_type);
                router.connection_forward(conn, &action).await?;
                Ok(())
            }
            Muxer::Session(cfg) => {
                serve_session(router, conn, subject, &cfg).await;
                Ok(())
            }
        }
    }
}

async fn serve_session(router: Arc<Router>, conn: BoxedStream, subject: Subject, cfg: &SessionConfig) {
    let session = YamuxSession::server(conn, cfg);
    let mut streams = JoinSet::new();

    loop {
        tokio::select! {
            st = session.accept_stream() => {
                let Ok(st) = st else { break };
                let router = router.clone();
                let subject = subject.clone();
                let request_timeout = cfg.stream_open_timeout;
                streams.spawn(async move {
                    match handle_stream(&router, st, subject.clone(), request_timeout).await {
                        Ok(_) | Err(MuxerError::Router(RouterError::Denied { .. })) => {}
                        Err(err @ (MuxerError::Protocol(_) | MuxerError::RequestTimeout(_))) => {
                            tracing::warn!(subject = %subject, err = %err, "muxer: bad stream request");
                        }
                        Err(err) => {
                            tracing::warn!(subject = %subject, err = %err, "muxer: stream dropped");
                        }
                    }
                });
            }
            Some(res) = streams.join_next(), if !streams.is_empty() => {
                if let Err(err) = res {
                    if err.is_panic() {
                        tracing::error!(err = %err, "muxer: stream task panicked");
                    }
                }
            }
        }
    }

    tracing::debug!(subject = %subject, open_streams = streams.len(), "muxer: session ended");
    session.close().await;

    let drain = async { while streams.join_next().await.is_some() {} };
    if tokio::time::timeout(cfg.stream_close_timeout, drain).await.is_err() {
        streams.abort_all();
        while streams.join_next().await.is_some() {}
    }
}

/// Reads the opening request of a session stream and forwards it.
///
/// A bad or late request drops the stream without a reply and without dialing.
pub async fn handle_stream(
    router: &Router,
    mut st: BoxedStream,
    subject: Subject,
    request_timeout: Duration,
) -> Result<RelayStats, MuxerError> {
    let read = tokio::time::timeout(request_timeout, protocol::read_request(&mut st)).await;
    let fwd = match read {
        Ok(Ok((_frame, fwd))) => fwd,
        Ok(Err(err)) => {
            let _ = st.shutdown().await;
            return Err(err.into());
        }
        Err(_) => {
            let _ = st.shutdown().await;
            return Err(MuxerError::RequestTimeout(request_timeout));
        }
    };
    let action = ForwardAction::new(subject, fwd.dst_addr, fwd.net_type);
    Ok(router.connection_forward(st, &action).await?)
}
