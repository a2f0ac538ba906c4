use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::edgeproxy::client::{
    auth::Authenticator,
    dialer::{DialError, Dialer, tcp_only},
};
use crate::edgeproxy::tunnel::{
    muxer::MuxerType,
    protocol::{HEADER_ACTION, HEADER_DESTINATION, HEADER_MUXER_TYPE, HEADER_NETWORK, RouterAction},
    transport::{BoxedStream, Connector},
};

/// One physical connection per dial; routing travels in the handshake headers.
pub struct NoMuxDialer {
    endpoint: String,
    connector: Arc<dyn Connector>,
    authenticator: Arc<dyn Authenticator>,
}

impl NoMuxDialer {
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            connector,
            authenticator,
        }
    }
}

#[async_trait]
impl Dialer for NoMuxDialer {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn dial_context(
        &self,
        ctx: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<BoxedStream, DialError> {
        let net_type = tcp_only(network)?;
        let dst = HeaderValue::from_str(addr).map_err(|_| DialError::InvalidAddress(addr.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HEADER_MUXER_TYPE,
            HeaderValue::from_static(MuxerType::HttpNoMuxer.as_str()),
        );
        headers.insert(HEADER_NETWORK, HeaderValue::from_static(net_type.as_str()));
        headers.insert(
            HEADER_ACTION,
            HeaderValue::from_static(RouterAction::ConnectionForward.as_str()),
        );
        headers.insert(HEADER_DESTINATION, dst);
        self.authenticator
            .add_authentication_headers(&mut headers)
            .map_err(DialError::Auth)?;

        tracing::debug!(endpoint = %self.endpoint, addr = %addr, "nomux: connecting");
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(DialError::Cancelled),
            res = self.connector.connect(&self.endpoint, &headers) => res.map_err(DialError::Transport),
        }
    }
}
