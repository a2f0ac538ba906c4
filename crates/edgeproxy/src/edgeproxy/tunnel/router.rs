use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::edgeproxy::client::dialer::{DialError, Dialer, LocalTcpDialer};
use crate::edgeproxy::server::{
    auth::Subject,
    authorize::{Authorizer, ForwardAction},
};
use crate::edgeproxy::telemetry;
use crate::edgeproxy::tunnel::{
    protocol::RouterAction,
    relay::{self, RelayStats},
    transport::BoxedStream,
};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("forward to {destination} denied for {subject}")]
    Denied { subject: Subject, destination: String },
    #[error("dial {destination}: {source}")]
    Connect {
        destination: String,
        #[source]
        source: DialError,
    },
}

/// Server side of a forward request: authorize, dial, relay.
pub struct Router {
    authorizer: Arc<dyn Authorizer>,
    dialer: Arc<dyn Dialer>,
}

impl Router {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self::with_dialer(authorizer, Arc::new(LocalTcpDialer::new()))
    }

    pub fn with_dialer(authorizer: Arc<dyn Authorizer>, dialer: Arc<dyn Dialer>) -> Self {
        Self { authorizer, dialer }
    }

    /// Blocks until the relay finishes. The outbound connection is closed on return.
    pub async fn connection_forward(
        &self,
        mut stream: BoxedStream,
        action: &ForwardAction,
    ) -> Result<RelayStats, RouterError> {
        if !self.authorizer.authorize_forward(action) {
            tracing::info!(
                subject = %action.subject,
                destination = %action.destination_addr,
                network = %action.net_type,
                action = RouterAction::ConnectionForward.as_str(),
                "router: forward denied"
            );
            let _ = stream.shutdown().await;
            return Err(RouterError::Denied {
                subject: action.subject.clone(),
                destination: action.destination_addr.clone(),
            });
        }

        let outbound = match self
            .dialer
            .dial(action.net_type.as_str(), &action.destination_addr)
            .await
        {
            Ok(outbound) => outbound,
            Err(source) => {
                let _ = stream.shutdown().await;
                return Err(RouterError::Connect {
                    destination: action.destination_addr.clone(),
                    source,
                });
            }
        };

        telemetry::record_forward_accepted();
        tracing::debug!(
            subject = %action.subject,
            destination = %action.destination_addr,
            "router: forwarding"
        );

        Ok(relay::relay(stream, outbound, "tunnel", "destination").await)
    }
}
