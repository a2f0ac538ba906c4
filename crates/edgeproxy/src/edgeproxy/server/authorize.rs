use crate::edgeproxy::server::auth::Subject;
use crate::edgeproxy::tunnel::protocol::NetType;

/// One forward request as seen by the authorizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardAction {
    pub subject: Subject,
    pub destination_addr: String,
    pub net_type: NetType,
}

impl ForwardAction {
    pub fn new(subject: Subject, destination_addr: impl Into<String>, net_type: NetType) -> Self {
        Self {
            subject,
            destination_addr: destination_addr.into(),
            net_type,
        }
    }
}

/// Decides whether a forward may proceed. Called concurrently from every router.
pub trait Authorizer: Send + Sync {
    fn authorize_forward(&self, action: &ForwardAction) -> bool;
}

/// Used when no policy is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize_forward(&self, _action: &ForwardAction) -> bool {
        true
    }
}
