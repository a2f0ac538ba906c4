pub mod acl;
pub mod auth;
pub mod authorize;
pub mod http;
