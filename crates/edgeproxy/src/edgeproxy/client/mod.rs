pub mod auth;
pub mod dialer;
pub mod forward;
pub mod http_proxy;
pub mod mux;
pub mod nomux;
pub mod socks;
