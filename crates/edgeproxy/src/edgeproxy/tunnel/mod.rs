//! Tunnel transport core: wire codec, mux sessions, relay, and the server-side
//! muxers and router.

pub mod muxer;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod session;
pub mod transport;
