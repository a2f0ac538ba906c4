use async_trait::async_trait;
use http::HeaderMap;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Establishes the physical duplex connection to a tunnel endpoint.
///
/// `headers` are attached to the handshake request (routing metadata for the
/// no-mux strategy, authentication for both strategies).
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn connect(&self, endpoint: &str, headers: &HeaderMap) -> anyhow::Result<BoxedStream>;
}

pub mod ws;
