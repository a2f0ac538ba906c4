use std::{
    io,
    marker::PhantomData,
    pin::Pin,
    task::{Context as TaskContext, Poll, ready},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use http::HeaderMap;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};

use crate::edgeproxy::tunnel::transport::{BoxedStream, Connector};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// What a received WebSocket message means for the byte stream.
pub enum WsEvent {
    Data(Bytes),
    Skip,
    Close,
}

/// Message types that can carry a byte stream.
pub trait WsMessage: Sized {
    fn binary(data: Bytes) -> Self;
    fn into_event(self) -> WsEvent;
}

impl WsMessage for tungstenite::Message {
    fn binary(data: Bytes) -> Self {
        tungstenite::Message::Binary(data)
    }

    fn into_event(self) -> WsEvent {
        match self {
            tungstenite::Message::Binary(b) => WsEvent::Data(b),
            tungstenite::Message::Text(t) => WsEvent::Data(Bytes::copy_from_slice(t.as_str().as_bytes())),
            tungstenite::Message::Close(_) => WsEvent::Close,
            tungstenite::Message::Ping(_)
            | tungstenite::Message::Pong(_)
            | tungstenite::Message::Frame(_) => WsEvent::Skip,
        }
    }
}

impl WsMessage for axum::extract::ws::Message {
    fn binary(data: Bytes) -> Self {
        axum::extract::ws::Message::Binary(data)
    }

    fn into_event(self) -> WsEvent {
        use axum::extract::ws::Message;
        match self {
            Message::Binary(b) => WsEvent::Data(b),
            Message::Text(t) => WsEvent::Data(Bytes::copy_from_slice(t.as_str().as_bytes())),
            Message::Close(_) => WsEvent::Close,
            Message::Ping(_) | Message::Pong(_) => WsEvent::Skip,
        }
    }
}

pin_project! {
    /// Presents a message-oriented WebSocket as a plain byte stream.
    ///
    /// Writes are sent as binary messages. Reads drain message payloads in order;
    /// a close message or the end of the socket reads as EOF.
    pub struct WsStream<S, M> {
        #[pin]
        inner: S,
        pending: Bytes,
        eof: bool,
        _msg: PhantomData<fn() -> M>,
    }
}

impl<S, M> WsStream<S, M> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
            _msg: PhantomData,
        }
    }
}

impl<S, M, E> AsyncRead for WsStream<S, M>
where
    S: Stream<Item = Result<M, E>>,
    M: WsMessage,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if *this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(msg)) => match msg.into_event() {
                    WsEvent::Data(b) => *this.pending = b,
                    WsEvent::Skip => {}
                    WsEvent::Close => *this.eof = true,
                },
                Some(Err(err)) => return Poll::Ready(Err(io::Error::other(err))),
                None => *this.eof = true,
            }
        }
    }
}

impl<S, M, E> AsyncWrite for WsStream<S, M>
where
    S: Sink<M, Error = E>,
    M: WsMessage,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut this = self.project();
        ready!(this.inner.as_mut().poll_ready(cx)).map_err(io::Error::other)?;
        this.inner
            .as_mut()
            .start_send(M::binary(Bytes::copy_from_slice(buf)))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx).map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_close(cx).map_err(io::Error::other)
    }
}

/// Client side of the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn connect(&self, endpoint: &str, headers: &HeaderMap) -> anyhow::Result<BoxedStream> {
        let mut req = endpoint
            .into_client_request()
            .with_context(|| format!("websocket: invalid endpoint {endpoint}"))?;
        for (name, value) in headers {
            req.headers_mut().append(name.clone(), value.clone());
        }

        let (ws, resp) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(req),
        )
        .await
        .map_err(|_| anyhow::anyhow!("websocket: connect {endpoint} timed out"))?
        .with_context(|| format!("websocket: connect {endpoint}"))?;

        tracing::debug!(endpoint = %endpoint, status = %resp.status(), "websocket: connected");
        Ok(Box::new(WsStream::new(ws)))
    }
}

#[cfg(test)]
mod tests {
    use futures_channel::mpsc;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    type Msg = tungstenite::Message;

    // Adapts a pair of channels into a Stream + Sink of messages.
    struct FakeSocket {
        rx: mpsc::UnboundedReceiver<Result<Msg, io::Error>>,
        tx: mpsc::UnboundedSender<Msg>,
    }

    impl Stream for FakeSocket {
        type Item = Result<Msg, io::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
            self.rx.poll_next_unpin(cx)
        }
    }

    impl Sink<Msg> for FakeSocket {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Msg) -> Result<(), io::Error> {
            self.tx.unbounded_send(item).map_err(io::Error::other)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Result<(), io::Error>> {
            self.tx.close_channel();
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn reads_payloads_in_order_and_skips_control() {
        let (mut in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, _out_rx) = mpsc::unbounded();
        let mut s: WsStream<_, Msg> = WsStream::new(FakeSocket { rx: in_rx, tx: out_tx });

        in_tx.send(Ok(Msg::Binary(Bytes::from_static(b"hel")))).await.unwrap();
        in_tx.send(Ok(Msg::Ping(Bytes::new()))).await.unwrap();
        in_tx.send(Ok(Msg::Text("lo".into()))).await.unwrap();
        in_tx.send(Ok(Msg::Close(None))).await.unwrap();

        let mut got = Vec::new();
        s.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn writes_become_binary_messages() {
        let (_in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, mut out_rx) = mpsc::unbounded();
        let mut s: WsStream<_, Msg> = WsStream::new(FakeSocket { rx: in_rx, tx: out_tx });

        s.write_all(b"abc").await.unwrap();
        s.flush().await.unwrap();
        s.shutdown().await.unwrap();

        match out_rx.next().await {
            Some(Msg::Binary(b)) => assert_eq!(&b[..], b"abc"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(out_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn socket_error_surfaces_as_io_error() {
        let (mut in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, _out_rx) = mpsc::unbounded();
        let mut s: WsStream<_, Msg> = WsStream::new(FakeSocket { rx: in_rx, tx: out_tx });

        in_tx
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .await
            .unwrap();

        let mut buf = [0u8; 8];
        assert!(s.read(&mut buf).await.is_err());
    }
}
