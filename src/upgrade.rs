//! A response target that can relinquish its socket to a WebSocket.
//!
//! On the connection-upgrade path the server hands the raw socket (and any
//! bytes read past the request head) to an [`UpgradableResponse`]. The
//! middleware chain runs as usual; if a handler completes the handshake
//! through [`Context::upgrade`] the socket becomes a server-role WebSocket,
//! otherwise the built response is serialised onto the wire when the chain
//! returns.
//!
//! [`Context::upgrade`]: crate::Context::upgrade

use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use futures_util::StreamExt;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH};
use hyper::StatusCode;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::response::{Body, Response};
use crate::{Error, Result};

/// Alias for the byte streams the upgrade path owns.
pub trait RawIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawIo for T {}

/// A boxed raw connection.
pub type BoxIo = Box<dyn RawIo>;

/// The client-facing WebSocket produced by a completed handshake.
pub type ServerWebSocket = WebSocketStream<BoxIo>;

pin_project! {
    /// A stream that replays a buffered prefix before reading from the
    /// underlying connection. Used to rewind bytes consumed while parsing
    /// or sniffing the request head.
    pub struct Prefixed<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> Prefixed<S> {
    /// Wrap `inner`, replaying `prefix` first.
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S> std::fmt::Debug for Prefixed<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prefixed")
            .field("buffered", &self.prefix.len())
            .finish()
    }
}

impl<S: AsyncRead> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Buffering,
    Responding,
    Upgraded,
}

/// A write target that either produces an HTTP/1.1 response on a raw
/// socket or relinquishes the socket to a WebSocket handshake.
///
/// The target starts out **buffering**: nothing has touched the wire and
/// both plain responses and upgrades are possible. The first head write
/// serialises the status line and headers and moves to **responding**;
/// completing a handshake moves to **upgraded**. Once the head has left
/// the buffering state, further header mutation or upgrade attempts fail
/// with [`Error::HeadersAlreadySent`].
pub struct UpgradableResponse {
    io: Option<BoxIo>,
    state: State,
    ws_key: Option<String>,
}

impl std::fmt::Debug for UpgradableResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradableResponse")
            .field("state", &self.state)
            .finish()
    }
}

impl UpgradableResponse {
    /// Take ownership of a connection. `leftover` holds bytes read past
    /// the request head; `ws_key` is the request's `Sec-WebSocket-Key`
    /// when it carried one.
    pub fn new<S>(io: S, leftover: Bytes, ws_key: Option<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            io: Some(Box::new(Prefixed::new(leftover, io))),
            state: State::Buffering,
            ws_key,
        }
    }

    /// Whether the socket has been handed to a WebSocket.
    pub fn is_upgraded(&self) -> bool {
        self.state == State::Upgraded
    }

    /// Complete the server-side WebSocket handshake and hand over the
    /// socket. Only valid while buffering.
    pub async fn upgrade(&mut self) -> Result<ServerWebSocket> {
        if self.state != State::Buffering {
            return Err(Error::HeadersAlreadySent);
        }
        let key = self
            .ws_key
            .take()
            .ok_or_else(|| Error::UpgradeFailed("request has no Sec-WebSocket-Key".into()))?;
        let mut io = self.io.take().ok_or(Error::HeadersAlreadySent)?;

        let accept = derive_accept_key(key.as_bytes());
        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept
        );
        io.write_all(head.as_bytes()).await?;
        io.flush().await?;

        self.state = State::Upgraded;
        Ok(WebSocketStream::from_raw_socket(io, Role::Server, None).await)
    }

    /// Serialise the status line and headers. Moves to responding; a
    /// second call fails.
    pub async fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<()> {
        if self.state != State::Buffering {
            return Err(Error::HeadersAlreadySent);
        }
        let io = self.io.as_mut().ok_or(Error::HeadersAlreadySent)?;
        io.write_all(&serialize_head(status, headers)).await?;
        self.state = State::Responding;
        Ok(())
    }

    /// Append body bytes. A write while still buffering serialises the
    /// head first; writes after an upgrade are no-ops.
    pub async fn write_body(&mut self, res: &Response, chunk: &[u8]) -> Result<()> {
        match self.state {
            State::Upgraded => return Ok(()),
            State::Buffering => self.write_head(res.status(), res.headers()).await?,
            State::Responding => {}
        }
        let io = self.io.as_mut().ok_or(Error::HeadersAlreadySent)?;
        io.write_all(chunk).await?;
        Ok(())
    }

    /// Write out the assembled response and close the connection. After
    /// an upgrade this is a no-op: the WebSocket owner is responsible for
    /// closing the session.
    pub async fn finish(&mut self, res: &mut Response) -> Result<()> {
        if self.state == State::Upgraded {
            return Ok(());
        }

        if self.state == State::Buffering {
            if let Some(len) = res.body().len() {
                if !res.contains(&CONTENT_LENGTH) {
                    res.insert_header(CONTENT_LENGTH, HeaderValue::from(len));
                }
            }
            // this connection is not reused; absent lengths are close-delimited
            res.insert_header(CONNECTION, HeaderValue::from_static("close"));
            self.write_head(res.status(), res.headers()).await?;
        }

        match res.take_body() {
            Body::Empty => {}
            Body::Bytes(bytes) => {
                let io = self.io.as_mut().ok_or(Error::HeadersAlreadySent)?;
                io.write_all(&bytes).await?;
            }
            Body::Stream { mut stream, .. } => {
                let io = self.io.as_mut().ok_or(Error::HeadersAlreadySent)?;
                while let Some(chunk) = stream.next().await {
                    io.write_all(&chunk?).await?;
                }
            }
        }

        let io = self.io.as_mut().ok_or(Error::HeadersAlreadySent)?;
        io.flush().await?;
        io.shutdown().await?;
        Ok(())
    }
}

fn serialize_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}
