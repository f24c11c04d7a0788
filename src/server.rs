//! The edge server: connection acceptance and request dispatch.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, SEC_WEBSOCKET_KEY};
use hyper::{Method, StatusCode, Uri};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::config::{self, Registry};
use crate::context::unspecified_peer;
use crate::middleware::{Endpoint, Middleware, Next};
use crate::response::Response;
use crate::upgrade::{Prefixed, UpgradableResponse};
use crate::{Context, Error, Result};

/// Upper bound on a request head while sniffing for an upgrade.
const MAX_HEAD: usize = 16 * 1024;
/// Header slots offered to the head parser on the upgrade path.
const MAX_HEADERS: usize = 64;

/// An edge server driving one routing tree.
///
/// Plain HTTP connections are served through hyper; connections whose
/// first request asks for a WebSocket upgrade are parsed in place and
/// driven against an [`UpgradableResponse`] owning the socket, so the
/// same middleware chain services both.
pub struct Server {
    handler: Arc<dyn Middleware>,
}

impl Clone for Server {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish()
    }
}

impl Server {
    /// Create a server around a routing middleware (usually a bound
    /// [`HostRouter`]).
    ///
    /// [`HostRouter`]: crate::HostRouter
    pub fn new(handler: impl Middleware) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Bind a declarative route table and wrap it in a server.
    pub fn from_config(registry: &Registry, config: &Value) -> Result<Self> {
        Ok(Self::new(config::bind(registry, config)?))
    }

    /// Respond to a request with a response.
    ///
    /// This method is useful for testing routing trees directly, or for
    /// creating servers over custom transports.
    pub async fn respond(&self, req: hyper::Request<hyper::Body>) -> hyper::Response<hyper::Body> {
        self.respond_from(req, unspecified_peer(), false).await
    }

    /// Respond to a request arriving from `peer`.
    pub async fn respond_from(
        &self,
        req: hyper::Request<hyper::Body>,
        peer: SocketAddr,
        secure: bool,
    ) -> hyper::Response<hyper::Body> {
        let mut ctx = Context::from_request(req, peer, secure);
        match self.dispatch(&mut ctx).await {
            Ok(()) => ctx.res.into(),
            Err(err) => error_response(&err),
        }
    }

    async fn dispatch(&self, ctx: &mut Context) -> Result<()> {
        let next = Next::new(Arc::new(Vec::new()), Arc::new(NotFound));
        self.handler.clone().handle(ctx, next).await
    }

    /// Bind `addr` and serve until the listener fails.
    pub async fn listen(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(target: "outpost", addr = %listener.local_addr()?, "listening");
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream, peer).await {
                    tracing::debug!(target: "outpost", error = %err, "connection closed");
                }
            });
        }
    }

    /// Read the first request head, then route the connection: WebSocket
    /// upgrades keep the raw socket, everything else goes to hyper with
    /// the sniffed bytes replayed in front.
    async fn handle_connection(self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        let head_end = loop {
            if let Some(end) = find_head_end(&buf) {
                break Some(end);
            }
            if buf.len() > MAX_HEAD {
                break None;
            }
            if stream.read_buf(&mut buf).await? == 0 {
                // peer went away before sending a full head
                return Ok(());
            }
        };

        match head_end {
            Some(end) if head_is_upgrade(&buf[..end]) => {
                self.handle_upgrade(stream, buf.freeze(), end, peer).await
            }
            _ => self.serve_http(stream, buf.freeze(), peer).await,
        }
    }

    async fn serve_http(self, stream: TcpStream, prefix: Bytes, peer: SocketAddr) -> Result<()> {
        let io = Prefixed::new(prefix, stream);
        let server = self.clone();
        hyper::server::conn::Http::new()
            .serve_connection(
                io,
                hyper::service::service_fn(move |req| {
                    let server = server.clone();
                    async move {
                        Ok::<_, Infallible>(server.respond_from(req, peer, false).await)
                    }
                }),
            )
            .await
            .map_err(|err| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
    }

    /// Drive the chain for an upgrade request. If no handler completed
    /// the handshake, the assembled response is serialised onto the
    /// socket instead.
    async fn handle_upgrade(
        self,
        stream: TcpStream,
        buf: Bytes,
        head_end: usize,
        peer: SocketAddr,
    ) -> Result<()> {
        let parsed = match parse_head(&buf[..head_end]) {
            Ok(parsed) => parsed,
            Err(err) => {
                let mut target = UpgradableResponse::new(stream, Bytes::new(), None);
                let mut res = Response::new();
                res.set_status(StatusCode::BAD_REQUEST);
                res.set_body(err.to_string());
                return target.finish(&mut res).await;
            }
        };

        let ws_key = parsed
            .headers
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let leftover = buf.slice(head_end..);
        let upgradable = UpgradableResponse::new(stream, leftover, ws_key);
        let mut ctx = Context::from_upgrade(
            parsed.method,
            parsed.uri,
            parsed.headers,
            peer,
            false,
            upgradable,
        );

        let outcome = self.dispatch(&mut ctx).await;
        if ctx.upgraded() {
            // the WebSocket owner has the socket now
            return Ok(());
        }
        let mut target = match ctx.take_upgradable() {
            Some(target) => target,
            None => return Ok(()),
        };
        match outcome {
            Ok(()) => {
                let mut res = std::mem::take(&mut ctx.res);
                if !res.touched() {
                    res.set_status(StatusCode::NOT_FOUND);
                    res.set_body("Not Found");
                }
                target.finish(&mut res).await
            }
            Err(err) => {
                let mut res = Response::new();
                res.set_status(err.status());
                res.set_body(err.to_string());
                target.finish(&mut res).await
            }
        }
    }
}

struct ParsedHead {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

fn parse_head(head: &[u8]) -> Result<ParsedHead> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut slots);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::BadRequest("truncated request head".into()))
        }
        Err(err) => return Err(Error::BadRequest(format!("malformed request head: {}", err))),
    }

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| Error::BadRequest("missing method".into()))?;
    let uri = req
        .path
        .and_then(|p| p.parse::<Uri>().ok())
        .ok_or_else(|| Error::BadRequest("missing request target".into()))?;

    let mut headers = HeaderMap::new();
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|err| Error::BadRequest(format!("bad header name: {}", err)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|err| Error::BadRequest(format!("bad header value: {}", err)))?;
        headers.append(name, value);
    }

    Ok(ParsedHead {
        method,
        uri,
        headers,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Whether a request head asks for a WebSocket upgrade.
fn head_is_upgrade(head: &[u8]) -> bool {
    let head = String::from_utf8_lossy(head);
    head.lines().skip(1).any(|line| {
        match line.split_once(':') {
            Some((name, value)) => {
                name.trim().eq_ignore_ascii_case("upgrade")
                    && value.to_ascii_lowercase().contains("websocket")
            }
            None => false,
        }
    })
}

/// The outermost continuation: requests that escape the routing layer
/// with an untouched response become a plain 404.
struct NotFound;

#[async_trait]
impl Endpoint for NotFound {
    async fn call(&self, ctx: &mut Context) -> Result<()> {
        if !ctx.res.touched() {
            ctx.res.set_status(StatusCode::NOT_FOUND);
            ctx.res.set_body("Not Found");
        }
        Ok(())
    }
}

fn error_response(err: &Error) -> hyper::Response<hyper::Body> {
    hyper::Response::builder()
        .status(err.status())
        .body(hyper::Body::from(err.to_string()))
        .unwrap()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn upgrade_sniffing_is_case_insensitive() {
        let head = b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(head_is_upgrade(head));
        let head = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(!head_is_upgrade(head));
        // an upgrade to something else is not ours
        let head = b"GET / HTTP/1.1\r\nUpgrade: h2c\r\n\r\n";
        assert!(!head_is_upgrade(head));
    }

    #[test]
    fn parse_head_extracts_the_request_line() {
        let head = b"GET /chat?room=1 HTTP/1.1\r\nHost: a.example\r\nSec-WebSocket-Key: abc\r\n\r\n";
        let parsed = parse_head(head).unwrap();
        assert_eq!(parsed.method, Method::GET);
        assert_eq!(parsed.uri.path(), "/chat");
        assert_eq!(parsed.uri.query(), Some("room=1"));
        assert_eq!(parsed.headers.get("host").unwrap(), "a.example");
    }

    #[test]
    fn garbage_heads_are_bad_requests() {
        assert!(matches!(
            parse_head(b"\0\0\0\r\n\r\n"),
            Err(Error::BadRequest(_))
        ));
    }
}
