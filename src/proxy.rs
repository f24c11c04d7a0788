//! Reverse proxying, for plain HTTP and WebSocket sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderName};
use hyper::{Client, StatusCode, Uri};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::middleware::{Middleware, Next};
use crate::response::Body;
use crate::{Context, Error, Result};

fn default_timeout() -> u64 {
    3000
}

fn default_req_filter() -> Vec<String> {
    vec!["host".to_string()]
}

fn default_res_filter() -> Vec<String> {
    vec!["connection".to_string(), "transfer-encoding".to_string()]
}

/// Options for [`Proxy`].
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Upstream base URL; its scheme and authority replace the incoming
    /// ones while the (possibly rewritten) path and query are preserved.
    #[serde(default)]
    pub upstream: String,
    /// Bridge WebSocket upgrades to the upstream instead of forwarding
    /// them as plain requests.
    #[serde(default)]
    pub websocket: bool,
    /// Upstream response deadline, in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Suppress per-request log events.
    #[serde(default)]
    pub nolog: bool,
    /// Request headers not forwarded upstream.
    #[serde(default = "default_req_filter", rename = "reqHeadersFilter")]
    pub req_headers_filter: Vec<String>,
    /// Upstream response headers not copied back.
    #[serde(default = "default_res_filter", rename = "resHeadersFilter")]
    pub res_headers_filter: Vec<String>,
}

impl ProxyConfig {
    /// Options forwarding to `upstream` with everything else at defaults.
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            websocket: false,
            timeout: default_timeout(),
            nolog: false,
            req_headers_filter: default_req_filter(),
            res_headers_filter: default_res_filter(),
        }
    }

    /// Parse the declarative handler config: a bare string is the
    /// upstream URL, an object carries the full option set.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let config = match value {
            serde_json::Value::String(upstream) => Self::new(upstream),
            serde_json::Value::Object(_) => serde_json::from_value(value.clone())
                .map_err(|err| Error::config(anyhow::anyhow!("proxy: {}", err)))?,
            other => {
                return Err(Error::config(anyhow::anyhow!(
                    "proxy: expected an upstream string or an options object, got {}",
                    other
                )))
            }
        };
        Ok(config)
    }
}

/// The reverse-proxy middleware.
///
/// Forwards matching requests to the configured upstream and copies the
/// response back, or — when `websocket` is enabled and the request is an
/// upgrade — completes both handshakes and bridges the two sockets. An
/// unreachable upstream answers 503 (HTTP) or falls through so a later
/// handler can respond (WebSocket).
pub struct Proxy {
    config: ProxyConfig,
    upstream: Url,
    client: Client<HttpConnector>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("upstream", &self.upstream.as_str())
            .finish()
    }
}

impl Proxy {
    /// Create the middleware. An unparsable upstream URL is a
    /// configuration error.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        if config.upstream.is_empty() {
            return Err(Error::config(anyhow::anyhow!("proxy: missing upstream")));
        }
        let upstream = Url::parse(&config.upstream)
            .map_err(|err| Error::config(anyhow::anyhow!("proxy: bad upstream URL: {}", err)))?;
        match upstream.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(Error::config(anyhow::anyhow!(
                    "proxy: unsupported upstream scheme {:?}",
                    other
                )))
            }
        }
        Ok(Self {
            config,
            upstream,
            client: Client::new(),
        })
    }

    fn filters_request(&self, name: &HeaderName) -> bool {
        let name = name.as_str();
        name.starts_with(':')
            || self
                .config
                .req_headers_filter
                .iter()
                .any(|f| f.eq_ignore_ascii_case(name))
    }

    fn filters_response(&self, name: &HeaderName) -> bool {
        let name = name.as_str();
        name.starts_with(':')
            || self
                .config
                .res_headers_filter
                .iter()
                .any(|f| f.eq_ignore_ascii_case(name))
    }

    /// Overlay the upstream scheme and authority onto the incoming
    /// request, keeping the current (possibly rewritten) path and query.
    fn upstream_uri(&self, ctx: &Context) -> Result<Uri> {
        let scheme = match self.upstream.scheme() {
            "ws" => "http",
            "wss" => "https",
            other => other,
        };
        let authority = self
            .upstream
            .host_str()
            .map(|host| match self.upstream.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            })
            .ok_or_else(|| Error::UpstreamUnavailable("upstream URL has no host".into()))?;
        let path_and_query = if ctx.querystring().is_empty() {
            ctx.path().to_string()
        } else {
            format!("{}?{}", ctx.path(), ctx.querystring())
        };
        Ok(Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()?)
    }

    async fn forward_http(&self, ctx: &mut Context, next: Next) -> Result<()> {
        let uri = self.upstream_uri(ctx)?;

        let mut headers = HeaderMap::new();
        for (name, value) in ctx.headers() {
            if !self.filters_request(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        let body = ctx.take_body().unwrap_or_else(hyper::Body::empty);
        let mut req = hyper::Request::builder()
            .method(ctx.method().clone())
            .uri(uri)
            .body(body)?;
        *req.headers_mut() = headers;

        let deadline = Duration::from_millis(self.config.timeout);
        // dropping the in-flight future on timeout or client abort also
        // tears down the upstream request
        let outcome = tokio::time::timeout(deadline, self.client.request(req)).await;
        let upstream_res = match outcome {
            Err(_) => return self.fail(ctx, next, "upstream timed out".to_string()).await,
            Ok(Err(err)) => return self.fail(ctx, next, err.to_string()).await,
            Ok(Ok(res)) => res,
        };

        let (parts, body) = upstream_res.into_parts();
        let bytes = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(err) => return self.fail(ctx, next, err.to_string()).await,
        };

        for (name, value) in &parts.headers {
            if !self.filters_response(name) {
                ctx.res.headers_mut().append(name.clone(), value.clone());
            }
        }
        ctx.res.set_status(parts.status);
        let length = bytes.len();
        ctx.res.set_body(bytes);
        ctx.log(
            "Proxy",
            format_args!("{} ({} bytes)", parts.status, length),
        );
        next.run(ctx).await
    }

    /// Record the failure, answer 503 and keep the chain going.
    async fn fail(&self, ctx: &mut Context, next: Next, message: String) -> Result<()> {
        ctx.res.set_status(StatusCode::SERVICE_UNAVAILABLE);
        ctx.res.set_body(Body::Empty);
        ctx.log("Proxy-Failed", &message);
        ctx.set_error(Error::UpstreamUnavailable(message));
        next.run(ctx).await
    }

    async fn forward_ws(&self, ctx: &mut Context, next: Next) -> Result<()> {
        let mut url = self.upstream.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            _ => "wss",
        };
        if url.set_scheme(scheme).is_err() {
            return Err(Error::UpgradeFailed("cannot derive upstream ws URL".into()));
        }
        url.set_path(ctx.path());
        url.set_query(if ctx.querystring().is_empty() {
            None
        } else {
            Some(ctx.querystring())
        });

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| Error::UpgradeFailed(err.to_string()))?;
        for (name, value) in ctx.headers() {
            if self.filters_request(name) || is_handshake_header(name) {
                continue;
            }
            if let (Ok(ws_name), Ok(ws_value)) = (
                tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(name.as_ref()),
                tokio_tungstenite::tungstenite::http::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                request.headers_mut().append(ws_name, ws_value);
            }
        }

        match connect_async(request).await {
            Ok((upstream_ws, _)) => {
                let client_ws = ctx.upgrade().await?;
                let counter = ctx.bytes_counter();
                ctx.log("ProxyWS", url.as_str());
                tokio::spawn(bridge(client_ws, upstream_ws, counter));
                Ok(())
            }
            Err(err) => {
                // let a later handler respond normally
                ctx.set_ws(false);
                ctx.res.set_status(StatusCode::OK);
                ctx.res.set_body(Body::Empty);
                ctx.log("ProxyWS-Failed", &err);
                ctx.set_error(Error::UpgradeFailed(err.to_string()));
                next.run(ctx).await
            }
        }
    }
}

#[async_trait]
impl Middleware for Proxy {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if self.config.nolog {
            ctx.set_log_enabled(false);
        }
        if ctx.ws() && self.config.websocket {
            return self.forward_ws(ctx, next).await;
        }
        self.forward_http(ctx, next).await
    }

    fn name(&self) -> &str {
        "proxy"
    }
}

/// Headers the client handshake machinery owns.
fn is_handshake_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name == "connection" || name == "upgrade" || name.starts_with("sec-websocket-")
}

/// Pump frames between the two peers until either side closes or errors,
/// counting payload bytes.
async fn bridge<C, U>(mut client: C, mut upstream: U, counter: Arc<AtomicU64>)
where
    C: Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin,
    U: Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin,
{
    loop {
        tokio::select! {
            msg = client.next() => match msg {
                Some(Ok(msg)) => {
                    counter.fetch_add(msg.len() as u64, Ordering::Relaxed);
                    let closing = msg.is_close();
                    if upstream.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                Some(Err(_)) | None => break,
            },
            msg = upstream.next() => match msg {
                Some(Ok(msg)) => {
                    counter.fetch_add(msg.len() as u64, Ordering::Relaxed);
                    let closing = msg.is_close();
                    if client.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                Some(Err(_)) | None => break,
            },
        }
    }
    let _ = client.close().await;
    let _ = upstream.close().await;
}
