//! The per-request context.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST, LOCATION};
use hyper::{Method, StatusCode, Uri, Version};

use crate::response::Response;
use crate::upgrade::{ServerWebSocket, UpgradableResponse};
use crate::{Error, Result};

/// ## The context of a request.
///
/// One `Context` is created per request (or per WebSocket session) and
/// owned by it exclusively. It carries the parsed request, the response
/// under construction, and the scratch state middlewares communicate
/// through: the rewritable current path, the matched site, the active
/// handler name, the log gate and the byte counter.
pub struct Context {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    path: String,
    querystring: String,
    host: String,
    hostname: String,
    ip: IpAddr,
    secure: bool,
    body: Option<hyper::Body>,

    /// The response that will be sent.
    pub res: Response,

    site: Option<String>,
    handler: Option<String>,
    ws: bool,
    upgraded: bool,
    bytes: Arc<AtomicU64>,
    error: Option<Error>,
    log_enabled: bool,
    started: Instant,
    upgradable: Option<UpgradableResponse>,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync + 'static>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("hostname", &self.hostname)
            .field("site", &self.site)
            .field("handler", &self.handler)
            .field("ws", &self.ws)
            .field("res", &self.res)
            .finish()
    }
}

impl Context {
    /// Create a [Context] from a plain HTTP request.
    pub fn from_request(req: hyper::Request<hyper::Body>, peer: SocketAddr, secure: bool) -> Self {
        let (parts, body) = req.into_parts();
        let hyper::http::request::Parts {
            method,
            uri,
            version,
            headers,
            ..
        } = parts;
        Self::build(method, uri, version, headers, Some(body), peer, secure, None)
    }

    /// Create a [Context] for the connection-upgrade path, where the raw
    /// socket is owned by an [UpgradableResponse].
    pub fn from_upgrade(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        peer: SocketAddr,
        secure: bool,
        upgradable: UpgradableResponse,
    ) -> Self {
        let mut ctx = Self::build(
            method,
            uri,
            Version::HTTP_11,
            headers,
            None,
            peer,
            secure,
            Some(upgradable),
        );
        ctx.ws = true;
        ctx
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        body: Option<hyper::Body>,
        peer: SocketAddr,
        secure: bool,
        upgradable: Option<UpgradableResponse>,
    ) -> Self {
        let path = uri.path().to_string();
        let querystring = uri.query().unwrap_or("").to_string();
        let host = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let hostname = strip_port(&host).to_ascii_lowercase();
        let ip = forwarded_ip(&headers).unwrap_or_else(|| peer.ip());

        Self {
            method,
            uri,
            version,
            headers,
            path,
            querystring,
            host,
            hostname,
            ip,
            secure,
            body,
            res: Response::new(),
            site: None,
            handler: None,
            ws: false,
            upgraded: false,
            bytes: Arc::new(AtomicU64::new(0)),
            error: None,
            log_enabled: true,
            started: Instant::now(),
            upgradable,
            extensions: HashMap::new(),
        }
    }

    /// Access the request's HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Access the request's original URI. Rewrites do not touch this.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Access the request's HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The `Host` header as sent by the client (may carry a port).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The request hostname: `Host` without the port, lowercased.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The current request path. Rewrites and mounts edit this in place;
    /// downstream middlewares observe the edited value.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Replace the current request path.
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    /// The raw query string, without the leading `?`.
    pub fn querystring(&self) -> &str {
        &self.querystring
    }

    /// Access the request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a request header as a string.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The client address, honouring the first `X-Forwarded-For` entry.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Whether the client connection is TLS-terminated.
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Whether this request arrived as a WebSocket upgrade.
    pub fn ws(&self) -> bool {
        self.ws
    }

    /// Clear or set the WebSocket flag. The proxy clears this when the
    /// upstream handshake fails so later handlers respond normally.
    pub fn set_ws(&mut self, ws: bool) {
        self.ws = ws;
    }

    /// Whether [`upgrade`] has been driven to completion.
    ///
    /// [`upgrade`]: Context::upgrade
    pub fn upgraded(&self) -> bool {
        self.upgraded
    }

    /// Complete the client WebSocket handshake, relinquishing the raw
    /// socket. Only available on the upgrade path, and only before any
    /// response bytes were written.
    pub async fn upgrade(&mut self) -> Result<ServerWebSocket> {
        let upgradable = self
            .upgradable
            .as_mut()
            .ok_or_else(|| Error::UpgradeFailed("connection is not upgradable".into()))?;
        let ws = upgradable.upgrade().await?;
        self.upgraded = true;
        Ok(ws)
    }

    /// Take the response target for the upgrade path back out of the
    /// context once the chain has finished.
    pub(crate) fn take_upgradable(&mut self) -> Option<UpgradableResponse> {
        self.upgradable.take()
    }

    /// Take the request body. Returns `None` if it was already taken or
    /// the request carried none (upgrade path).
    pub fn take_body(&mut self) -> Option<hyper::Body> {
        self.body.take()
    }

    /// The site pattern that matched this request, if routing got that far.
    pub fn site(&self) -> Option<&str> {
        self.site.as_deref()
    }

    /// Record the matched site pattern.
    pub fn set_site(&mut self, site: impl Into<String>) {
        self.site = Some(site.into());
    }

    /// The handler currently servicing the request, for log lines.
    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    /// Set the current handler name. Returns the previous value so mount
    /// wrappers can restore it.
    pub fn set_handler(&mut self, handler: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.handler, handler)
    }

    /// The shared byte counter for this request. WebSocket bridges clone
    /// it and keep counting after the chain has unwound.
    pub fn bytes_counter(&self) -> Arc<AtomicU64> {
        self.bytes.clone()
    }

    /// Bytes transferred so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// The last error a handler recorded without aborting the chain.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Record an error without aborting the chain.
    pub fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    /// Whether per-request logging is enabled. Handlers configured with
    /// `nolog` clear this.
    pub fn log_enabled(&self) -> bool {
        self.log_enabled
    }

    /// Enable or disable per-request logging for downstream consumers.
    pub fn set_log_enabled(&mut self, enabled: bool) {
        self.log_enabled = enabled;
    }

    /// Time since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Set a response header. Invalid names or values are an error.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(hyper::http::Error::from)?;
        let value = HeaderValue::from_str(value).map_err(hyper::http::Error::from)?;
        self.res.insert_header(name, value);
        Ok(())
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.res.status()
    }

    /// Set the response status.
    pub fn set_status(&mut self, status: StatusCode) {
        self.res.set_status(status);
    }

    /// Respond with a redirect to `url`. Uses status 302 Found; terminal
    /// middlewares that need another status set it afterwards.
    pub fn redirect(&mut self, url: &str) {
        self.res.set_status(StatusCode::FOUND);
        if let Ok(value) = HeaderValue::from_str(url) {
            self.res.insert_header(LOCATION, value);
        }
    }

    /// Build a status error to return from a handler.
    ///
    /// ```ignore
    /// return Err(ctx.throw(400, "cannot decode path"));
    /// ```
    pub fn throw(&self, code: u16, message: impl Into<String>) -> Error {
        Error::Status {
            status: StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: message.into(),
        }
    }

    /// Emit a log event for this request, tagged with the matched site and
    /// the active handler. Suppressed when logging is disabled.
    pub fn log(&self, event: &str, message: impl Display) {
        if self.log_enabled {
            let site = self.site.as_deref().unwrap_or("-");
            let handler = self.handler.as_deref().unwrap_or("-");
            tracing::info!(
                target: "outpost::access",
                event,
                site,
                handler,
                method = %self.method,
                path = %self.path,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "{}",
                message
            );
        }
    }

    /// Try borrow a scratch extension value.
    pub fn ext<T: 'static>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Try borrow a scratch extension value mutably.
    pub fn ext_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>())
    }

    /// Insert a scratch extension value, returning any previous one.
    pub fn insert_ext<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|v| v.downcast::<T>().map(|v| *v).ok())
    }

    /// Take a scratch extension value out of the context.
    pub fn take_ext<T: 'static>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().map(|v| *v).ok())
    }
}

/// Strip an optional `:port` suffix, leaving IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if let Some(end) = host.strip_prefix('[').and_then(|_| host.find(']')) {
        return &host[..=end];
    }
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
}

/// A placeholder peer address for contexts driven without a socket, e.g.
/// in tests going through [`Server::respond`].
///
/// [`Server::respond`]: crate::Server::respond
pub(crate) fn unspecified_peer() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx_for(uri: &str, host: Option<&str>) -> Context {
        let mut req = hyper::Request::builder().uri(uri);
        if let Some(host) = host {
            req = req.header(HOST, host);
        }
        Context::from_request(
            req.body(hyper::Body::empty()).unwrap(),
            unspecified_peer(),
            false,
        )
    }

    #[test]
    fn hostname_is_lowercased_and_portless() {
        let ctx = ctx_for("/x", Some("Example.COM:8443"));
        assert_eq!(ctx.host(), "Example.COM:8443");
        assert_eq!(ctx.hostname(), "example.com");
    }

    #[test]
    fn hostname_falls_back_to_authority() {
        let ctx = ctx_for("http://fallback.test/x", None);
        assert_eq!(ctx.hostname(), "fallback.test");
    }

    #[test]
    fn ipv6_host_keeps_brackets() {
        let ctx = ctx_for("/", Some("[::1]:9000"));
        assert_eq!(ctx.hostname(), "[::1]");
    }

    #[test]
    fn forwarded_ip_wins_over_peer() {
        let req = hyper::Request::builder()
            .uri("/")
            .header("x-forwarded-for", "10.0.0.7, 192.168.0.1")
            .body(hyper::Body::empty())
            .unwrap();
        let ctx = Context::from_request(req, unspecified_peer(), false);
        assert_eq!(ctx.ip().to_string(), "10.0.0.7");
    }
}
