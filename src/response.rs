//! The response under construction.

use std::fmt;
use std::io;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::StatusCode;

/// A response body: absent, an in-memory buffer, or a byte stream.
pub enum Body {
    /// No body.
    Empty,
    /// A fully buffered body.
    Bytes(Bytes),
    /// A streaming body with an optional known length.
    Stream {
        /// The chunks to send.
        stream: BoxStream<'static, io::Result<Bytes>>,
        /// Total length, when known ahead of time.
        length: Option<u64>,
    },
}

impl Body {
    /// The body length, if it is knowable without consuming the body.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(bytes) => Some(bytes.len() as u64),
            Body::Stream { length, .. } => *length,
        }
    }

    /// Whether this is the `Empty` variant.
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Body::Stream { length, .. } => write!(f, "Body::Stream(length: {:?})", length),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes.into())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(s.into())
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

/// ## The response that will be sent.
///
/// Middlewares assemble the response through this builder; the server glue
/// turns it into a `hyper` response (plain HTTP) or serialises it onto the
/// raw socket (upgrade path).
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
    touched: bool,
}

impl Response {
    /// Create an empty `200 OK` response.
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Body::Empty,
            touched: false,
        }
    }

    /// Whether any middleware has written to this response. Untouched
    /// responses fall through to the outer 404.
    pub fn touched(&self) -> bool {
        self.touched
    }

    /// Get the response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Set the response status.
    pub fn set_status(&mut self, status: StatusCode) {
        self.touched = true;
        self.status = status;
    }

    /// Access the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Access the response headers mutably.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.touched = true;
        &mut self.headers
    }

    /// Get a header value as a string, if present and representable.
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether a header is already present.
    pub fn contains(&self, name: &HeaderName) -> bool {
        self.headers.contains_key(name)
    }

    /// Insert a header, replacing any previous value.
    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.touched = true;
        self.headers.insert(name, value);
    }

    /// Set the `Content-Type` header.
    pub fn set_content_type(&mut self, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.touched = true;
            self.headers.insert(CONTENT_TYPE, value);
        }
    }

    /// Set the body, updating `Content-Length` when the length is known.
    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.touched = true;
        self.body = body.into();
        match self.body.len() {
            Some(len) => {
                self.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            }
            None => {
                self.headers.remove(CONTENT_LENGTH);
            }
        }
    }

    /// Borrow the body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Take the body out, leaving `Empty` behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Response> for hyper::Response<hyper::Body> {
    fn from(res: Response) -> Self {
        let mut out = hyper::Response::new(match res.body {
            Body::Empty => hyper::Body::empty(),
            Body::Bytes(bytes) => hyper::Body::from(bytes),
            Body::Stream { stream, .. } => hyper::Body::wrap_stream(stream),
        });
        *out.status_mut() = res.status;
        *out.headers_mut() = res.headers;
        out
    }
}
