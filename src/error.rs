//! Error types.

use hyper::StatusCode;

/// The error type used throughout the routing core.
///
/// Handlers map their own failures onto HTTP responses wherever the
/// behaviour is part of their contract (the static handler answers 404
/// itself, the proxy answers 503); everything that escapes a handler
/// travels up the middleware chain as one of these variants and is
/// rendered by the server glue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request could not be interpreted (e.g. an undecodable path).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No file or route matched.
    #[error("not found")]
    NotFound,

    /// The request resolved to something it may not touch.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The upstream could not be reached, timed out, or aborted.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The WebSocket handshake failed before the connection opened.
    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(String),

    /// Headers were mutated (or an upgrade attempted) after the response
    /// head was committed to the wire.
    #[error("headers already sent")]
    HeadersAlreadySent,

    /// `next()` was driven more than once from the same chain frame.
    #[error("next() called more than once in a middleware chain")]
    InvalidChainUsage,

    /// A status raised explicitly through [`Context::throw`].
    ///
    /// [`Context::throw`]: crate::Context::throw
    #[error("{status}: {message}")]
    Status {
        /// HTTP status to answer with.
        status: StatusCode,
        /// Operator-facing message, also used as the response body.
        message: String,
    },

    /// Invalid configuration detected while binding routes. Fatal at
    /// startup.
    #[error("configuration error: {0}")]
    Configuration(anyhow::Error),

    /// An I/O failure outside the mappings above.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An invalid header name, value, or URI component.
    #[error(transparent)]
    Http(#[from] hyper::http::Error),
}

impl Error {
    /// Build a configuration error from anything `anyhow` accepts.
    pub fn config(err: impl Into<anyhow::Error>) -> Self {
        Error::Configuration(err.into())
    }

    /// The HTTP status this error renders as when it escapes the chain.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Status { status, .. } => *status,
            Error::UpgradeFailed(_)
            | Error::HeadersAlreadySent
            | Error::InvalidChainUsage
            | Error::Configuration(_)
            | Error::Io(_)
            | Error::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A specialized Result type for the routing core.
pub type Result<T = ()> = std::result::Result<T, Error>;
