//! Outpost is a configurable HTTP edge server. It terminates client
//! connections, routes each request by virtual host and URL path to a
//! composable chain of middlewares — static files, reverse proxies,
//! redirects, rewrites, mounted applications — and returns the assembled
//! response. WebSocket upgrades travel through the same chain and can be
//! bridged to an upstream.
//!
//! # Getting started
//!
//! Routing is driven by a declarative document (key order matters):
//!
//! ```no_run
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> outpost::Result<()> {
//!     let registry = outpost::Registry::new();
//!     let config = json!({
//!         "routes": {
//!             "example.com": {
//!                 "^/static": { "static": "/var/www" },
//!                 "^/api": { "proxy": "http://127.0.0.1:8080" },
//!                 "/old": { "redirect": "/new", "code": 302 },
//!             },
//!             "*": { "^/": "echo" },
//!         }
//!     });
//!     let server = outpost::Server::from_config(&registry, &config)?;
//!     server.listen("127.0.0.1:8080").await
//! }
//! ```
//!
//! Routing trees can also be assembled programmatically; see
//! [`HostRouter`] and [`PathRouter`]. Middlewares are plain async
//! functions over a [`Context`] and a [`Next`]:
//!
//! ```no_run
//! use outpost::{Context, Next};
//!
//! async fn deny_teapots(ctx: &mut Context, next: Next) -> outpost::Result<()> {
//!     if ctx.path().starts_with("/coffee") {
//!         ctx.set_status(hyper::StatusCode::IM_A_TEAPOT);
//!         ctx.res.set_body("no");
//!         return Ok(());
//!     }
//!     next.run(ctx).await
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(missing_docs, unreachable_pub, rust_2018_idioms)]

mod config;
mod context;
mod error;
mod host;
mod middleware;
mod mount;
mod proxy;
mod redirect;
mod response;
mod router;
mod server;
mod static_files;
mod upgrade;

pub use config::{bind, AppInit, Echo, HandlerFactory, Registry};
pub use context::Context;
pub use error::{Error, Result};
pub use host::{HostPattern, HostRouter};
pub use middleware::{ChainTail, Endpoint, Middleware, Next, Stack};
pub use mount::{ExecutionContext, Mounted};
pub use proxy::{Proxy, ProxyConfig};
pub use redirect::{Redirect, Rewrite};
pub use response::{Body, Response};
pub use router::PathRouter;
pub use server::Server;
pub use static_files::{send, HeadersHook, SendOutcome, StaticConfig, StaticFiles};
pub use upgrade::{BoxIo, Prefixed, RawIo, ServerWebSocket, UpgradableResponse};
