//! Static file delivery.
//!
//! Resolves a request path under a configured root (never outside it),
//! negotiates pre-compressed encodings and byte ranges, and streams the
//! result. Optionally synthesises a directory listing.

use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use hyper::header::{
    HeaderValue, ACCEPT_RANGES, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, LAST_MODIFIED,
};
use hyper::{Method, StatusCode};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::middleware::{Middleware, Next};
use crate::response::{Body, Response};
use crate::{Context, Error, Result};

fn default_true() -> bool {
    true
}

fn default_index() -> Option<String> {
    Some("index.html".to_string())
}

/// Options for [`StaticFiles`].
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    /// Directory to serve from. Required.
    #[serde(default)]
    pub root: PathBuf,
    /// URL prefix stripped before resolution; requests outside it fall
    /// through.
    #[serde(default)]
    pub base: Option<String>,
    /// Render directory listings.
    #[serde(default)]
    pub browse: bool,
    /// Suppress per-request log events.
    #[serde(default)]
    pub nolog: bool,
    /// File appended to directory requests. `null` disables.
    #[serde(default = "default_index")]
    pub index: Option<String>,
    /// Serve dot-prefixed paths instead of falling through.
    #[serde(default)]
    pub hidden: bool,
    /// Consider sibling `.gz` files when the client accepts gzip.
    #[serde(default = "default_true")]
    pub gzip: bool,
    /// Consider sibling `.br` files when the client accepts brotli.
    #[serde(default = "default_true")]
    pub brotli: bool,
    /// `Cache-Control` max-age, in milliseconds.
    #[serde(default)]
    pub maxage: u64,
    /// Add `immutable` to `Cache-Control`.
    #[serde(default)]
    pub immutable: bool,
    /// Append the index when a resolved path turns out to be a directory.
    #[serde(default = "default_true")]
    pub format: bool,
    /// Extensions to try, in order, when the request has none.
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            base: None,
            browse: false,
            nolog: false,
            index: default_index(),
            hidden: false,
            gzip: true,
            brotli: true,
            maxage: 0,
            immutable: false,
            format: true,
            extensions: None,
        }
    }
}

impl StaticConfig {
    /// Options serving `root` with everything else at defaults.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Parse the declarative handler config: a bare string is the root,
    /// an object carries the full option set.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let config = match value {
            serde_json::Value::String(root) => Self::new(root),
            serde_json::Value::Object(map) => {
                if map.contains_key("setHeaders") {
                    // callbacks cannot travel through a config document
                    return Err(Error::config(anyhow::anyhow!(
                        "static: setHeaders is not configurable declaratively; \
                         use StaticFiles::with_headers"
                    )));
                }
                serde_json::from_value(value.clone())
                    .map_err(|err| Error::config(anyhow::anyhow!("static: {}", err)))?
            }
            other => {
                return Err(Error::config(anyhow::anyhow!(
                    "static: expected a root string or an options object, got {}",
                    other
                )))
            }
        };
        Ok(config)
    }
}

/// Callback invoked just before a resolved file is streamed.
pub type HeadersHook = dyn Fn(&mut Response, &Path, &Metadata) + Send + Sync;

/// The static file middleware.
///
/// Serves `GET` and `HEAD` requests from the configured root; everything
/// else, and hidden paths, falls through to the rest of the chain.
/// Resolution failures are answered in place (400/403/404/500) rather
/// than escaping the chain.
pub struct StaticFiles {
    config: StaticConfig,
    headers_hook: Option<Arc<HeadersHook>>,
}

impl std::fmt::Debug for StaticFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticFiles")
            .field("root", &self.config.root)
            .finish()
    }
}

impl StaticFiles {
    /// Create the middleware. A missing root is a configuration error.
    pub fn new(config: StaticConfig) -> Result<Self> {
        if config.root.as_os_str().is_empty() {
            return Err(Error::config(anyhow::anyhow!("static: missing root")));
        }
        Ok(Self {
            config,
            headers_hook: None,
        })
    }

    /// Install a hook that may adjust response headers per served file.
    pub fn with_headers(
        mut self,
        hook: impl Fn(&mut Response, &Path, &Metadata) + Send + Sync + 'static,
    ) -> Self {
        self.headers_hook = Some(Arc::new(hook));
        self
    }
}

#[async_trait]
impl Middleware for StaticFiles {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if *ctx.method() != Method::GET && *ctx.method() != Method::HEAD {
            return next.run(ctx).await;
        }
        if self.config.nolog {
            ctx.set_log_enabled(false);
        }

        // strip the base prefix; requests outside it are not ours
        let req_path = match &self.config.base {
            Some(base) => {
                let base = base.trim_end_matches('/');
                match ctx.path().strip_prefix(base) {
                    Some(rest) if rest.is_empty() => "/".to_string(),
                    Some(rest) if rest.starts_with('/') => rest.to_string(),
                    _ => return next.run(ctx).await,
                }
            }
            None => ctx.path().to_string(),
        };

        match send(ctx, &self.config, &req_path, self.headers_hook.as_deref()).await {
            Ok(SendOutcome::Served { path, length }) => {
                ctx.log(
                    "Static",
                    format_args!("{} ({} bytes)", path.display(), length),
                );
                Ok(())
            }
            Ok(SendOutcome::Directory { path }) => {
                if self.config.browse {
                    match directory_listing(&path, &req_path).await {
                        Ok(html) => {
                            ctx.res.set_content_type("text/html; charset=utf-8");
                            ctx.res.set_body(html);
                            ctx.log("Static-Browse", path.display());
                        }
                        Err(err) => respond_with_error(ctx, err),
                    }
                } else {
                    respond_with_error(ctx, Error::NotFound);
                }
                Ok(())
            }
            Ok(SendOutcome::Hidden) => next.run(ctx).await,
            Err(err) => {
                respond_with_error(ctx, err);
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        "static"
    }
}

fn respond_with_error(ctx: &mut Context, err: Error) {
    let status = err.status();
    ctx.res.set_status(status);
    ctx.res
        .set_body(status.canonical_reason().unwrap_or("error").to_string());
    ctx.log("Static-Error", &err);
    ctx.set_error(err);
}

/// The outcome of a [`send`].
#[derive(Debug)]
pub enum SendOutcome {
    /// The file was written into the response.
    Served {
        /// Filesystem path that was served.
        path: PathBuf,
        /// Bytes in the response body.
        length: u64,
    },
    /// The path resolved to a directory with no applicable index.
    Directory {
        /// The directory's filesystem path.
        path: PathBuf,
    },
    /// A hidden segment was encountered and `hidden` is off.
    Hidden,
}

/// Resolve `req_path` under the configured root and write the file into
/// the response, negotiating encoding, ranges and conditional headers.
///
/// Errors carry their HTTP mapping: undecodable paths are `BadRequest`,
/// escapes are `Forbidden`, missing files are `NotFound`, anything else
/// from the filesystem is I/O.
pub async fn send(
    ctx: &mut Context,
    config: &StaticConfig,
    req_path: &str,
    headers_hook: Option<&HeadersHook>,
) -> Result<SendOutcome> {
    let accept_encoding = ctx.get("accept-encoding").unwrap_or("").to_string();
    let range_header = ctx.get("range").map(str::to_string);
    let is_head = *ctx.method() == Method::HEAD;

    let mut decoded = percent_decode_str(req_path)
        .decode_utf8()
        .map_err(|err| Error::BadRequest(format!("cannot decode path: {}", err)))?
        .into_owned();

    if decoded.ends_with('/') {
        match &config.index {
            Some(index) => decoded.push_str(index),
            None => {
                return Ok(SendOutcome::Directory {
                    path: contained_path(&config.root, &decoded)?.0,
                })
            }
        }
    }

    let (mut path, segments) = contained_path(&config.root, &decoded)?;

    if !config.hidden && segments.iter().any(|s| s.starts_with('.')) {
        return Ok(SendOutcome::Hidden);
    }

    // pre-compressed siblings: brotli wins over gzip
    let mut encoding = None;
    let mut mime_path = path.clone();
    if config.brotli && accepts_encoding(&accept_encoding, "br") && is_file(&suffixed(&path, ".br")).await
    {
        path = suffixed(&path, ".br");
        encoding = Some("br");
    } else if config.gzip
        && accepts_encoding(&accept_encoding, "gzip")
        && is_file(&suffixed(&path, ".gz")).await
    {
        path = suffixed(&path, ".gz");
        encoding = Some("gzip");
    }
    if encoding.is_some() {
        ctx.res.headers_mut().remove(CONTENT_LENGTH);
    }

    if path.extension().is_none() {
        if let Some(extensions) = &config.extensions {
            for ext in extensions {
                let candidate = suffixed(&path, &format!(".{}", ext.trim_start_matches('.')));
                if is_file(&candidate).await {
                    path = candidate;
                    mime_path = path.clone();
                    break;
                }
            }
        }
    }

    let mut meta = fs::metadata(&path).await.map_err(map_stat_err)?;
    if meta.is_dir() {
        match (&config.index, config.format) {
            (Some(index), true) => {
                path.push(index);
                mime_path = path.clone();
                meta = fs::metadata(&path).await.map_err(map_stat_err)?;
                if meta.is_dir() {
                    return Err(Error::NotFound);
                }
            }
            _ => return Ok(SendOutcome::Directory { path }),
        }
    }

    let total = meta.len();
    let res = &mut ctx.res;
    res.insert_header(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if !res.contains(&LAST_MODIFIED) {
        if let Ok(modified) = meta.modified() {
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
                res.insert_header(LAST_MODIFIED, value);
            }
        }
    }
    if !res.contains(&CACHE_CONTROL) {
        let mut cache = format!("max-age={}", config.maxage / 1000);
        if config.immutable {
            cache.push_str(", immutable");
        }
        if let Ok(value) = HeaderValue::from_str(&cache) {
            res.insert_header(CACHE_CONTROL, value);
        }
    }
    // the type reflects the file being addressed, not the encoded sibling
    let mime = mime_guess::from_path(&mime_path).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        res.insert_header(CONTENT_TYPE, value);
    }
    if let Some(encoding) = encoding {
        res.insert_header(CONTENT_ENCODING, HeaderValue::from_static(encoding));
    }

    if let Some(hook) = headers_hook {
        hook(res, &path, &meta);
    }

    let (status, start, length, content_range) = match &range_header {
        Some(value) => match parse_range(value, total) {
            Some((start, end)) => (
                StatusCode::PARTIAL_CONTENT,
                start,
                end - start + 1,
                Some(format!("bytes {}-{}/{}", start, end, total)),
            ),
            // unsatisfiable ranges still get the whole file as a courtesy body
            None => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                0,
                total,
                Some(format!("bytes */{}", total)),
            ),
        },
        None => (StatusCode::OK, 0, total, None),
    };

    let res = &mut ctx.res;
    res.set_status(status);
    if let Some(content_range) = content_range {
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            res.insert_header(CONTENT_RANGE, value);
        }
    }

    if is_head {
        res.insert_header(CONTENT_LENGTH, HeaderValue::from(length));
    } else {
        let body = file_body(&path, start, length).await.map_err(map_stat_err)?;
        res.set_body(body);
    }

    Ok(SendOutcome::Served { path, length })
}

/// Open `path` and stream `length` bytes starting at `start`.
async fn file_body(path: &Path, start: u64, length: u64) -> std::io::Result<Body> {
    let mut file = File::open(path).await?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let stream = ReaderStream::new(file.take(length));
    Ok(Body::Stream {
        stream: stream.boxed(),
        length: Some(length),
    })
}

/// Lexically resolve `decoded` under `root`. Escaping the root is fatal.
fn contained_path(root: &Path, decoded: &str) -> Result<(PathBuf, Vec<String>)> {
    let mut segments: Vec<String> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::Forbidden(format!("path escapes root: {}", decoded)));
                }
            }
            s => segments.push(s.to_string()),
        }
    }
    let mut path = root.to_path_buf();
    for segment in &segments {
        path.push(segment);
    }
    Ok((path, segments))
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

async fn is_file(path: &Path) -> bool {
    matches!(fs::metadata(path).await, Ok(meta) if meta.is_file())
}

/// Whether `Accept-Encoding` admits `token` with a non-zero quality.
fn accepts_encoding(header: &str, token: &str) -> bool {
    header.split(',').any(|part| {
        let mut pieces = part.trim().split(';');
        let name = pieces.next().unwrap_or("").trim();
        if !name.eq_ignore_ascii_case(token) {
            return false;
        }
        match pieces.next().and_then(|q| q.trim().strip_prefix("q=")) {
            Some(q) => q.trim().parse::<f32>().map(|q| q > 0.0).unwrap_or(false),
            None => true,
        }
    })
}

/// Parse a `Range` header against a body of `total` bytes.
///
/// Only the first range of the first set is honoured. The unit token is
/// ignored; any unit is treated like `bytes`. `None` means the header was
/// malformed or unsatisfiable and the caller answers 416.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.splitn(2, '=').nth(1)?;
    let first = spec.split(',').next()?.trim();
    let mut ends = first.splitn(2, '-');
    let start_s = ends.next()?.trim();
    let end_s = ends.next()?.trim();

    let (start, end) = if start_s.is_empty() {
        // suffix form: the last N bytes
        let n: u64 = end_s.parse().ok()?;
        if n == 0 {
            return None;
        }
        (total.saturating_sub(n), total.checked_sub(1)?)
    } else {
        let start: u64 = start_s.parse().ok()?;
        let end = if end_s.is_empty() {
            total.checked_sub(1)?
        } else {
            end_s.parse::<u64>().ok()?.min(total.checked_sub(1)?)
        };
        (start, end)
    };

    if start > end || start >= total {
        return None;
    }
    Some((start, end))
}

fn map_stat_err(err: std::io::Error) -> Error {
    use std::io::ErrorKind;
    const ENOTDIR: i32 = 20;
    const ENAMETOOLONG: i32 = 36;
    if err.kind() == ErrorKind::NotFound
        || matches!(err.raw_os_error(), Some(ENOTDIR) | Some(ENAMETOOLONG))
    {
        Error::NotFound
    } else {
        Error::Io(err)
    }
}

/// Render a minimal HTML listing for `dir`, addressed as `url_path`.
async fn directory_listing(dir: &Path, url_path: &str) -> Result<String> {
    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await.map_err(map_stat_err)?;
    while let Some(entry) = read_dir.next_entry().await.map_err(map_stat_err)? {
        let meta = entry.metadata().await.map_err(map_stat_err)?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if meta.is_dir() {
            name.push('/');
        }
        entries.push(name);
    }
    entries.sort();

    let base = if url_path.ends_with('/') {
        url_path.to_string()
    } else {
        format!("{}/", url_path)
    };
    let title = escape_html(&base);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Index of {}</title></head>\n\
         <body>\n<h1>Index of {}</h1>\n<ul>\n",
        title, title
    );
    if base != "/" {
        html.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for name in &entries {
        let shown = escape_html(name);
        html.push_str(&format!("<li><a href=\"{}{}\">{}</a></li>\n", escape_html(&base), shown, shown));
    }
    html.push_str("</ul>\n</body>\n</html>\n");
    Ok(html)
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
