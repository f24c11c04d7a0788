//! In-place path rewriting and terminal redirects.

use async_trait::async_trait;
use hyper::header::{HeaderValue, LOCATION};
use hyper::StatusCode;

use crate::middleware::{Middleware, Next};
use crate::{Context, Error, Result};

/// A rewriting middleware.
///
/// Replaces the first occurrence of `src` in the current request path
/// with `dest` and delegates. Downstream middlewares observe the new
/// path; when the chain unwinds the previous path is restored, so the
/// substitution is visible only downstream and the original request URL
/// never changes.
#[derive(Debug, Clone)]
pub struct Rewrite {
    src: String,
    dest: String,
}

impl Rewrite {
    /// Create a rewrite substituting `src` with `dest`.
    pub fn new(src: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
        }
    }
}

#[async_trait]
impl Middleware for Rewrite {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        let saved = ctx.path().to_string();
        let rewritten = normalize(&saved.replacen(&self.src, &self.dest, 1));
        ctx.log("Rewrite", format_args!("{} -> {}", saved, rewritten));
        ctx.set_path(rewritten);
        let out = next.run(ctx).await;
        ctx.set_path(saved);
        out
    }

    fn name(&self) -> &str {
        "rewrite"
    }
}

/// A redirection middleware.
///
/// Terminal: sets `Location` and the configured status, and never calls
/// `next`.
#[derive(Debug, Clone)]
pub struct Redirect {
    status: StatusCode,
    location: String,
}

impl Redirect {
    /// Creates a redirect to `location` with status 301 Moved Permanently.
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            status: StatusCode::MOVED_PERMANENTLY,
            location: location.into(),
        }
    }

    /// Creates a redirect to `location` with status 307 Temporary Redirect.
    pub fn temporary(location: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TEMPORARY_REDIRECT,
            location: location.into(),
        }
    }

    /// Creates a redirect to `location` with an explicit status code.
    pub fn with_code(location: impl Into<String>, code: u16) -> Result<Self> {
        let status = StatusCode::from_u16(code)
            .map_err(|err| Error::config(anyhow::anyhow!("bad redirect code {}: {}", code, err)))?;
        if !status.is_redirection() {
            return Err(Error::config(anyhow::anyhow!(
                "redirect code {} is not a 3xx status",
                code
            )));
        }
        Ok(Self {
            status,
            location: location.into(),
        })
    }
}

#[async_trait]
impl Middleware for Redirect {
    async fn handle(&self, ctx: &mut Context, _next: Next) -> Result<()> {
        ctx.res.set_status(self.status);
        let value = HeaderValue::from_str(&self.location)
            .map_err(hyper::http::Error::from)?;
        ctx.res.insert_header(LOCATION, value);
        ctx.log("Redirect", &self.location);
        Ok(())
    }

    fn name(&self) -> &str {
        "redirect"
    }
}

/// Collapse duplicate slashes and guarantee a leading one.
fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    let mut last_slash = false;
    for c in path.chars() {
        if c == '/' {
            if last_slash {
                continue;
            }
            last_slash = true;
        } else {
            last_slash = false;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn smoke() {
        let redirect = Redirect::new("https://example.com");
        assert_eq!(redirect.status, StatusCode::MOVED_PERMANENTLY);

        let redirect = Redirect::temporary("https://example.com");
        assert_eq!(redirect.status, StatusCode::TEMPORARY_REDIRECT);

        let redirect = Redirect::with_code("https://example.com", 302).unwrap();
        assert_eq!(redirect.status, StatusCode::FOUND);

        assert!(Redirect::with_code("https://example.com", 200).is_err());
        assert!(Redirect::with_code("https://example.com", 999).is_err());
    }

    #[test]
    fn normalize_collapses_slashes() {
        assert_eq!(normalize("//a///b/"), "/a/b/");
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/"), "/");
    }
}
