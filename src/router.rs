//! Second-level routing: URL path to middleware stack.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::Method;
use routefinder::Router as PatternMatcher;

use crate::middleware::{ChainTail, Middleware, Next, Stack};
use crate::redirect::{Redirect, Rewrite};
use crate::{Context, Error, Result};

/// One registered route: a compiled pattern, an optional method
/// restriction, and the middleware to run.
struct Entry {
    method: Option<Method>,
    matcher: PatternMatcher<()>,
    middleware: Arc<dyn Middleware>,
}

impl Entry {
    fn matches(&self, path: &str, method: &Method) -> bool {
        if let Some(own) = &self.method {
            // a HEAD request without HEAD routes falls back to the GET ones
            let head_fallback = *own == Method::GET && *method == Method::HEAD;
            if own != method && !head_fallback {
                return false;
            }
        }
        self.matcher.best_match(path).is_some()
    }
}

/// The routing table for one site.
///
/// Routes are kept in declaration order; when several patterns match one
/// request they are composed into a chain in that order, so a handler
/// that falls through continues with the next matching route and finally
/// the outer continuation.
pub struct PathRouter {
    entries: Vec<Entry>,
    stacks: HashMap<String, Arc<Stack>>,
}

impl std::fmt::Debug for PathRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathRouter")
            .field("entries", &self.entries.len())
            .field("stacks", &self.stacks.len())
            .finish()
    }
}

impl Default for PathRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl PathRouter {
    /// Create an empty path router.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            stacks: HashMap::new(),
        }
    }

    /// Register `middleware` for any method at `path`.
    pub fn all(&mut self, path: &str, middleware: impl Middleware) -> Result<()> {
        self.add(path, None, Arc::new(middleware))
    }

    /// Register `middleware` for `GET` requests at `path`.
    pub fn get(&mut self, path: &str, middleware: impl Middleware) -> Result<()> {
        self.add(path, Some(Method::GET), Arc::new(middleware))
    }

    /// Register `middleware` for `POST` requests at `path`.
    pub fn post(&mut self, path: &str, middleware: impl Middleware) -> Result<()> {
        self.add(path, Some(Method::POST), Arc::new(middleware))
    }

    /// Install a rewrite: requests matching `path` have the first
    /// occurrence of `src` in their current path replaced with `dest`
    /// before the rest of the chain runs.
    pub fn add_rewrite(&mut self, path: &str, src: &str, dest: &str) -> Result<()> {
        self.add(path, None, Arc::new(Rewrite::new(src, dest)))
    }

    /// Install a terminal redirect at `src`, answering with `Location:
    /// dest` and `code` (301 when omitted).
    pub fn add_redirect(&mut self, src: &str, dest: &str, code: Option<u16>) -> Result<()> {
        let redirect = Redirect::with_code(dest, code.unwrap_or(301))?;
        self.add(src, None, Arc::new(redirect))
    }

    /// The middleware stack attached to `path`, created and installed on
    /// first use. Repeated calls extend the same stack; it is composed
    /// into one middleware at request time.
    pub fn stack(&mut self, path: &str) -> Result<Arc<Stack>> {
        if let Some(stack) = self.stacks.get(path) {
            return Ok(stack.clone());
        }
        let stack = Arc::new(Stack::new());
        self.add(path, None, stack.clone())?;
        self.stacks.insert(path.to_string(), stack.clone());
        Ok(stack)
    }

    /// Register an already shared middleware.
    pub fn add(
        &mut self,
        path: &str,
        method: Option<Method>,
        middleware: Arc<dyn Middleware>,
    ) -> Result<()> {
        let mut matcher = PatternMatcher::new();
        for spec in expand_pattern(path) {
            matcher.add(spec.as_str(), ()).map_err(|err| {
                Error::config(anyhow::anyhow!("bad path pattern {:?}: {}", path, err))
            })?;
        }
        self.entries.push(Entry {
            method,
            matcher,
            middleware,
        });
        Ok(())
    }

    /// Dispatch a request through every matching route in declared order,
    /// ending in the outer continuation.
    pub async fn process(&self, ctx: &mut Context, next: Next) -> Result<()> {
        let chain: Vec<Arc<dyn Middleware>> = self
            .entries
            .iter()
            .filter(|entry| entry.matches(ctx.path(), ctx.method()))
            .map(|entry| entry.middleware.clone())
            .collect();
        if chain.is_empty() {
            return next.run(ctx).await;
        }
        Next::new(Arc::new(chain), Arc::new(ChainTail::new(next)))
            .run(ctx)
            .await
    }
}

#[async_trait]
impl Middleware for PathRouter {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        self.process(ctx, next).await
    }

    fn name(&self) -> &str {
        "paths"
    }
}

/// Expand the `^`-prefix convention: `^/prefix` matches the prefix itself
/// and everything below it.
fn expand_pattern(path: &str) -> Vec<String> {
    match path.strip_prefix('^') {
        Some(rest) => {
            let base = if rest.is_empty() { "/" } else { rest };
            let trimmed = base.trim_end_matches('/');
            if trimmed.is_empty() {
                vec!["/".to_string(), "/*".to_string()]
            } else {
                vec![trimmed.to_string(), format!("{}/*", trimmed)]
            }
        }
        None => vec![path.to_string()],
    }
}
