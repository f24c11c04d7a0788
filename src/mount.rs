//! Mounting sub-routers under a base path.
//!
//! An application is an init function registered by name. At bind time it
//! receives an [`ExecutionContext`] — a view of the site's path router
//! narrowed to the route's base path — and uses it to install its own
//! sub-routes. Everything it installs is wrapped so the handler name is
//! set for logging and the request path is rebased while the app's
//! middleware runs.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hyper::Method;
use serde_json::Value;

use crate::config::Registry;
use crate::middleware::{Endpoint, Middleware, Next};
use crate::router::PathRouter;
use crate::{Context, Error, Result};

/// The build-time capability surface handed to an app (or a handler
/// factory) so it can register routes under its base path.
pub struct ExecutionContext<'a> {
    router: &'a mut PathRouter,
    registry: &'a Registry,
    base: String,
    name: String,
    dir: PathBuf,
}

impl std::fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("base", &self.base)
            .field("name", &self.name)
            .finish()
    }
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(
        router: &'a mut PathRouter,
        registry: &'a Registry,
        base: &str,
        name: &str,
        dir: PathBuf,
    ) -> Self {
        Self {
            router,
            registry,
            base: normalize_base(base),
            name: name.to_string(),
            dir,
        }
    }

    /// The base path this context is scoped to.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// The handler name routes registered here are attributed to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Turn a base-relative path into an absolute route path. A leading
    /// `^` (wildcard prefix) is preserved.
    pub fn resolve_req_path(&self, rel: &str) -> String {
        if let Some(rest) = rel.strip_prefix('^') {
            return format!("^{}", self.resolve_req_path(rest));
        }
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            return self.base.clone();
        }
        if self.base == "/" {
            format!("/{}", rel)
        } else {
            format!("{}/{}", self.base, rel)
        }
    }

    /// Turn a base-relative path into a filesystem path inside the app's
    /// directory.
    pub fn resolve_fs_path(&self, rel: &str) -> PathBuf {
        self.dir.join(rel.trim_start_matches('/'))
    }

    /// Register `middleware` for any method at the base-relative `path`.
    pub fn all(&mut self, path: &str, middleware: impl Middleware) -> Result<()> {
        let path = self.resolve_req_path(path);
        let wrapped = self.wrap(Arc::new(middleware));
        self.router.add(&path, None, wrapped)
    }

    /// Register `middleware` for `GET` requests at the base-relative `path`.
    pub fn get(&mut self, path: &str, middleware: impl Middleware) -> Result<()> {
        let path = self.resolve_req_path(path);
        let wrapped = self.wrap(Arc::new(middleware));
        self.router.add(&path, Some(Method::GET), wrapped)
    }

    /// Register `middleware` for `POST` requests at the base-relative `path`.
    pub fn post(&mut self, path: &str, middleware: impl Middleware) -> Result<()> {
        let path = self.resolve_req_path(path);
        let wrapped = self.wrap(Arc::new(middleware));
        self.router.add(&path, Some(Method::POST), wrapped)
    }

    /// Install a rewrite under the base path.
    pub fn add_rewrite(&mut self, path: &str, src: &str, dest: &str) -> Result<()> {
        let path = self.resolve_req_path(path);
        self.router.add_rewrite(&path, src, dest)
    }

    /// Install a redirect under the base path.
    pub fn add_redirect(&mut self, src: &str, dest: &str, code: Option<u16>) -> Result<()> {
        let src = self.resolve_req_path(src);
        self.router.add_redirect(&src, dest, code)
    }

    /// Resolve a handler by name and push it onto the stack at the
    /// base-relative `path`, exactly like a route-table entry would.
    pub fn add_module(&mut self, path: &str, name: &str, args: &Value) -> Result<()> {
        let path = self.resolve_req_path(path);
        crate::config::install_module(self.router, self.registry, &path, name, args)
    }

    /// Run a registered app's init function in a context scoped like this
    /// one but attributed to the app.
    pub(crate) fn run_app(&mut self, app_name: &str, args: &Value) -> Result<()> {
        let registry = self.registry;
        let init = registry.app(app_name).ok_or_else(|| {
            Error::config(anyhow::anyhow!("unknown app: {:?}", app_name))
        })?;
        let mut scoped = ExecutionContext {
            router: &mut *self.router,
            registry,
            base: self.base.clone(),
            name: app_name.to_string(),
            dir: registry.app_dir(app_name),
        };
        init(&mut scoped, args)
    }

    fn wrap(&self, middleware: Arc<dyn Middleware>) -> Arc<dyn Middleware> {
        Arc::new(Mounted::new(&self.name, &self.base, middleware))
    }
}

/// Strip the `^` convention and trailing slashes from a route path,
/// yielding the mount base.
pub(crate) fn normalize_base(path: &str) -> String {
    let path = path.strip_prefix('^').unwrap_or(path);
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Wrapper around an installed middleware that sets the handler name and
/// rebases the request path while the middleware runs. Both are restored
/// when the middleware falls through or returns, so siblings and the
/// outer chain observe the original values.
pub struct Mounted {
    name: String,
    base: String,
    inner: Arc<dyn Middleware>,
}

impl Mounted {
    pub(crate) fn new(name: &str, base: &str, inner: Arc<dyn Middleware>) -> Self {
        Self {
            name: name.to_string(),
            base: normalize_base(base),
            inner,
        }
    }
}

impl std::fmt::Debug for Mounted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mounted")
            .field("name", &self.name)
            .field("base", &self.base)
            .finish()
    }
}

#[async_trait]
impl Middleware for Mounted {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        let saved_handler = ctx.set_handler(Some(self.name.clone()));
        let saved_path = ctx.path().to_string();

        if self.base != "/" {
            if let Some(rest) = saved_path.strip_prefix(&self.base) {
                if rest.is_empty() {
                    ctx.set_path("/");
                } else if rest.starts_with('/') {
                    ctx.set_path(rest.to_string());
                }
            }
        }

        let restore = Restore {
            path: saved_path.clone(),
            handler: saved_handler.clone(),
            next: Mutex::new(Some(next)),
        };
        let out = Next::new(
            Arc::new(vec![self.inner.clone()]),
            Arc::new(restore),
        )
        .run(ctx)
        .await;

        ctx.set_path(saved_path);
        ctx.set_handler(saved_handler);
        out
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Restores the pre-mount path and handler name before delegating to the
/// chain beyond the mount.
struct Restore {
    path: String,
    handler: Option<String>,
    next: Mutex<Option<Next>>,
}

#[async_trait]
impl Endpoint for Restore {
    async fn call(&self, ctx: &mut Context) -> Result<()> {
        ctx.set_path(self.path.clone());
        ctx.set_handler(self.handler.clone());
        let next = self
            .next
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match next {
            Some(next) => next.run(ctx).await,
            None => Err(Error::InvalidChainUsage),
        }
    }
}
