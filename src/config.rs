//! Binding the declarative route table to a routing tree.
//!
//! The document walked here is the `router` section of the operator's
//! configuration, already parsed into a `serde_json::Value` (YAML parsing
//! happens outside this crate). Key order is significant: sites and
//! routes are installed exactly as declared.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::host::HostRouter;
use crate::middleware::{Middleware, Next};
use crate::mount::{normalize_base, ExecutionContext, Mounted};
use crate::proxy::{Proxy, ProxyConfig};
use crate::router::PathRouter;
use crate::static_files::{StaticConfig, StaticFiles};
use crate::{Context, Error, Result};

/// A handler factory: given the execution context for its mount point and
/// its configuration value, produce a middleware (or nothing, for
/// registration-only handlers such as `app`).
pub type HandlerFactory =
    Box<dyn Fn(&mut ExecutionContext<'_>, &Value) -> Result<Option<Arc<dyn Middleware>>> + Send + Sync>;

/// An app init function: registers its own routes through the execution
/// context.
pub type AppInit = Box<dyn Fn(&mut ExecutionContext<'_>, &Value) -> Result<()> + Send + Sync>;

/// The name registry routes resolve against.
///
/// Built-in handlers (`static`, `proxy`, `echo`, `app`) are always
/// present; additional handlers and apps register by name before binding.
/// Unknown names in the route table are startup errors.
pub struct Registry {
    handlers: HashMap<String, HandlerFactory>,
    apps: HashMap<String, AppInit>,
    project_root: PathBuf,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("apps", &self.apps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry with the built-in handlers installed.
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
            apps: HashMap::new(),
            project_root: PathBuf::from("."),
        };
        registry.register_handler("static", |_ec: &mut ExecutionContext<'_>, args: &Value| {
            let middleware = StaticFiles::new(StaticConfig::from_value(args)?)?;
            Ok(Some(Arc::new(middleware) as Arc<dyn Middleware>))
        });
        registry.register_handler("proxy", |_ec: &mut ExecutionContext<'_>, args: &Value| {
            let middleware = Proxy::new(ProxyConfig::from_value(args)?)?;
            Ok(Some(Arc::new(middleware) as Arc<dyn Middleware>))
        });
        registry.register_handler("echo", |_ec: &mut ExecutionContext<'_>, _args: &Value| {
            Ok(Some(Arc::new(Echo) as Arc<dyn Middleware>))
        });
        registry.register_handler("app", |ec: &mut ExecutionContext<'_>, args: &Value| {
            let name = match args {
                Value::String(name) => name.clone(),
                Value::Object(map) => map
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::config(anyhow::anyhow!("app: config is missing a name"))
                    })?,
                other => {
                    return Err(Error::config(anyhow::anyhow!(
                        "app: expected a name or an options object, got {}",
                        other
                    )))
                }
            };
            ec.run_app(&name, args)?;
            Ok(None)
        });
        registry
    }

    /// Register (or replace) a handler factory.
    pub fn register_handler(
        &mut self,
        name: &str,
        factory: impl Fn(&mut ExecutionContext<'_>, &Value) -> Result<Option<Arc<dyn Middleware>>>
            + Send
            + Sync
            + 'static,
    ) {
        self.handlers.insert(name.to_string(), Box::new(factory));
    }

    /// Register (or replace) an app init function.
    pub fn register_app(
        &mut self,
        name: &str,
        init: impl Fn(&mut ExecutionContext<'_>, &Value) -> Result<()> + Send + Sync + 'static,
    ) {
        self.apps.insert(name.to_string(), Box::new(init));
    }

    /// Set the directory app directories resolve against.
    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        self
    }

    pub(crate) fn handler(&self, name: &str) -> Option<&HandlerFactory> {
        self.handlers.get(name)
    }

    pub(crate) fn app(&self, name: &str) -> Option<&AppInit> {
        self.apps.get(name)
    }

    pub(crate) fn app_dir(&self, name: &str) -> PathBuf {
        self.project_root.join("apps").join(name)
    }

    pub(crate) fn project_root(&self) -> &PathBuf {
        &self.project_root
    }
}

/// Resolve `name`, instantiate it for `path` and push it onto the path's
/// stack. Shared by the route-table walk and [`ExecutionContext::add_module`].
pub(crate) fn install_module(
    router: &mut PathRouter,
    registry: &Registry,
    path: &str,
    name: &str,
    args: &Value,
) -> Result<()> {
    let factory = registry
        .handler(name)
        .ok_or_else(|| Error::config(anyhow::anyhow!("unknown handler: {:?}", name)))?;

    let base = normalize_base(path);
    let dir = registry.project_root().clone();
    let mut ec = ExecutionContext::new(&mut *router, registry, &base, name, dir);
    let middleware = factory(&mut ec, args)?;
    if let Some(middleware) = middleware {
        let stack = router.stack(path)?;
        stack.push(Arc::new(Mounted::new(name, &base, middleware)));
    }
    Ok(())
}

/// Walk the route table and build the host router.
///
/// The document is either the full config (with a `router` key) or the
/// router section itself:
///
/// ```yaml
/// router:
///   verbose: true
///   routes:
///     example.com:
///       "^/static": { static: /var/www }
///       /api: { proxy: "http://127.0.0.1:8080" }
///     "*":
///       "^/": echo
/// ```
pub fn bind(registry: &Registry, config: &Value) -> Result<HostRouter> {
    let section = config.get("router").unwrap_or(config);
    let verbose = section
        .get("verbose")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let routes = section
        .get("routes")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::config(anyhow::anyhow!("config has no routes table")))?;

    let mut hosts = HostRouter::new();
    let mut installed = 0usize;
    for (host_key, site_value) in routes {
        let site = hosts.site_mut(host_key)?;
        let paths = site_value.as_object().ok_or_else(|| {
            Error::config(anyhow::anyhow!(
                "routes for {:?} must be a path table",
                host_key
            ))
        })?;
        for (path_key, entry) in paths {
            installed += bind_path(registry, site, host_key, path_key, entry, verbose)?;
        }
    }

    if verbose {
        tracing::info!(
            target: "outpost::config",
            sites = hosts.len(),
            routes = installed,
            "routing table bound"
        );
    }
    Ok(hosts)
}

fn bind_path(
    registry: &Registry,
    router: &mut PathRouter,
    host: &str,
    path: &str,
    entry: &Value,
    verbose: bool,
) -> Result<usize> {
    let mut installed = 0usize;
    match entry {
        // a bare string is a single handler name with no options
        Value::String(name) => {
            install_module(router, registry, path, name, &Value::Null)?;
            installed += 1;
            log_route(verbose, host, path, name);
        }
        Value::Object(map) => {
            if let Some(rewrites) = map.get("rewrite") {
                for pair in rewrites.as_array().into_iter().flatten() {
                    let (src, dest) = rewrite_pair(pair).ok_or_else(|| {
                        Error::config(anyhow::anyhow!(
                            "rewrite entries for {:?} must be [src, dest] pairs",
                            path
                        ))
                    })?;
                    router.add_rewrite(path, src, dest)?;
                    installed += 1;
                    log_route(verbose, host, path, "rewrite");
                }
            }

            if let Some(redirect) = map.get("redirect") {
                let location = redirect.as_str().ok_or_else(|| {
                    Error::config(anyhow::anyhow!("redirect for {:?} must be a URL", path))
                })?;
                let code = match map.get("code") {
                    Some(code) => Some(
                        code.as_u64()
                            .and_then(|code| u16::try_from(code).ok())
                            .ok_or_else(|| {
                                Error::config(anyhow::anyhow!(
                                    "bad redirect code for {:?}",
                                    path
                                ))
                            })?,
                    ),
                    None => None,
                };
                router.add_redirect(path, location, code)?;
                installed += 1;
                log_route(verbose, host, path, "redirect");
                return Ok(installed);
            }

            for (key, value) in map {
                if key == "rewrite" || key == "code" {
                    continue;
                }
                install_module(router, registry, path, key, value)?;
                installed += 1;
                log_route(verbose, host, path, key);
            }
        }
        other => {
            return Err(Error::config(anyhow::anyhow!(
                "route {:?} must be a handler name or a table, got {}",
                path,
                other
            )))
        }
    }
    Ok(installed)
}

fn rewrite_pair(pair: &Value) -> Option<(&str, &str)> {
    let pair = pair.as_array()?;
    match pair.as_slice() {
        [src, dest] => Some((src.as_str()?, dest.as_str()?)),
        _ => None,
    }
}

fn log_route(verbose: bool, host: &str, path: &str, handler: &str) {
    if verbose {
        tracing::info!(
            target: "outpost::config",
            host,
            path,
            handler,
            "route installed"
        );
    }
}

/// A diagnostic handler answering with the request line as text.
#[derive(Debug, Clone, Copy)]
pub struct Echo;

#[async_trait]
impl Middleware for Echo {
    async fn handle(&self, ctx: &mut Context, _next: Next) -> Result<()> {
        let body = if ctx.querystring().is_empty() {
            format!("{} {} from {}\n", ctx.method(), ctx.path(), ctx.ip())
        } else {
            format!(
                "{} {}?{} from {}\n",
                ctx.method(),
                ctx.path(),
                ctx.querystring(),
                ctx.ip()
            )
        };
        ctx.res.set_content_type("text/plain; charset=utf-8");
        ctx.res.set_body(body);
        ctx.log("Echo", ctx.path());
        Ok(())
    }

    fn name(&self) -> &str {
        "echo"
    }
}
