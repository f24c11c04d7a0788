//! First-level routing: hostname to site.

use std::sync::Arc;

use async_trait::async_trait;

use crate::middleware::{Middleware, Next};
use crate::router::PathRouter;
use crate::{Context, Error, Result};

/// A host pattern from the route table.
///
/// Patterns are matched against [`Context::hostname`] in declaration
/// order; the first hit wins, so a trailing `Any` acts as the default
/// site.
#[derive(Debug, Clone)]
pub enum HostPattern {
    /// An exact hostname.
    Exact(String),
    /// Any of a list of exact hostnames.
    List(Vec<String>),
    /// A compiled regular expression.
    Regex(regex::Regex),
    /// `*` — matches every hostname.
    Any,
}

impl HostPattern {
    /// Parse a host key from the route table.
    ///
    /// `*` is the wildcard; strings wrapped in `/` are regex literals with
    /// optional trailing flags (`i` supported); a comma-separated key is a
    /// list of exact names; anything else matches exactly.
    pub fn parse(key: &str) -> Result<Self> {
        if key == "*" {
            return Ok(HostPattern::Any);
        }
        if let Some(rest) = key.strip_prefix('/') {
            let end = rest
                .rfind('/')
                .ok_or_else(|| Error::config(anyhow::anyhow!("unterminated host regex: {}", key)))?;
            let (pattern, flags) = rest.split_at(end);
            let flags = &flags[1..];
            let pattern = match flags {
                "" => pattern.to_string(),
                "i" => format!("(?i){}", pattern),
                other => {
                    return Err(Error::config(anyhow::anyhow!(
                        "unsupported host regex flags {:?} in {}",
                        other,
                        key
                    )))
                }
            };
            let re = regex::Regex::new(&pattern)
                .map_err(|err| Error::config(anyhow::anyhow!("bad host regex {}: {}", key, err)))?;
            return Ok(HostPattern::Regex(re));
        }
        if key.contains(',') {
            let names = key
                .split(',')
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>();
            return Ok(HostPattern::List(names));
        }
        Ok(HostPattern::Exact(key.to_ascii_lowercase()))
    }

    /// Test the pattern against a hostname.
    pub fn matches(&self, hostname: &str) -> bool {
        match self {
            HostPattern::Exact(name) => name == hostname,
            HostPattern::List(names) => names.iter().any(|name| name == hostname),
            HostPattern::Regex(re) => re.is_match(hostname),
            HostPattern::Any => true,
        }
    }
}

struct Site {
    label: String,
    pattern: HostPattern,
    router: PathRouter,
}

/// The routing table: an ordered list of `(host pattern, path router)`
/// sites, consulted first-hit on every request.
///
/// The router is itself a [`Middleware`]; requests no site matches fall
/// through to the outer continuation.
#[derive(Default)]
pub struct HostRouter {
    sites: Vec<Site>,
}

impl std::fmt::Debug for HostRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRouter")
            .field("sites", &self.sites.iter().map(|s| &s.label).collect::<Vec<_>>())
            .finish()
    }
}

impl HostRouter {
    /// Create an empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or fetch the path router for a host key, preserving
    /// declaration order for new sites.
    pub fn site_mut(&mut self, key: &str) -> Result<&mut PathRouter> {
        if let Some(idx) = self.sites.iter().position(|site| site.label == key) {
            return Ok(&mut self.sites[idx].router);
        }
        let pattern = HostPattern::parse(key)?;
        self.sites.push(Site {
            label: key.to_string(),
            pattern,
            router: PathRouter::new(),
        });
        Ok(&mut self.sites.last_mut().expect("just pushed").router)
    }

    /// Number of declared sites.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

#[async_trait]
impl Middleware for HostRouter {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        for site in &self.sites {
            if site.pattern.matches(ctx.hostname()) {
                ctx.set_site(site.label.clone());
                return site.router.process(ctx, next).await;
            }
        }
        // the request escapes the routing layer
        next.run(ctx).await
    }

    fn name(&self) -> &str {
        "router"
    }
}

/// Convenience wrapper so a built table can be shared.
impl From<HostRouter> for Arc<dyn Middleware> {
    fn from(router: HostRouter) -> Self {
        Arc::new(router)
    }
}
