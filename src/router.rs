//! Reverse-proxy router
//!
//! The routing table maps a route key (`subdomain.domain` or `domain+path`) to
//! an entry holding the route and the proxy that forwards to its upstream
//! container. Entries are reference counted so a request that picked an entry
//! finishes against it even if the route is removed meanwhile.

use crate::body::ProxyBody;
use crate::error::{json_error_response, Error, ErrorKind, Result};
use crate::handler::{ClientAddr, Handler};
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// In-memory publication of an application's upstream port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub app_id: String,
    pub port: u16,
    pub domain: String,
    pub subdomain: Option<String>,
    pub path: Option<String>,
}

impl Route {
    /// Table key: `subdomain.domain` when a subdomain is set, otherwise `domain+path`
    pub fn key(&self) -> String {
        match self.subdomain.as_deref() {
            Some(sub) => format!("{}.{}", sub, self.domain),
            None => format!("{}{}", self.domain, self.path.as_deref().unwrap_or("")),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_id.trim().is_empty() {
            return Err(Error::InvalidInput("route app_id must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidInput("route port must not be zero".into()));
        }
        if self.domain.trim().is_empty() {
            return Err(Error::InvalidInput("route domain must not be empty".into()));
        }
        if self.subdomain.is_none() && self.path.is_none() {
            return Err(Error::InvalidInput(
                "route needs a subdomain or a path".into(),
            ));
        }
        Ok(())
    }

    /// Subdomain compares against the first label of `host`; path is a prefix of `path`
    pub fn matches(&self, host: &str, path: &str) -> bool {
        if let Some(sub) = self.subdomain.as_deref() {
            if host.split('.').next() != Some(sub) {
                return false;
            }
        }
        if let Some(prefix) = self.path.as_deref() {
            if !path.starts_with(prefix) {
                return false;
            }
        }
        true
    }

    /// Subdomain routes first, then longer path prefixes
    fn specificity(&self) -> (bool, usize) {
        (
            self.subdomain.is_some(),
            self.path.as_deref().map(str::len).unwrap_or(0),
        )
    }
}

/// Forwarding state owned by one route entry
#[derive(Debug)]
pub struct RouteProxy {
    port: u16,
    strip_prefix: Option<String>,
    host: HeaderValue,
}

impl RouteProxy {
    fn for_route(route: &Route) -> Result<Self> {
        let host = HeaderValue::from_str(&format!("localhost:{}", route.port))
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        Ok(Self {
            port: route.port,
            strip_prefix: route.path.clone(),
            host,
        })
    }

    /// Path forwarded upstream, always starting with `/`
    pub fn upstream_path(&self, path: &str) -> String {
        let rest = match self.strip_prefix.as_deref() {
            Some(prefix) => path.strip_prefix(prefix).unwrap_or(path),
            None => path,
        };
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        }
    }

    async fn forward(
        &self,
        mut req: Request<ProxyBody>,
        pool: &ConnectionPool,
        timeout: Duration,
    ) -> Response<ProxyBody> {
        let mut path_and_query = self.upstream_path(req.uri().path());
        if let Some(query) = req.uri().query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let client_ip = req
            .extensions()
            .get::<ClientAddr>()
            .map(|addr| addr.0.ip().to_string());
        let original_host = req.headers().get(HOST).cloned();

        let headers = req.headers_mut();
        headers.insert(HOST, self.host.clone());
        if let Some(ip) = client_ip {
            if let Ok(value) = HeaderValue::from_str(&ip) {
                headers.insert("X-Forwarded-For", value);
            }
        }
        if let Some(value) = original_host {
            headers.insert("X-Forwarded-Host", value);
        }
        headers.insert("X-Forwarded-Proto", HeaderValue::from_static("http"));

        debug!(port = self.port, path = %path_and_query, "Forwarding request");

        match tokio::time::timeout(timeout, pool.send_request(req, self.port, &path_and_query))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(port = self.port, error = %e, "Upstream request failed");
                Error::BadGateway(e.to_string()).to_response()
            }
            Err(_) => {
                warn!(port = self.port, "Upstream request timed out");
                Error::BadGateway(format!(
                    "upstream did not answer within {}s",
                    timeout.as_secs()
                ))
                .to_response()
            }
        }
    }
}

struct RouteEntry {
    route: Route,
    proxy: RouteProxy,
}

/// Routing table and request dispatcher
pub struct Router {
    routes: RwLock<BTreeMap<String, Arc<RouteEntry>>>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl Router {
    pub fn new(pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self {
            routes: RwLock::new(BTreeMap::new()),
            pool,
            request_timeout,
        }
    }

    /// Install `route`, replacing any entry under the same key
    pub fn add_route(&self, route: Route) -> Result<()> {
        route.validate()?;
        let proxy = RouteProxy::for_route(&route)?;
        let key = route.key();

        info!(key = %key, app_id = %route.app_id, port = route.port, "Adding route");
        self.routes
            .write()
            .insert(key, Arc::new(RouteEntry { route, proxy }));
        Ok(())
    }

    /// Remove the entry under `route`'s key; true if one existed
    pub fn remove_route(&self, route: &Route) -> bool {
        let key = route.key();
        let removed = self.routes.write().remove(&key).is_some();
        if removed {
            info!(key = %key, "Removed route");
        }
        removed
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes
            .read()
            .values()
            .map(|entry| entry.route.clone())
            .collect()
    }

    fn find(&self, host: &str, path: &str) -> Option<Arc<RouteEntry>> {
        self.routes
            .read()
            .values()
            .filter(|entry| entry.route.matches(host, path))
            .max_by_key(|entry| entry.route.specificity())
            .cloned()
    }

    /// Route that would serve a request for `host` and `path`
    pub fn resolve(&self, host: &str, path: &str) -> Option<Route> {
        self.find(host, path).map(|entry| entry.route.clone())
    }
}

/// Host of a request from the Host header, falling back to the URI authority
pub fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default()
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let host = request_host(&req);
        let Some(entry) = self.find(&host, req.uri().path()) else {
            debug!(host = %host, path = %req.uri().path(), "No route matched");
            return json_error_response(
                ErrorKind::NotFound,
                format!("no route for {}{}", host, req.uri().path()),
            );
        };
        entry
            .proxy
            .forward(req, &self.pool, self.request_timeout)
            .await
    }
}
