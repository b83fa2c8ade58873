//! Pooled client for forwarding to application containers
//!
//! All routes share one keep-alive pool. Containers publish their port on the
//! loopback interface, so an upstream is identified by its port alone.

use crate::body::ProxyBody;
use crate::config::ServerConfig;
use dashmap::DashMap;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, CONNECTION, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("upstream on port {port} failed: {source}")]
    Upstream {
        port: u16,
        #[source]
        source: hyper_util::client::legacy::Error,
    },
    #[error("invalid upstream target '{0}'")]
    InvalidTarget(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(server.pool_idle_timeout_secs),
        }
    }
}

/// Forwarding counters for one container port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamStats {
    pub forwarded: u64,
    pub failed: u64,
}

/// Headers that describe the client connection rather than the request
const HOP_BY_HOP: [&str; 3] = ["keep-alive", "proxy-connection", "proxy-authenticate"];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, PROXY_AUTHORIZATION] {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
    upstreams: DashMap<u16, UpstreamStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream pool initialized"
        );

        Self {
            client,
            upstreams: DashMap::new(),
        }
    }

    /// Counters for the container listening on `port`
    pub fn upstream_stats(&self, port: u16) -> UpstreamStats {
        self.upstreams.get(&port).map(|s| *s).unwrap_or_default()
    }

    /// Send `req` to `127.0.0.1:{port}{path_and_query}`
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
        port: u16,
        path_and_query: &str,
    ) -> Result<Response<ProxyBody>, PoolError> {
        let target = format!("http://127.0.0.1:{}{}", port, path_and_query);
        let uri: Uri = target
            .parse()
            .map_err(|_| PoolError::InvalidTarget(target.clone()))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        strip_hop_by_hop(&mut parts.headers);

        let result = self.client.request(Request::from_parts(parts, body)).await;

        let mut stats = self.upstreams.entry(port).or_default();
        stats.forwarded += 1;
        match result {
            Ok(response) => Ok(response.map(|body| body.boxed())),
            Err(source) => {
                stats.failed += 1;
                Err(PoolError::Upstream { port, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_config_from_server_settings() {
        let server = ServerConfig {
            pool_max_idle_per_host: 4,
            pool_idle_timeout_secs: 15,
            ..ServerConfig::default()
        };
        let config = PoolConfig::from(&server);
        assert_eq!(config.max_idle_per_host, 4);
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_hop_by_hop_headers_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(UPGRADE, HeaderValue::from_static("h2c"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-request-id"], "abc");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_counted() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = ConnectionPool::new(PoolConfig::default());
        let req = Request::builder()
            .uri("/")
            .body(crate::body::empty())
            .unwrap();
        let result = pool.send_request(req, port, "/health?full=1").await;

        assert!(matches!(result, Err(PoolError::Upstream { port: p, .. }) if p == port));
        assert_eq!(
            pool.upstream_stats(port),
            UpstreamStats {
                forwarded: 1,
                failed: 1
            }
        );
        assert_eq!(pool.upstream_stats(1), UpstreamStats::default());
    }
}
