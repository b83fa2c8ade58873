//! In-memory response cache for GET traffic

use crate::body::{full, CaptureBody, ProxyBody};
use crate::config::CacheSettings;
use crate::handler::Handler;
use crate::router::request_host;
use async_trait::async_trait;
use dashmap::DashMap;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct CachedResponse {
    headers: HeaderMap,
    body: Bytes,
    expires_at: Instant,
}

/// Cache entries keyed by `"{METHOD}:{host}{path?query}"`
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
    ttl: Duration,
    sweep_interval: Duration,
    max_entry_bytes: usize,
}

impl ResponseCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(settings.ttl_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
            max_entry_bytes: settings.max_entry_bytes,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key_for<B>(req: &Request<B>) -> String {
        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}:{}{}", req.method(), request_host(req), target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, key: &str) -> Option<CachedResponse> {
        let hit = self.entries.get(key).map(|entry| entry.clone())?;
        if hit.expires_at <= Instant::now() {
            self.entries.remove(key);
            return None;
        }
        Some(hit)
    }

    /// Store a body unless it exceeds the per-entry ceiling; true if stored
    pub fn store(&self, key: String, mut headers: HeaderMap, body: Bytes) -> bool {
        if body.len() > self.max_entry_bytes {
            debug!(key = %key, size = body.len(), "Response too large to cache");
            return false;
        }
        for name in [CONNECTION, TRANSFER_ENCODING, CONTENT_LENGTH] {
            headers.remove(name);
        }
        self.entries.insert(
            key,
            CachedResponse {
                headers,
                body,
                expires_at: Instant::now() + self.ttl,
            },
        );
        true
    }

    /// Drop expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Periodic sweep loop, run as a worker
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.sweep_interval.as_secs(),
            "Cache sweeper started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.sweep_interval) => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, remaining = self.len(), "Swept expired cache entries");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Cache sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Gateway layer answering repeated GETs from the cache
pub struct CacheLayer<H> {
    cache: Arc<ResponseCache>,
    next: H,
}

impl<H> CacheLayer<H> {
    pub fn new(cache: Arc<ResponseCache>, next: H) -> Self {
        Self { cache, next }
    }
}

#[async_trait]
impl<H: Handler> Handler for CacheLayer<H> {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        if req.method() != Method::GET {
            return self.next.handle(req).await;
        }

        let key = ResponseCache::key_for(&req);
        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %key, "Cache hit");
            let mut response = Response::new(full(hit.body));
            *response.headers_mut() = hit.headers;
            response
                .headers_mut()
                .insert("X-Cache", HeaderValue::from_static("HIT"));
            return response;
        }

        let response = self.next.handle(req).await;
        if response.status() != StatusCode::OK {
            return response;
        }

        let (parts, body) = response.into_parts();
        let cache = Arc::clone(&self.cache);
        let headers = parts.headers.clone();
        let limit = self.cache.max_entry_bytes;
        let body = CaptureBody::new(body, limit, move |captured| {
            if captured.complete && !captured.truncated {
                cache.store(key, headers, captured.bytes);
            }
        });
        Response::from_parts(parts, body.boxed())
    }
}
