//! Request logger and metrics tap
//!
//! Outermost gateway layer. Each request ticks the metrics collector once the
//! response head is known and emits one access record on the `neploy::access`
//! target once the response body has been sent.

use crate::body::{CaptureBody, Captured, ProxyBody};
use crate::handler::{ClientAddr, Handler};
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use chrono::Utc;
use hyper::header::USER_AGENT;
use hyper::{HeaderMap, Request, Response};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Bytes of each body kept for the access record
pub const BODY_SNAPSHOT_LIMIT: usize = 10 * 1024;

/// Everything the access record reports about one exchange
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub method: String,
    pub path: String,
    pub query: String,
    pub status: u16,
    pub size: u64,
    pub duration_ms: u128,
    pub remote_addr: String,
    pub user_agent: String,
    pub headers: String,
    pub req_body: Option<String>,
    pub resp_body: Option<String>,
}

fn snapshot(captured: Option<&Captured>) -> Option<String> {
    captured
        .filter(|c| !c.bytes.is_empty())
        .map(|c| String::from_utf8_lossy(&c.bytes).into_owned())
}

fn format_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value.to_str().unwrap_or("<binary>")))
        .collect::<Vec<_>>()
        .join("; ")
}

impl AccessRecord {
    pub fn emit(&self) {
        macro_rules! access {
            ($level:ident) => {
                $level!(
                    target: "neploy::access",
                    method = %self.method,
                    path = %self.path,
                    query = %self.query,
                    status = self.status,
                    size = self.size,
                    duration_ms = self.duration_ms as u64,
                    remote_addr = %self.remote_addr,
                    user_agent = %self.user_agent,
                    headers = %self.headers,
                    req_body = self.req_body.as_deref(),
                    resp_body = self.resp_body.as_deref(),
                    "{} {} {}",
                    self.method,
                    self.path,
                    self.status
                )
            };
        }

        match self.status {
            0..=399 => access!(info),
            400..=499 => access!(warn),
            _ => access!(error),
        }
    }
}

pub struct RequestLogger<H> {
    next: H,
    collector: Arc<MetricsCollector>,
}

impl<H> RequestLogger<H> {
    pub fn new(collector: Arc<MetricsCollector>, next: H) -> Self {
        Self { next, collector }
    }
}

#[async_trait]
impl<H: Handler> Handler for RequestLogger<H> {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let started = Instant::now();

        let remote_addr = req
            .extensions()
            .get::<ClientAddr>()
            .map(|addr| addr.0.to_string())
            .unwrap_or_default();
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let headers = format_headers(req.headers());

        let req_snapshot: Arc<Mutex<Option<Captured>>> = Arc::new(Mutex::new(None));
        let req = {
            let sink = Arc::clone(&req_snapshot);
            let (parts, body) = req.into_parts();
            let body = CaptureBody::new(body, BODY_SNAPSHOT_LIMIT, move |captured| {
                *sink.lock() = Some(captured);
            });
            Request::from_parts(parts, body.boxed())
        };

        let response = self.next.handle(req).await;
        let status = response.status().as_u16();
        self.collector.record(Utc::now(), status >= 400);

        let (parts, body) = response.into_parts();
        let body = CaptureBody::new(body, BODY_SNAPSHOT_LIMIT, move |captured| {
            let record = AccessRecord {
                method,
                path,
                query,
                status,
                size: captured.total,
                duration_ms: started.elapsed().as_millis(),
                remote_addr,
                user_agent,
                headers,
                req_body: snapshot(req_snapshot.lock().as_ref()),
                resp_body: snapshot(Some(&captured)),
            };
            record.emit();
        });
        Response::from_parts(parts, body.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::full;
    use http_body_util::BodyExt;
    use hyper::StatusCode;

    struct Fixed(StatusCode);

    #[async_trait]
    impl Handler for Fixed {
        async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Response::builder()
                .status(self.0)
                .body(full(body))
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_counts_requests_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Arc::new(MetricsCollector::open(dir.path().join("m.log")).unwrap());

        let ok = RequestLogger::new(Arc::clone(&collector), Fixed(StatusCode::OK));
        let failing = RequestLogger::new(Arc::clone(&collector), Fixed(StatusCode::BAD_GATEWAY));

        for logger in [&ok, &ok, &failing] {
            let req = Request::builder()
                .uri("/echo?x=1")
                .body(full("ping"))
                .unwrap();
            let body = logger
                .handle(req)
                .await
                .into_body()
                .collect()
                .await
                .unwrap()
                .to_bytes();
            assert_eq!(body, "ping");
        }

        let entries = collector.get_metrics(1).unwrap();
        assert_eq!(entries.iter().map(|e| e.requests).sum::<u64>(), 3);
        assert_eq!(entries.iter().map(|e| e.errors).sum::<u64>(), 1);
    }

    #[test]
    fn test_snapshot_skips_empty_bodies() {
        let empty = Captured {
            bytes: Default::default(),
            total: 0,
            truncated: false,
            complete: true,
        };
        assert!(snapshot(Some(&empty)).is_none());
        assert!(snapshot(None).is_none());
    }

    #[test]
    fn test_format_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-one", "1".parse().unwrap());
        headers.insert("x-two", "2".parse().unwrap());
        assert_eq!(format_headers(&headers), "x-one: 1; x-two: 2");
    }
}
