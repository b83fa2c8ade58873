//! Control API
//!
//! A thin JSON surface over the core services, protected by a bearer token.
//! `GET /health` is open; the notification sockets accept the token either as a
//! bearer header or as a `token` query parameter since browsers cannot set
//! headers on WebSocket handshakes.

use crate::body::{full, ProxyBody};
use crate::db::{Database, GatewayConfig};
use crate::error::{Error, Result};
use crate::gateway::{GatewayRequest, GatewayService};
use crate::handler::Handler;
use crate::lifecycle::LifecycleService;
use crate::metrics::MetricsCollector;
use crate::notify::{NotificationHub, Slot};
use crate::notify::ws;
use crate::pipeline::Pipeline;
use async_trait::async_trait;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// The core services the API delegates to
pub struct Services {
    pub db: Database,
    pub hub: Arc<NotificationHub>,
    pub collector: Arc<MetricsCollector>,
    pub pipeline: Pipeline,
    pub lifecycle: LifecycleService,
    pub gateways: GatewayService,
}

#[derive(Debug, Deserialize)]
struct CreateApplication {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct DeployRequest {
    repo_url: String,
    #[serde(default = "default_branch")]
    branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Serialize)]
struct Message<'a> {
    message: &'a str,
}

/// Cap on JSON request bodies
const MAX_JSON_BYTES: usize = 1024 * 1024;

pub struct ControlApi {
    services: Arc<Services>,
    auth_token: String,
    max_upload_bytes: usize,
}

impl ControlApi {
    pub fn new(services: Arc<Services>, auth_token: impl Into<String>) -> Self {
        Self {
            services,
            auth_token: auth_token.into(),
            max_upload_bytes: 100 * 1024 * 1024,
        }
    }

    pub fn with_max_upload_bytes(mut self, limit: usize) -> Self {
        self.max_upload_bytes = limit;
        self
    }

    /// Check the bearer header, falling back to the `token` query parameter
    fn check_auth<B>(&self, req: &Request<B>) -> bool {
        let bearer = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if let Some(token) = bearer {
            return token == self.auth_token;
        }
        query_param(req.uri().query(), "token").is_some_and(|token| token == self.auth_token)
    }

    async fn route(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let s = &self.services;

        match (&method, segments.as_slice()) {
            (&Method::GET, ["ws", "progress"]) => {
                Ok(ws::upgrade(req, Arc::clone(&s.hub), Slot::Progress))
            }
            (&Method::GET, ["ws", "interactive"]) => {
                Ok(ws::upgrade(req, Arc::clone(&s.hub), Slot::Interactive))
            }

            (&Method::GET, ["applications"]) => json(StatusCode::OK, &s.db.list_applications()?),
            (&Method::POST, ["applications"]) => {
                let body: CreateApplication = read_json(req).await?;
                if body.name.trim().is_empty() {
                    return Err(Error::InvalidInput("name is required".into()));
                }
                let app = s.db.insert_application(body.name.trim(), &body.description)?;
                json(StatusCode::CREATED, &app)
            }
            (&Method::GET, ["applications", id]) => json(StatusCode::OK, &s.db.get_application(id)?),
            (&Method::POST, ["applications", id, "deploy"]) => {
                let body: DeployRequest = read_json(req).await?;
                if body.repo_url.is_empty() {
                    return Err(Error::InvalidInput("repo_url is required".into()));
                }
                let version = s.pipeline.deploy(id, &body.repo_url, &body.branch).await?;
                json(StatusCode::OK, &version)
            }
            (&Method::POST, ["applications", id, "upload"]) => {
                let filename = query_param(req.uri().query(), "filename")
                    .ok_or_else(|| Error::InvalidInput("filename query parameter is required".into()))?;
                let archive = read_bytes(req, self.max_upload_bytes).await?;
                s.pipeline.upload(id, &filename, archive).await?;
                json(
                    StatusCode::OK,
                    &Message {
                        message: "File uploaded successfully",
                    },
                )
            }
            (&Method::GET, ["applications", id, "versions"]) => {
                s.db.get_application(id)?;
                json(StatusCode::OK, &s.db.get_versions_for_application(id)?)
            }
            (&Method::GET, ["applications", id, "stats"]) => {
                s.db.get_application(id)?;
                json(StatusCode::OK, &s.db.get_application_stats(id)?)
            }
            (&Method::POST, ["applications", id, "versions", vid, "start"]) => {
                json(StatusCode::OK, &s.lifecycle.start_container(id, vid).await?)
            }
            (&Method::POST, ["applications", id, "versions", vid, "stop"]) => {
                json(StatusCode::OK, &s.lifecycle.stop_container(id, vid).await?)
            }
            (&Method::DELETE, ["applications", id, "versions", vid]) => {
                s.lifecycle.delete_version(id, vid).await?;
                Ok(no_content())
            }

            (&Method::GET, ["gateways"]) => json(StatusCode::OK, &s.db.list_gateways()?),
            (&Method::POST, ["gateways"]) => {
                let body: GatewayRequest = read_json(req).await?;
                json(StatusCode::CREATED, &s.gateways.create(body).await?)
            }
            (&Method::PUT, ["gateways", id]) => {
                let id = id.to_string();
                let body: GatewayRequest = read_json(req).await?;
                json(StatusCode::OK, &s.gateways.update(&id, body).await?)
            }
            (&Method::DELETE, ["gateways", id]) => {
                s.gateways.delete(id).await?;
                Ok(no_content())
            }

            (&Method::GET, ["gateway-config"]) => json(StatusCode::OK, &s.db.get_gateway_config()?),
            (&Method::PUT, ["gateway-config"]) => {
                let body: GatewayConfig = read_json(req).await?;
                json(StatusCode::OK, &s.db.update_gateway_config(&body)?)
            }

            (&Method::GET, ["metrics"]) => {
                let days = match query_param(req.uri().query(), "days") {
                    Some(raw) => raw
                        .parse::<u32>()
                        .map_err(|_| Error::InvalidInput(format!("days must be a positive integer, got '{}'", raw)))?,
                    None => 1,
                };
                json(StatusCode::OK, &s.collector.get_metrics(days)?)
            }

            _ => Err(Error::NotFound(format!("{} {}", method, path))),
        }
    }
}

#[async_trait]
impl Handler for ControlApi {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(method = %method, path = %path, "API request");

        if method == Method::GET && path == "/health" {
            return json(StatusCode::OK, &Message { message: "ok" })
                .unwrap_or_else(|e| e.to_response());
        }

        if !self.check_auth(&req) {
            warn!(method = %method, path = %path, "Unauthorized API request");
            return Error::Unauthorized.to_response();
        }

        match self.route(req).await {
            Ok(response) => response,
            Err(e) => {
                debug!(method = %method, path = %path, error = %e, "API request failed");
                e.to_response()
            }
        }
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key != name {
            return None;
        }
        urlencoding::decode(value).ok().map(|v| v.into_owned())
    })
}

async fn read_bytes(req: Request<ProxyBody>, limit: usize) -> Result<Bytes> {
    Limited::new(req.into_body(), limit)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                Error::PayloadTooLarge(limit)
            } else {
                Error::InvalidInput(format!("failed to read request body: {}", e))
            }
        })
}

async fn read_json<T: DeserializeOwned>(req: Request<ProxyBody>) -> Result<T> {
    let bytes = read_bytes(req, MAX_JSON_BYTES).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidInput(format!("invalid JSON body: {}", e)))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<ProxyBody>> {
    let body = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(body))
        .expect("valid response with StatusCode enum and static headers"))
}

fn no_content() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(crate::body::empty())
        .expect("valid response with static status")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_body_over_limit_is_rejected() {
        let small = Request::new(full(vec![7u8; 512]));
        assert_eq!(read_bytes(small, 1024).await.unwrap().len(), 512);

        let large = Request::new(full(vec![7u8; 4096]));
        let err = read_bytes(large, 1024).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(1024)));
        assert_eq!(err.to_response().status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("filename=my%20app.zip&x=1"), "filename").as_deref(),
            Some("my app.zip")
        );
        assert_eq!(query_param(Some("days=3"), "days").as_deref(), Some("3"));
        assert_eq!(query_param(Some("flag"), "flag").as_deref(), Some(""));
        assert_eq!(query_param(Some("a=1"), "b"), None);
        assert_eq!(query_param(None, "a"), None);
    }
}
