//! Neploy - a single-node control plane for containerised applications
//!
//! This library provides:
//! - Stack detection and Dockerfile synthesis for uploaded or cloned sources
//! - A deployment pipeline that builds, runs and publishes each version
//! - A reverse-proxy gateway routing by subdomain or path prefix
//! - A short-lived response cache and a request logger feeding hourly metrics
//! - Periodic health checks of published gateways
//! - WebSocket notifications for deployment progress and interactive prompts

pub mod access_log;
pub mod api;
pub mod body;
pub mod cache;
pub mod config;
pub mod db;
pub mod detector;
pub mod dockerfile;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod git;
pub mod handler;
pub mod healthcheck;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod pool;
pub mod router;
pub mod server;
pub mod worker;

pub use error::{Error, ErrorKind, Result};
