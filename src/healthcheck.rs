//! Gateway health checker
//!
//! Periodically probes `GET {gateway}/health` for every live gateway and records
//! the outcome as the gateway's status. Status is written only when it changes.

use crate::db::{Database, Gateway, GatewayStatus};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between health check rounds
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

impl From<&crate::config::GatewaySettings> for HealthCheckConfig {
    fn from(settings: &crate::config::GatewaySettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.health_check_interval_secs),
            timeout: Duration::from_secs(settings.health_check_timeout_secs),
        }
    }
}

/// Health checker that monitors gateways
pub struct HealthChecker {
    db: Database,
    client: reqwest::Client,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(db: Database, config: HealthCheckConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .no_proxy()
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client for health checks");
                reqwest::Client::new()
            });
        Self { db, client, config }
    }

    /// Run the health checker until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Health checker started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    self.check_all_gateways().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every live gateway once
    pub async fn check_all_gateways(&self) {
        let gateways = match self.db.get_active_gateways() {
            Ok(gateways) => gateways,
            Err(e) => {
                error!(error = %e, "Failed to load gateways for health checks");
                return;
            }
        };

        for gateway in gateways {
            let healthy = self.check_gateway_health(&gateway).await;
            let observed = if healthy {
                GatewayStatus::Healthy
            } else {
                GatewayStatus::Unhealthy
            };
            if gateway.status == observed {
                continue;
            }

            match self.db.update_serving_gateway_status(&gateway.id, observed) {
                Ok(true) if healthy => info!(gateway = %gateway.name, "Gateway is now healthy"),
                Ok(true) => warn!(gateway = %gateway.name, "Gateway is now unhealthy"),
                Ok(false) => debug!(gateway = %gateway.name, "Gateway parked during probe"),
                Err(e) => {
                    error!(gateway = %gateway.name, error = %e, "Failed to update gateway status")
                }
            }
        }
    }

    /// True iff the probe answered 200
    async fn check_gateway_health(&self, gateway: &Gateway) -> bool {
        let url = gateway.health_url();
        match self.client.get(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                debug!(url = %url, "Health check passed");
                true
            }
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "Health check failed");
                false
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Health check failed (request error)");
                false
            }
        }
    }
}
