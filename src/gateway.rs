//! Gateway records and the routes they install

use crate::db::{Database, EndpointType, Gateway, GatewayStatus};
use crate::error::{Error, Result};
use crate::router::Router;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Fields an operator supplies for a gateway
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRequest {
    pub application_id: String,
    pub name: String,
    pub endpoint_type: EndpointType,
    pub domain: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    pub port: u16,
}

impl GatewayRequest {
    fn apply_to(self, gateway: &mut Gateway) {
        gateway.application_id = self.application_id;
        gateway.name = self.name;
        gateway.endpoint_type = self.endpoint_type;
        gateway.domain = self.domain;
        gateway.subdomain = self.subdomain;
        gateway.path = self.path;
        gateway.port = self.port;
    }
}

pub struct GatewayService {
    db: Database,
    router: Arc<Router>,
}

impl GatewayService {
    pub fn new(db: Database, router: Arc<Router>) -> Self {
        Self { db, router }
    }

    pub async fn create(&self, request: GatewayRequest) -> Result<Gateway> {
        let mut gateway = Gateway::for_path(&request.application_id, "", "", "", 0);
        request.apply_to(&mut gateway);
        gateway.validate()?;
        self.db.get_application(&gateway.application_id)?;
        self.ensure_route_free(&gateway)?;

        let gateway = self.db.insert_gateway(&gateway)?;
        if let Err(e) = self.router.add_route(gateway.to_route()) {
            self.db
                .update_gateway_status(&gateway.id, GatewayStatus::Error)?;
            return Err(e);
        }

        info!(gateway = %gateway.name, key = %gateway.to_route().key(), "Gateway created");
        Ok(gateway)
    }

    pub async fn update(&self, id: &str, request: GatewayRequest) -> Result<Gateway> {
        let previous = self.db.get_gateway(id)?;
        let mut gateway = previous.clone();
        request.apply_to(&mut gateway);
        gateway.validate()?;
        self.ensure_route_free(&gateway)?;

        self.router.remove_route(&previous.to_route());
        if let Err(e) = self.router.add_route(gateway.to_route()) {
            self.restore_previous(&previous);
            gateway.status = GatewayStatus::Error;
            self.db.update_gateway(&gateway)?;
            return Err(e);
        }
        if !gateway.status.is_serving() {
            gateway.status = GatewayStatus::Active;
        }
        if let Err(e) = self.db.update_gateway(&gateway) {
            self.router.remove_route(&gateway.to_route());
            self.restore_previous(&previous);
            return Err(e);
        }

        info!(gateway = %gateway.name, key = %gateway.to_route().key(), "Gateway updated");
        self.db.get_gateway(id)
    }

    /// Reject a gateway whose route key another live gateway already owns
    fn ensure_route_free(&self, gateway: &Gateway) -> Result<()> {
        let key = gateway.to_route().key();
        match self.db.find_gateway_by_route_key(&key)? {
            Some(owner) if owner.id != gateway.id => Err(Error::Conflict(format!(
                "route {} is already published by gateway '{}'",
                key, owner.name
            ))),
            _ => Ok(()),
        }
    }

    fn restore_previous(&self, previous: &Gateway) {
        if !previous.status.is_serving() {
            return;
        }
        if let Err(e) = self.router.add_route(previous.to_route()) {
            warn!(gateway = %previous.name, error = %e, "Cannot restore previous route");
        }
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let gateway = self.db.get_gateway(id)?;
        self.router.remove_route(&gateway.to_route());
        self.db.delete_gateway(&gateway.id)?;
        info!(gateway = %gateway.name, "Gateway deleted");
        Ok(())
    }

    /// Reinstall the route of every serving gateway; returns how many were installed
    pub fn restore_routes(&self) -> Result<usize> {
        let mut restored = 0;
        for gateway in self.db.list_gateways()? {
            if !gateway.status.is_serving() {
                continue;
            }
            match self.router.add_route(gateway.to_route()) {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(gateway = %gateway.name, error = %e, "Cannot restore route");
                    self.db
                        .update_gateway_status(&gateway.id, GatewayStatus::Error)?;
                }
            }
        }
        info!(restored, "Restored gateway routes");
        Ok(restored)
    }
}
