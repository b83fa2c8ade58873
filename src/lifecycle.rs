//! Start, stop and delete deployed versions

use crate::db::{ApplicationVersion, Database, GatewayStatus, VersionStatus};
use crate::dockerfile;
use crate::engine::{forward_logs, ContainerEngine};
use crate::error::{Error, Result};
use crate::pipeline::{container_name, image_tag};
use crate::router::Router;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct LifecycleService {
    db: Database,
    engine: Arc<dyn ContainerEngine>,
    router: Arc<Router>,
}

impl LifecycleService {
    pub fn new(db: Database, engine: Arc<dyn ContainerEngine>, router: Arc<Router>) -> Self {
        Self { db, engine, router }
    }

    fn load(&self, application_id: &str, version_id: &str) -> Result<(String, ApplicationVersion)> {
        let app = self.db.get_application(application_id)?;
        let version = self.db.get_version(version_id)?;
        if version.application_id != app.id {
            return Err(Error::NotFound(format!(
                "version {} of application {}",
                version_id, application_id
            )));
        }
        Ok((app.name, version))
    }

    /// Record a fatal engine failure on the version before handing it back
    fn fail(&self, version: &ApplicationVersion, err: Error) -> Error {
        if !err.is_in_use() {
            if let Err(e) = self.db.update_version_status(&version.id, VersionStatus::Error) {
                warn!(version_id = %version.id, error = %e, "Failed to mark version as errored");
            }
        }
        err
    }

    pub async fn start_container(
        &self,
        application_id: &str,
        version_id: &str,
    ) -> Result<ApplicationVersion> {
        let (app_name, version) = self.load(application_id, version_id)?;
        let name = container_name(&app_name, &version.version_tag);

        if let Err(e) = self.start_by_name(&app_name, &version, &name).await {
            return Err(self.fail(&version, e));
        }

        self.db.update_version_status(&version.id, VersionStatus::Active)?;
        self.publish_routes(&version.application_id)?;
        info!(container = %name, "Version started");
        self.db.get_version(&version.id)
    }

    async fn start_by_name(&self, app_name: &str, version: &ApplicationVersion, name: &str) -> Result<()> {
        match self.engine.resolve_by_name(name).await? {
            Some(id) => self.engine.start(&id).await,
            None => {
                // Containers run with auto-remove, so a stopped version has to be recreated.
                let port = Self::exposed_port(Path::new(&version.storage_location)).await?;
                let image = image_tag(app_name, &version.version_tag);
                debug!(container = name, image = %image, port, "Recreating container");

                let id = self.engine.create(&image, name, port).await?;
                self.engine.start(&id).await?;
                forward_logs(Arc::clone(&self.engine), id, name.to_string());
                Ok(())
            }
        }
    }

    async fn exposed_port(dir: &Path) -> Result<u16> {
        let dockerfile = dockerfile::find_dockerfile(dir)
            .ok_or_else(|| Error::NotFound(format!("Dockerfile under {}", dir.display())))?;
        let content = tokio::fs::read_to_string(&dockerfile).await?;
        let port = dockerfile::exposed_port(&content);
        port.parse::<u16>()
            .map_err(|_| Error::InvalidInput(format!("'{}' is not a valid port", port)))
    }

    pub async fn stop_container(
        &self,
        application_id: &str,
        version_id: &str,
    ) -> Result<ApplicationVersion> {
        let (app_name, version) = self.load(application_id, version_id)?;
        let name = container_name(&app_name, &version.version_tag);

        let id = match self.engine.resolve_by_name(&name).await {
            Ok(Some(id)) => id,
            Ok(None) => return Err(Error::NotFound(format!("container {}", name))),
            Err(e) => return Err(self.fail(&version, e)),
        };
        if let Err(e) = self.engine.stop(&id).await {
            return Err(self.fail(&version, e));
        }

        self.db.update_version_status(&version.id, VersionStatus::Inactive)?;
        self.withdraw_routes_if_idle(&version.application_id)?;
        info!(container = %name, "Version stopped");
        self.db.get_version(&version.id)
    }

    /// Stop and remove a version's container and retire the version
    pub async fn delete_version(&self, application_id: &str, version_id: &str) -> Result<()> {
        let (app_name, version) = self.load(application_id, version_id)?;
        let name = container_name(&app_name, &version.version_tag);

        if let Some(id) = self.engine.resolve_by_name(&name).await? {
            self.engine.stop(&id).await?;
            match self.engine.remove(&id).await {
                Ok(()) => {}
                // Auto-removed containers can disappear between stop and remove.
                Err(e) => debug!(container = %name, error = %e, "Container already removed"),
            }
        }
        self.db.delete_version(&version.id)?;
        info!(container = %name, version_id = %version.id, "Version deleted");

        if self
            .db
            .get_versions_for_application(&version.application_id)?
            .is_empty()
        {
            for gateway in self.db.get_gateways_for_application(&version.application_id)? {
                self.router.remove_route(&gateway.to_route());
                self.db.delete_gateway(&gateway.id)?;
                info!(gateway = %gateway.name, "Removed gateway of deleted application");
            }
        }
        Ok(())
    }

    fn publish_routes(&self, application_id: &str) -> Result<()> {
        for gateway in self.db.get_gateways_for_application(application_id)? {
            if let Err(e) = self.router.add_route(gateway.to_route()) {
                self.db.update_gateway_status(&gateway.id, GatewayStatus::Error)?;
                return Err(e);
            }
            if !gateway.status.is_serving() {
                self.db
                    .update_gateway_status(&gateway.id, GatewayStatus::Active)?;
            }
        }
        Ok(())
    }

    /// Withdraw the application's routes once none of its versions is running
    fn withdraw_routes_if_idle(&self, application_id: &str) -> Result<()> {
        let running = self
            .db
            .get_versions_for_application(application_id)?
            .iter()
            .any(|v| v.status == VersionStatus::Active);
        if running {
            return Ok(());
        }

        for gateway in self.db.get_gateways_for_application(application_id)? {
            self.router.remove_route(&gateway.to_route());
            self.db
                .update_gateway_status(&gateway.id, GatewayStatus::Inactive)?;
        }
        Ok(())
    }
}
