use super::query::{self, Select};
use super::Database;
use crate::error::{Error, Result};
use crate::router::Route;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const TABLE: &str = "gateways";
const COLUMNS: &str = "id, application_id, name, endpoint_type, domain, subdomain, path, port, \
                       status, created_at, updated_at";

/// How a gateway publishes its upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Path,
    Subdomain,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Path => "path",
            EndpointType::Subdomain => "subdomain",
        }
    }
}

impl FromStr for EndpointType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "path" => Ok(EndpointType::Path),
            "subdomain" => Ok(EndpointType::Subdomain),
            other => Err(Error::InvalidInput(format!(
                "unsupported endpoint type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Active,
    Inactive,
    Error,
    Healthy,
    Unhealthy,
}

impl GatewayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayStatus::Active => "active",
            GatewayStatus::Inactive => "inactive",
            GatewayStatus::Error => "error",
            GatewayStatus::Healthy => "healthy",
            GatewayStatus::Unhealthy => "unhealthy",
        }
    }

    /// Statuses whose gateway should be routed and probed
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            GatewayStatus::Active | GatewayStatus::Healthy | GatewayStatus::Unhealthy
        )
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(GatewayStatus::Active),
            "inactive" => Ok(GatewayStatus::Inactive),
            "error" => Ok(GatewayStatus::Error),
            "healthy" => Ok(GatewayStatus::Healthy),
            "unhealthy" => Ok(GatewayStatus::Unhealthy),
            other => Err(Error::InvalidInput(format!("unknown gateway status '{other}'"))),
        }
    }
}

impl ToSql for EndpointType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EndpointType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for GatewayStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for GatewayStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Publication record exposing an upstream port on the gateway listener
#[derive(Debug, Clone, Serialize)]
pub struct Gateway {
    pub id: String,
    pub application_id: String,
    pub name: String,
    pub endpoint_type: EndpointType,
    pub domain: String,
    pub subdomain: Option<String>,
    pub path: Option<String>,
    pub port: u16,
    pub status: GatewayStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl Gateway {
    /// Path-published gateway with a fresh identifier
    pub fn for_path(application_id: &str, name: &str, domain: &str, path: &str, port: u16) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            application_id: application_id.to_string(),
            name: name.to_string(),
            endpoint_type: EndpointType::Path,
            domain: domain.to_string(),
            subdomain: None,
            path: Some(path.to_string()),
            port,
            status: GatewayStatus::Active,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    /// Check the record invariants before it is persisted or routed
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("gateway name is required".into()));
        }
        if self.application_id.is_empty() {
            return Err(Error::InvalidInput("gateway application_id is required".into()));
        }
        if self.domain.is_empty() {
            return Err(Error::InvalidInput("gateway domain is required".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidInput("gateway port is required".into()));
        }
        match self.endpoint_type {
            EndpointType::Subdomain => {
                if self.subdomain.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::InvalidInput(
                        "subdomain gateways need a subdomain".into(),
                    ));
                }
            }
            EndpointType::Path => {
                if !self.path.as_deref().unwrap_or("").starts_with('/') {
                    return Err(Error::InvalidInput(
                        "path gateways need a path starting with '/'".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The in-memory route this gateway installs
    pub fn to_route(&self) -> Route {
        Route {
            app_id: self.application_id.clone(),
            port: self.port,
            domain: self.domain.clone(),
            subdomain: self.subdomain.clone().filter(|s| !s.is_empty()),
            path: self.path.clone().filter(|p| !p.is_empty()),
        }
    }

    /// Base URL of the health probe, e.g. `http://api.example.com/app/health`
    pub fn health_url(&self) -> String {
        let host = match self.subdomain.as_deref().filter(|s| !s.is_empty()) {
            Some(sub) => format!("{}.{}", sub, self.domain),
            None => self.domain.clone(),
        };
        format!("http://{}{}/health", host, self.path.as_deref().unwrap_or(""))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            application_id: row.get(1)?,
            name: row.get(2)?,
            endpoint_type: row.get(3)?,
            domain: row.get(4)?,
            subdomain: row.get(5)?,
            path: row.get(6)?,
            port: row.get(7)?,
            status: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

const WRITE_COLUMNS: [&str; 9] = [
    "id",
    "application_id",
    "name",
    "endpoint_type",
    "domain",
    "subdomain",
    "path",
    "port",
    "status",
];

/// A duplicate live name trips the partial unique index on `gateways.name`
fn name_taken(err: rusqlite::Error, name: &str) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            Error::Conflict(format!("gateway name '{}' is already taken", name))
        }
        other => Error::Database(other),
    }
}

impl Database {
    pub fn insert_gateway(&self, gateway: &Gateway) -> Result<Gateway> {
        {
            let conn = self.conn();
            conn.execute(
                &query::insert_sql(TABLE, &WRITE_COLUMNS),
                params![
                    gateway.id,
                    gateway.application_id,
                    gateway.name,
                    gateway.endpoint_type,
                    gateway.domain,
                    gateway.subdomain,
                    gateway.path,
                    gateway.port,
                    gateway.status
                ],
            )
            .map_err(|e| name_taken(e, &gateway.name))?;
        }
        self.get_gateway(&gateway.id)
    }

    /// Insert or refresh the live gateway with the same name
    pub fn upsert_gateway(&self, gateway: &Gateway) -> Result<Gateway> {
        let conn = self.conn();
        conn.execute(
            &query::upsert_sql(TABLE, &WRITE_COLUMNS, &["name"], true),
            params![
                gateway.id,
                gateway.application_id,
                gateway.name,
                gateway.endpoint_type,
                gateway.domain,
                gateway.subdomain,
                gateway.path,
                gateway.port,
                gateway.status
            ],
        )?;
        conn.query_row(
            &Select::from(TABLE, COLUMNS).filter("name = ?1").sql(),
            params![gateway.name],
            Gateway::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("gateway {}", gateway.name)))
    }

    pub fn get_gateway(&self, id: &str) -> Result<Gateway> {
        let conn = self.conn();
        conn.query_row(
            &Select::from(TABLE, COLUMNS).filter("id = ?1").sql(),
            params![id],
            Gateway::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("gateway {id}")))
    }

    pub fn list_gateways(&self) -> Result<Vec<Gateway>> {
        self.select_gateways(Select::from(TABLE, COLUMNS), params![])
    }

    pub fn get_gateways_for_application(&self, application_id: &str) -> Result<Vec<Gateway>> {
        self.select_gateways(
            Select::from(TABLE, COLUMNS).filter("application_id = ?1"),
            params![application_id],
        )
    }

    /// Gateways that should currently be routed and health checked
    pub fn get_active_gateways(&self) -> Result<Vec<Gateway>> {
        self.select_gateways(
            Select::from(TABLE, COLUMNS).filter("status IN ('active', 'healthy', 'unhealthy')"),
            params![],
        )
    }

    fn select_gateways(
        &self,
        select: Select,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Gateway>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&select.order_by("created_at").sql())?;
        let gateways = stmt
            .query_map(params, Gateway::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(gateways)
    }

    pub fn update_gateway(&self, gateway: &Gateway) -> Result<()> {
        let conn = self.conn();
        let rows = conn.execute(
            &query::update_sql(
                TABLE,
                &[
                    "application_id = ?1",
                    "name = ?2",
                    "endpoint_type = ?3",
                    "domain = ?4",
                    "subdomain = ?5",
                    "path = ?6",
                    "port = ?7",
                    "status = ?8",
                ],
                &["id = ?9"],
            ),
            params![
                gateway.application_id,
                gateway.name,
                gateway.endpoint_type,
                gateway.domain,
                gateway.subdomain,
                gateway.path,
                gateway.port,
                gateway.status,
                gateway.id
            ],
        )
        .map_err(|e| name_taken(e, &gateway.name))?;
        if rows == 0 {
            return Err(Error::NotFound(format!("gateway {}", gateway.id)));
        }
        Ok(())
    }

    pub fn update_gateway_status(&self, id: &str, status: GatewayStatus) -> Result<()> {
        let conn = self.conn();
        let rows = conn.execute(
            &query::update_sql(TABLE, &["status = ?1"], &["id = ?2"]),
            params![status, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("gateway {id}")));
        }
        Ok(())
    }

    /// Set `status` only while the gateway is still serving; false when it was
    /// parked, failed or deleted in the meantime
    pub fn update_serving_gateway_status(&self, id: &str, status: GatewayStatus) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute(
            &query::update_sql(
                TABLE,
                &["status = ?1"],
                &["id = ?2", "status IN ('active', 'healthy', 'unhealthy')"],
            ),
            params![status, id],
        )?;
        Ok(rows > 0)
    }

    /// Live gateway whose route is published under `key`
    pub fn find_gateway_by_route_key(&self, key: &str) -> Result<Option<Gateway>> {
        Ok(self
            .list_gateways()?
            .into_iter()
            .find(|g| g.to_route().key() == key))
    }

    pub fn delete_gateway(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute(&query::soft_delete_sql(TABLE, &["id = ?1"]), params![id])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let app = db.insert_application("My Api", "").unwrap();
        (db, app.id)
    }

    #[test]
    fn test_validate() {
        let mut gw = Gateway::for_path("app", "my-api-gateway", "localhost", "/my-api", 3000);
        assert!(gw.validate().is_ok());

        gw.path = Some("my-api".into());
        assert!(gw.validate().is_err());

        gw.endpoint_type = EndpointType::Subdomain;
        gw.subdomain = Some(String::new());
        assert!(gw.validate().is_err());

        gw.subdomain = Some("api".into());
        assert!(gw.validate().is_ok());

        gw.port = 0;
        assert!(gw.validate().is_err());
    }

    #[test]
    fn test_upsert_by_name_keeps_one_row() {
        let (db, app_id) = setup();

        let first = db
            .upsert_gateway(&Gateway::for_path(&app_id, "my-api-gateway", "localhost", "/my-api", 3000))
            .unwrap();
        let second = db
            .upsert_gateway(&Gateway::for_path(&app_id, "my-api-gateway", "localhost", "/my-api", 8080))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.port, 8080);
        assert_eq!(db.list_gateways().unwrap().len(), 1);
    }

    #[test]
    fn test_name_reusable_after_soft_delete() {
        let (db, app_id) = setup();

        let gw = db
            .insert_gateway(&Gateway::for_path(&app_id, "gw", "localhost", "/a", 3000))
            .unwrap();
        assert!(matches!(
            db.insert_gateway(&Gateway::for_path(&app_id, "gw", "localhost", "/b", 3001)),
            Err(Error::Conflict(_))
        ));

        assert!(db.delete_gateway(&gw.id).unwrap());
        let again = db
            .insert_gateway(&Gateway::for_path(&app_id, "gw", "localhost", "/b", 3001))
            .unwrap();
        assert_ne!(again.id, gw.id);
    }

    #[test]
    fn test_active_gateways_filter() {
        let (db, app_id) = setup();

        let a = db
            .insert_gateway(&Gateway::for_path(&app_id, "a", "localhost", "/a", 3000))
            .unwrap();
        let b = db
            .insert_gateway(&Gateway::for_path(&app_id, "b", "localhost", "/b", 3001))
            .unwrap();
        let c = db
            .insert_gateway(&Gateway::for_path(&app_id, "c", "localhost", "/c", 3002))
            .unwrap();

        db.update_gateway_status(&b.id, GatewayStatus::Unhealthy).unwrap();
        db.update_gateway_status(&c.id, GatewayStatus::Inactive).unwrap();

        let ids: Vec<_> = db
            .get_active_gateways()
            .unwrap()
            .into_iter()
            .map(|g| g.id)
            .collect();
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
        assert!(!ids.contains(&c.id));
        assert_eq!(db.get_gateways_for_application(&app_id).unwrap().len(), 3);
    }

    #[test]
    fn test_rename_to_taken_name_conflicts() {
        let (db, app_id) = setup();
        db.insert_gateway(&Gateway::for_path(&app_id, "a", "localhost", "/a", 3000))
            .unwrap();
        let mut b = db
            .insert_gateway(&Gateway::for_path(&app_id, "b", "localhost", "/b", 3001))
            .unwrap();

        b.name = "a".into();
        assert!(matches!(db.update_gateway(&b), Err(Error::Conflict(_))));
        assert_eq!(db.get_gateway(&b.id).unwrap().name, "b");
    }

    #[test]
    fn test_serving_status_update_skips_parked() {
        let (db, app_id) = setup();
        let gw = db
            .insert_gateway(&Gateway::for_path(&app_id, "gw", "localhost", "/a", 3000))
            .unwrap();

        assert!(db.update_serving_gateway_status(&gw.id, GatewayStatus::Healthy).unwrap());
        db.update_gateway_status(&gw.id, GatewayStatus::Inactive).unwrap();
        assert!(!db.update_serving_gateway_status(&gw.id, GatewayStatus::Unhealthy).unwrap());
        assert_eq!(db.get_gateway(&gw.id).unwrap().status, GatewayStatus::Inactive);
    }

    #[test]
    fn test_find_by_route_key() {
        let (db, app_id) = setup();
        let gw = db
            .insert_gateway(&Gateway::for_path(&app_id, "gw", "localhost", "/a", 3000))
            .unwrap();

        let found = db.find_gateway_by_route_key("localhost/a").unwrap().unwrap();
        assert_eq!(found.id, gw.id);
        assert!(db.find_gateway_by_route_key("localhost/b").unwrap().is_none());

        db.delete_gateway(&gw.id).unwrap();
        assert!(db.find_gateway_by_route_key("localhost/a").unwrap().is_none());
    }

    #[test]
    fn test_route_and_health_url() {
        let mut gw = Gateway::for_path("app", "gw", "example.com", "/my-api", 3000);
        let route = gw.to_route();
        assert_eq!(route.path.as_deref(), Some("/my-api"));
        assert!(route.subdomain.is_none());
        assert_eq!(gw.health_url(), "http://example.com/my-api/health");

        gw.endpoint_type = EndpointType::Subdomain;
        gw.subdomain = Some("api".into());
        gw.path = None;
        assert_eq!(gw.health_url(), "http://api.example.com/health");
    }
}
