use super::query::{self, Select};
use super::Database;
use crate::error::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const TABLE: &str = "gateway_configs";
const COLUMNS: &str = "id, default_versioning, load_balancer";

/// Process-wide gateway settings, stored as a single row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub id: String,
    pub default_versioning: String,
    pub load_balancer: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            default_versioning: "header".to_string(),
            load_balancer: false,
        }
    }
}

impl GatewayConfig {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            default_versioning: row.get(1)?,
            load_balancer: row.get(2)?,
        })
    }
}

impl Database {
    /// Read the singleton, creating it with defaults on first access
    pub fn get_gateway_config(&self) -> Result<GatewayConfig> {
        let conn = self.conn();
        let select = Select::from(TABLE, COLUMNS).order_by("created_at").sql() + " LIMIT 1";

        if let Some(config) = conn
            .query_row(&select, [], GatewayConfig::from_row)
            .optional()?
        {
            return Ok(config);
        }

        let config = GatewayConfig {
            id: uuid::Uuid::new_v4().to_string(),
            ..GatewayConfig::default()
        };
        conn.execute(
            &query::insert_sql(TABLE, &["id", "default_versioning", "load_balancer"]),
            params![config.id, config.default_versioning, config.load_balancer],
        )?;
        Ok(config)
    }

    /// Replace the singleton's settings; the stored identifier is kept
    pub fn update_gateway_config(&self, update: &GatewayConfig) -> Result<GatewayConfig> {
        if update.default_versioning.trim().is_empty() {
            return Err(Error::InvalidInput("default_versioning is required".into()));
        }

        let current = self.get_gateway_config()?;
        let conn = self.conn();
        conn.execute(
            &query::update_sql(
                TABLE,
                &["default_versioning = ?1", "load_balancer = ?2"],
                &["id = ?3"],
            ),
            params![update.default_versioning, update.load_balancer, current.id],
        )?;
        Ok(GatewayConfig {
            id: current.id,
            default_versioning: update.default_versioning.clone(),
            load_balancer: update.load_balancer,
        })
    }
}
