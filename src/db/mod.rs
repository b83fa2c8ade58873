//! SQLite persistence for applications, versions, gateways and statistics
//!
//! Every table carries `created_at`, `updated_at` and `deleted_at`. Rows are never
//! removed: deletes set `deleted_at` and every read filters on
//! `deleted_at IS NULL` through the [`query`] helpers.

mod applications;
mod gateway_config;
mod gateways;
pub mod query;
mod stats;
mod tech_stacks;
mod versions;

pub use applications::Application;
pub use gateway_config::GatewayConfig;
pub use gateways::{EndpointType, Gateway, GatewayStatus};
pub use stats::ApplicationStat;
pub use tech_stacks::TechStack;
pub use versions::{ApplicationVersion, VersionStatus};

use crate::error::Result;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&conn)?;
            }

            if current_version < 2 {
                migrate_v2(&conn)?;
            }
        }

        Ok(())
    }
}

/// Migration v1: applications, versions, tech stacks and gateways
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying migration v1: initial schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tech_stacks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS applications (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            storage_path TEXT,
            tech_stack_id TEXT REFERENCES tech_stacks(id),
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS application_versions (
            id TEXT PRIMARY KEY,
            application_id TEXT NOT NULL REFERENCES applications(id),
            version_tag TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'active',
            storage_location TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS gateways (
            id TEXT PRIMARY KEY,
            application_id TEXT NOT NULL REFERENCES applications(id),
            name TEXT NOT NULL,
            endpoint_type TEXT NOT NULL,
            domain TEXT NOT NULL,
            subdomain TEXT,
            path TEXT,
            port INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_tech_stacks_name
            ON tech_stacks(name) WHERE deleted_at IS NULL;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_gateways_name
            ON gateways(name) WHERE deleted_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_versions_app ON application_versions(application_id);
        CREATE INDEX IF NOT EXISTS idx_gateways_app ON gateways(application_id);

        INSERT INTO schema_migrations (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Migration v2: hourly statistics and the gateway config singleton
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Applying migration v2: statistics");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS application_stats (
            id TEXT PRIMARY KEY,
            application_id TEXT NOT NULL,
            date TEXT NOT NULL,
            requests INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            average_response_time REAL,
            data_transferred INTEGER,
            unique_visitors INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_application_stats_hour
            ON application_stats(application_id, date);

        CREATE TABLE IF NOT EXISTS gateway_configs (
            id TEXT PRIMARY KEY,
            default_versioning TEXT NOT NULL,
            load_balancer INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );

        INSERT INTO schema_migrations (version) VALUES (2);
        "#,
    )?;

    Ok(())
}
