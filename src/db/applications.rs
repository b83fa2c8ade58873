use super::query::{self, Select};
use super::Database;
use crate::error::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

const TABLE: &str = "applications";
const COLUMNS: &str =
    "id, name, description, storage_path, tech_stack_id, created_at, updated_at";

/// A deployable unit owning one or more versions
#[derive(Debug, Clone, Serialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Directory of the most recently staged artifact
    pub storage_path: Option<String>,
    pub tech_stack_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Application {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            storage_path: row.get(3)?,
            tech_stack_id: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

impl Database {
    /// Create an application with a fresh identifier
    pub fn insert_application(&self, name: &str, description: &str) -> Result<Application> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("application name is required".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        {
            let conn = self.conn();
            conn.execute(
                &query::insert_sql(TABLE, &["id", "name", "description"]),
                params![id, name, description],
            )?;
        }
        self.get_application(&id)
    }

    /// Get an application by id
    pub fn get_application(&self, id: &str) -> Result<Application> {
        let conn = self.conn();
        conn.query_row(
            &Select::from(TABLE, COLUMNS).filter("id = ?1").sql(),
            params![id],
            Application::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("application {id}")))
    }

    pub fn list_applications(&self) -> Result<Vec<Application>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&Select::from(TABLE, COLUMNS).order_by("created_at").sql())?;
        let apps = stmt
            .query_map([], Application::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(apps)
    }

    /// Write back every mutable column
    pub fn update_application(&self, app: &Application) -> Result<()> {
        let conn = self.conn();
        let rows = conn.execute(
            &query::update_sql(
                TABLE,
                &[
                    "name = ?1",
                    "description = ?2",
                    "storage_path = ?3",
                    "tech_stack_id = ?4",
                ],
                &["id = ?5"],
            ),
            params![
                app.name,
                app.description,
                app.storage_path,
                app.tech_stack_id,
                app.id
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("application {}", app.id)));
        }
        Ok(())
    }

    pub fn set_application_tech_stack(&self, id: &str, tech_stack_id: &str) -> Result<()> {
        let mut app = self.get_application(id)?;
        app.tech_stack_id = Some(tech_stack_id.to_string());
        self.update_application(&app)
    }

    pub fn set_application_storage(&self, id: &str, storage_path: &str) -> Result<()> {
        let mut app = self.get_application(id)?;
        app.storage_path = Some(storage_path.to_string());
        self.update_application(&app)
    }

    /// Soft-delete an application; returns false if it was already gone
    pub fn delete_application(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute(&query::soft_delete_sql(TABLE, &["id = ?1"]), params![id])?;
        Ok(rows > 0)
    }
}
