use super::query::{self, Select};
use super::Database;
use crate::error::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

const TABLE: &str = "tech_stacks";
const COLUMNS: &str = "id, name";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TechStack {
    pub id: String,
    pub name: String,
}

impl TechStack {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }
}

impl Database {
    /// Return the live tech stack called `name`, creating it on first use
    pub fn find_or_create_tech_stack(&self, name: &str) -> Result<TechStack> {
        let conn = self.conn();
        conn.execute(
            &query::upsert_sql(TABLE, &["id", "name"], &["name"], true),
            params![uuid::Uuid::new_v4().to_string(), name],
        )?;
        conn.query_row(
            &Select::from(TABLE, COLUMNS).filter("name = ?1").sql(),
            params![name],
            TechStack::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("tech stack {name}")))
    }

    pub fn get_tech_stack(&self, id: &str) -> Result<TechStack> {
        let conn = self.conn();
        conn.query_row(
            &Select::from(TABLE, COLUMNS).filter("id = ?1").sql(),
            params![id],
            TechStack::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("tech stack {id}")))
    }

    pub fn list_tech_stacks(&self) -> Result<Vec<TechStack>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&Select::from(TABLE, COLUMNS).order_by("name").sql())?;
        let stacks = stmt
            .query_map([], TechStack::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stacks)
    }
}
