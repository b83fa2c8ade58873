use super::query::{self, Select};
use super::Database;
use crate::error::{Error, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

const TABLE: &str = "application_versions";
const COLUMNS: &str = "id, application_id, version_tag, description, status, storage_location, \
                       created_at, updated_at";

/// Lifecycle state of a deployed version
///
/// ```text
/// (new) -> active          on successful create/start
/// active <-> inactive      stop/start
/// *     -> error           fatal engine failure
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Active,
    Inactive,
    Error,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Active => "active",
            VersionStatus::Inactive => "inactive",
            VersionStatus::Error => "error",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(VersionStatus::Active),
            "inactive" => Ok(VersionStatus::Inactive),
            "error" => Ok(VersionStatus::Error),
            other => Err(Error::InvalidInput(format!("unknown version status '{other}'"))),
        }
    }
}

impl ToSql for VersionStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for VersionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// A buildable snapshot of an application
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationVersion {
    pub id: String,
    pub application_id: String,
    pub version_tag: String,
    pub description: String,
    pub status: VersionStatus,
    /// Absolute directory holding the source tree and its Dockerfile
    pub storage_location: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ApplicationVersion {
    /// A not-yet-persisted version with a fresh identifier
    pub fn new(application_id: &str, version_tag: &str, storage_location: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            application_id: application_id.to_string(),
            version_tag: version_tag.to_string(),
            description: String::new(),
            status: VersionStatus::Active,
            storage_location: storage_location.to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            application_id: row.get(1)?,
            version_tag: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            storage_location: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

impl Database {
    pub fn insert_version(&self, version: &ApplicationVersion) -> Result<ApplicationVersion> {
        {
            let conn = self.conn();
            conn.execute(
                &query::insert_sql(
                    TABLE,
                    &[
                        "id",
                        "application_id",
                        "version_tag",
                        "description",
                        "status",
                        "storage_location",
                    ],
                ),
                params![
                    version.id,
                    version.application_id,
                    version.version_tag,
                    version.description,
                    version.status,
                    version.storage_location
                ],
            )?;
        }
        self.get_version(&version.id)
    }

    pub fn get_version(&self, id: &str) -> Result<ApplicationVersion> {
        let conn = self.conn();
        conn.query_row(
            &Select::from(TABLE, COLUMNS).filter("id = ?1").sql(),
            params![id],
            ApplicationVersion::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("version {id}")))
    }

    /// Live version of an application carrying `tag`, if any
    pub fn find_version_by_tag(
        &self,
        application_id: &str,
        tag: &str,
    ) -> Result<Option<ApplicationVersion>> {
        let conn = self.conn();
        let version = conn
            .query_row(
                &Select::from(TABLE, COLUMNS)
                    .filter("application_id = ?1")
                    .filter("version_tag = ?2")
                    .sql(),
                params![application_id, tag],
                ApplicationVersion::from_row,
            )
            .optional()?;
        Ok(version)
    }

    pub fn get_versions_for_application(
        &self,
        application_id: &str,
    ) -> Result<Vec<ApplicationVersion>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            &Select::from(TABLE, COLUMNS)
                .filter("application_id = ?1")
                .order_by("created_at")
                .sql(),
        )?;
        let versions = stmt
            .query_map(params![application_id], ApplicationVersion::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(versions)
    }

    pub fn update_version_status(&self, id: &str, status: VersionStatus) -> Result<()> {
        let conn = self.conn();
        let rows = conn.execute(
            &query::update_sql(TABLE, &["status = ?1"], &["id = ?2"]),
            params![status, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("version {id}")));
        }
        Ok(())
    }

    pub fn delete_version(&self, id: &str) -> Result<bool> {
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
    fn test_version_lifecycle() {
        let (db, app_id) = setup();

        let version = db
            .insert_version(&ApplicationVersion::new(
                &app_id,
                "v1.1.0",
                "/srv/uploads/my-api/v1.1.0",
            ))
            .unwrap();
        assert_eq!(version.status, VersionStatus::Active);

        db.update_version_status(&version.id, VersionStatus::Inactive)
            .unwrap();
        assert_eq!(
            db.get_version(&version.id).unwrap().status,
            VersionStatus::Inactive
        );

        let found = db.find_version_by_tag(&app_id, "v1.1.0").unwrap().unwrap();
        assert_eq!(found.id, version.id);

        assert!(db.delete_version(&version.id).unwrap());
        assert!(db.get_versions_for_application(&app_id).unwrap().is_empty());
        assert!(db.find_version_by_tag(&app_id, "v1.1.0").unwrap().is_none());
        assert!(matches!(
            db.update_version_status(&version.id, VersionStatus::Active),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("error".parse::<VersionStatus>().unwrap(), VersionStatus::Error);
        assert!("running".parse::<VersionStatus>().is_err());
        assert_eq!(VersionStatus::Inactive.to_string(), "inactive");
    }
}
