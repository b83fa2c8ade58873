use super::query::{self, Select};
use super::Database;
use crate::error::Result;
use chrono::NaiveDateTime;
use rusqlite::{params, Row};
use serde::Serialize;

const TABLE: &str = "application_stats";
const COLUMNS: &str = "id, application_id, date, requests, errors, average_response_time, \
                       data_transferred, unique_visitors";

/// Per-hour traffic counters for one application
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationStat {
    pub id: String,
    pub application_id: String,
    /// Start of the hour the counters cover
    pub date: NaiveDateTime,
    pub requests: u64,
    pub errors: u64,
    pub average_response_time: Option<f64>,
    pub data_transferred: Option<u64>,
    pub unique_visitors: Option<u64>,
}

impl ApplicationStat {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            application_id: row.get(1)?,
            date: row.get(2)?,
            requests: row.get(3)?,
            errors: row.get(4)?,
            average_response_time: row.get(5)?,
            data_transferred: row.get(6)?,
            unique_visitors: row.get(7)?,
        })
    }
}

impl Database {
    /// Store the counters of one closed hour; a re-flush overwrites the same row
    pub fn upsert_application_stat(
        &self,
        application_id: &str,
        hour: NaiveDateTime,
        requests: u64,
        errors: u64,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            &query::upsert_sql(
                TABLE,
                &["id", "application_id", "date", "requests", "errors"],
                &["application_id", "date"],
                false,
            ),
            params![
                uuid::Uuid::new_v4().to_string(),
                application_id,
                hour,
                requests,
                errors
            ],
        )?;
        Ok(())
    }

    pub fn get_application_stats(&self, application_id: &str) -> Result<Vec<ApplicationStat>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            &Select::from(TABLE, COLUMNS)
                .filter("application_id = ?1")
                .order_by("date")
                .sql(),
        )?;
        let stats = stmt
            .query_map(params![application_id], ApplicationStat::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use chrono::NaiveDate;

    #[test]
    fn test_one_row_per_application_hour() {
        let db = Database::open_in_memory().unwrap();
        let hour = NaiveDate::from_ymd_opt(2024, 12, 26)
            .unwrap()
            .and_hms_opt(11, 0, 0)
            .unwrap();

        db.upsert_application_stat("default", hour, 90, 4).unwrap();
        db.upsert_application_stat("default", hour, 100, 5).unwrap();

        let stats = db.get_application_stats("default").unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].date, hour);
        assert_eq!(stats[0].requests, 100);
        assert_eq!(stats[0].errors, 5);
        assert!(stats[0].average_response_time.is_none());
    }
}
