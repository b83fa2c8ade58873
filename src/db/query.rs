//! SQL builders shared by the entity facades
//!
//! Every statement produced here is scoped to live rows: selects, updates and
//! soft deletes all carry `deleted_at IS NULL`, so a tombstoned row can never be
//! read back or modified through a facade. Placeholders are numbered by the caller
//! inside predicates; `insert_sql` and `upsert_sql` number their own.

const LIVE: &str = "deleted_at IS NULL";

/// A SELECT over one table with an AND-ed predicate list
#[derive(Debug, Clone)]
pub struct Select {
    table: &'static str,
    columns: &'static str,
    predicates: Vec<String>,
    order_by: Option<&'static str>,
}

impl Select {
    pub fn from(table: &'static str, columns: &'static str) -> Self {
        Self {
            table,
            columns,
            predicates: Vec::new(),
            order_by: None,
        }
    }

    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.predicates.push(predicate.into());
        self
    }

    pub fn order_by(mut self, clause: &'static str) -> Self {
        self.order_by = Some(clause);
        self
    }

    pub fn sql(&self) -> String {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {}",
            self.columns,
            self.table,
            where_clause(&self.predicates)
        );
        if let Some(order) = self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        sql
    }
}

/// `INSERT INTO table (a, b) VALUES (?1, ?2)`
pub fn insert_sql(table: &str, columns: &[&str]) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders(columns.len())
    )
}

/// Insert that resolves a clash on `conflict` by refreshing the non-key columns.
///
/// `partial` must be set when the unique index behind `conflict` is restricted to
/// live rows. With nothing left to refresh the statement becomes `DO NOTHING`.
pub fn upsert_sql(table: &str, columns: &[&str], conflict: &[&str], partial: bool) -> String {
    let refresh: Vec<String> = columns
        .iter()
        .filter(|c| **c != "id" && !conflict.contains(c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();

    let target = if partial {
        format!("({}) WHERE {}", conflict.join(", "), LIVE)
    } else {
        format!("({})", conflict.join(", "))
    };

    let action = if refresh.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!(
            "DO UPDATE SET {}, updated_at = datetime('now')",
            refresh.join(", ")
        )
    };

    format!("{} ON CONFLICT{} {}", insert_sql(table, columns), target, action)
}

/// UPDATE of live rows; `updated_at` is always refreshed
pub fn update_sql(table: &str, assignments: &[&str], predicates: &[&str]) -> String {
    format!(
        "UPDATE {} SET {}, updated_at = datetime('now') WHERE {}",
        table,
        assignments.join(", "),
        where_clause(predicates)
    )
}

/// Tombstone live rows matching every predicate
pub fn soft_delete_sql(table: &str, predicates: &[&str]) -> String {
    format!(
        "UPDATE {} SET deleted_at = datetime('now'), updated_at = datetime('now') WHERE {}",
        table,
        where_clause(predicates)
    )
}

fn where_clause<S: AsRef<str>>(predicates: &[S]) -> String {
    predicates
        .iter()
        .map(|p| p.as_ref())
        .chain(std::iter::once(LIVE))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}
