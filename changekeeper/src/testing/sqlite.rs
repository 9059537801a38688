//! Test harness for checking a changelog against SQLite.
//!
//! Changesets can be applied one prefix at a time, so tests can insert data between
//! changesets and check how later changesets transform it.

use std::collections::HashMap;

use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};

use super::HarnessError;
use crate::core::{DEFAULT_LEDGER_TABLE_NAME, DEFAULT_LOCK_TABLE_NAME};
use crate::sqlite::SqliteBackend;
use crate::{Changelog, ChangesetId, LedgerEntry, Migrator, RollbackReport, UpdateOptions};

/// A test harness for SQLite changelog testing that provides state control and assertion
/// helpers.
///
/// # Example
///
/// ```
/// use changekeeper::testing::sqlite::SqliteTestHarness;
/// use changekeeper::Changelog;
///
/// # fn test() -> Result<(), changekeeper::testing::HarnessError> {
/// let changelog = Changelog::parse(
///     "--liquibase formatted sql\n\
///      --changeset alice:1\n\
///      CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);\n\
///      --rollback DROP TABLE users;\n\
///      --changeset alice:2\n\
///      UPDATE users SET name = upper(name);\n\
///      --rollback not required\n",
///     "changelog.sql",
/// )?;
/// let mut harness = SqliteTestHarness::new(changelog);
///
/// // apply the first changeset only, then seed data
/// harness.update_to("1")?;
/// harness.execute("INSERT INTO users VALUES (1, 'alice')")?;
///
/// // apply the rest and check the transformation
/// harness.update()?;
/// let name: String = harness.query_one("SELECT name FROM users WHERE id = 1")?;
/// assert_eq!(name, "ALICE");
/// harness.assert_table_exists("users")?;
/// # Ok(())
/// # }
/// # test().unwrap();
/// ```
pub struct SqliteTestHarness {
    backend: SqliteBackend,
    changelog: Changelog,
}

/// A captured database schema, excluding the ledger and lock tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Map of table name to table definitions
    pub tables: HashMap<String, TableSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
}

impl SqliteTestHarness {
    /// Create a harness over a fresh in-memory database.
    ///
    /// Pass the same changelog production uses: as it grows, assertions written against
    /// earlier changesets should keep passing.
    pub fn new(changelog: Changelog) -> Self {
        let conn = Connection::open_in_memory().expect("Failed to create in-memory test database");
        Self::with_connection(conn, changelog)
    }

    /// Create a harness over a custom connection, eg a file-based database.
    pub fn with_connection(conn: Connection, changelog: Changelog) -> Self {
        Self {
            backend: SqliteBackend::new(conn),
            changelog,
        }
    }

    /// Apply every pending changeset.
    pub fn update(&mut self) -> Result<Vec<ChangesetId>, HarnessError> {
        self.update_with(&UpdateOptions::default())
    }

    pub fn update_with(
        &mut self,
        options: &UpdateOptions,
    ) -> Result<Vec<ChangesetId>, HarnessError> {
        let report = Migrator::new(self.changelog.clone()).update(&mut self.backend, options)?;
        Ok(report.applied)
    }

    /// Apply pending changesets up to and including the first one whose id is `id`.
    pub fn update_to(&mut self, id: &str) -> Result<Vec<ChangesetId>, HarnessError> {
        let prefix = self.changelog.up_to(id).ok_or_else(|| {
            HarnessError::Assertion(format!(
                "Changeset '{}' does not exist. Available ids: {}",
                id,
                self.changelog
                    .changesets()
                    .iter()
                    .map(|c| c.id.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        let report =
            Migrator::new(prefix).update(&mut self.backend, &UpdateOptions::default())?;
        Ok(report.applied)
    }

    pub fn tag(&mut self, name: &str) -> Result<(), HarnessError> {
        Migrator::new(self.changelog.clone()).tag(&mut self.backend, name)?;
        Ok(())
    }

    pub fn rollback_to_tag(&mut self, tag: &str) -> Result<RollbackReport, HarnessError> {
        let report =
            Migrator::new(self.changelog.clone()).rollback_to_tag(&mut self.backend, tag)?;
        Ok(report)
    }

    /// Ids of the changesets currently in the ledger, oldest first. Tag markers are left out.
    pub fn applied(&mut self) -> Result<Vec<String>, HarnessError> {
        Ok(self
            .history()?
            .into_iter()
            .filter(|e| !e.is_tag_marker())
            .map(|e| e.id.id)
            .collect())
    }

    pub fn history(&mut self) -> Result<Vec<LedgerEntry>, HarnessError> {
        Ok(Migrator::new(self.changelog.clone()).history(&mut self.backend)?)
    }

    /// Execute SQL (for setting up test data).
    pub fn execute(&mut self, sql: &str) -> Result<(), HarnessError> {
        self.backend.connection().execute_batch(sql)?;
        Ok(())
    }

    /// Query a single value from the database.
    pub fn query_one<T>(&mut self, sql: &str) -> Result<T, HarnessError>
    where
        T: rusqlite::types::FromSql,
    {
        Ok(self.backend.connection().query_row(sql, [], |row| row.get(0))?)
    }

    /// Query all values from a single-column result.
    pub fn query_all<T>(&mut self, sql: &str) -> Result<Vec<T>, HarnessError>
    where
        T: rusqlite::types::FromSql,
    {
        self.query_map(sql, |row| row.get(0))
    }

    /// Query with a custom row mapper.
    pub fn query_map<T, F>(&mut self, sql: &str, f: F) -> Result<Vec<T>, HarnessError>
    where
        F: FnMut(&Row) -> rusqlite::Result<T>,
    {
        let mut stmt = self.backend.connection().prepare(sql)?;
        let results = stmt.query_map([], f)?.collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    fn count_objects(&self, kind: &str, name: &str) -> Result<i64, HarnessError> {
        Ok(self.backend.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
            [kind, name],
            |row| row.get(0),
        )?)
    }

    pub fn assert_table_exists(&mut self, table_name: &str) -> Result<(), HarnessError> {
        if self.count_objects("table", table_name)? == 0 {
            return Err(HarnessError::Assertion(format!(
                "Table '{}' does not exist",
                table_name
            )));
        }
        Ok(())
    }

    pub fn assert_table_not_exists(&mut self, table_name: &str) -> Result<(), HarnessError> {
        if self.count_objects("table", table_name)? > 0 {
            return Err(HarnessError::Assertion(format!(
                "Table '{}' exists but should not",
                table_name
            )));
        }
        Ok(())
    }

    pub fn assert_column_exists(
        &mut self,
        table_name: &str,
        column_name: &str,
    ) -> Result<(), HarnessError> {
        if !self.columns(table_name)?.iter().any(|c| c.name == column_name) {
            return Err(HarnessError::Assertion(format!(
                "Column '{}' does not exist in table '{}'",
                column_name, table_name
            )));
        }
        Ok(())
    }

    pub fn assert_index_exists(&mut self, index_name: &str) -> Result<(), HarnessError> {
        if self.count_objects("index", index_name)? == 0 {
            return Err(HarnessError::Assertion(format!(
                "Index '{}' does not exist",
                index_name
            )));
        }
        Ok(())
    }

    /// Capture the current schema of every user table.
    pub fn capture_schema(&mut self) -> Result<SchemaSnapshot, HarnessError> {
        let table_names: Vec<String> = self.query_all(&format!(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
             AND name NOT IN ('{}', '{}')",
            DEFAULT_LEDGER_TABLE_NAME, DEFAULT_LOCK_TABLE_NAME
        ))?;

        let mut tables = HashMap::new();
        for table_name in table_names {
            let columns = self.columns(&table_name)?;
            let indexes = self.indexes(&table_name)?;
            tables.insert(table_name, TableSchema { columns, indexes });
        }
        Ok(SchemaSnapshot { tables })
    }

    /// Fail with a readable list of differences unless the schema equals `expected`.
    pub fn assert_schema_matches(&mut self, expected: &SchemaSnapshot) -> Result<(), HarnessError> {
        let actual = self.capture_schema()?;
        if actual == *expected {
            return Ok(());
        }

        let mut names: Vec<&String> = expected.tables.keys().chain(actual.tables.keys()).collect();
        names.sort();
        names.dedup();

        let mut differences = Vec::new();
        for name in names {
            match (expected.tables.get(name), actual.tables.get(name)) {
                (Some(_), None) => differences.push(format!("  - Table '{}' is missing", name)),
                (None, Some(_)) => {
                    differences.push(format!("  - Unexpected table '{}' found", name))
                }
                (Some(want), Some(got)) => {
                    if want.columns != got.columns {
                        differences.push(format!(
                            "  - Table '{}' columns differ:\n    Expected: {:?}\n    Actual:   {:?}",
                            name, want.columns, got.columns
                        ));
                    }
                    if want.indexes != got.indexes {
                        differences.push(format!(
                            "  - Table '{}' indexes differ:\n    Expected: {:?}\n    Actual:   {:?}",
                            name, want.indexes, got.indexes
                        ));
                    }
                }
                (None, None) => {}
            }
        }

        Err(HarnessError::Assertion(format!(
            "Schema mismatch detected:\n{}",
            differences.join("\n")
        )))
    }

    fn columns(&mut self, table_name: &str) -> Result<Vec<ColumnInfo>, HarnessError> {
        self.query_map(&format!("PRAGMA table_info({})", table_name), |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                type_name: row.get(2)?,
                not_null: row.get::<_, i32>(3)? != 0,
                default_value: row.get(4)?,
                primary_key: row.get::<_, i32>(5)? != 0,
            })
        })
    }

    fn indexes(&mut self, table_name: &str) -> Result<Vec<IndexInfo>, HarnessError> {
        let mut indexes = self.query_map(&format!("PRAGMA index_list({})", table_name), |row| {
            Ok(IndexInfo {
                name: row.get(1)?,
                unique: row.get::<_, i32>(2)? != 0,
            })
        })?;
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(indexes)
    }

    /// Get the underlying connection for advanced usage.
    pub fn connection(&mut self) -> &mut Connection {
        self.backend.connection_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changelog() -> Changelog {
        Changelog::parse(
            "--liquibase formatted sql\n\
             --changeset alice:1\n\
             CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);\n\
             --rollback DROP TABLE users;\n\
             --changeset alice:2\n\
             ALTER TABLE users ADD COLUMN email TEXT;\n\
             --rollback ALTER TABLE users DROP COLUMN email;\n\
             --changeset alice:3\n\
             CREATE UNIQUE INDEX idx_users_email ON users (email);\n\
             --rollback DROP INDEX idx_users_email;\n",
            "changelog.sql",
        )
        .unwrap()
    }

    #[test]
    fn update_to_applies_prefix() {
        let mut harness = SqliteTestHarness::new(changelog());
        assert!(harness.applied().unwrap().is_empty());

        harness.update_to("2").unwrap();
        assert_eq!(harness.applied().unwrap(), vec!["1", "2"]);

        harness.update().unwrap();
        assert_eq!(harness.applied().unwrap(), vec!["1", "2", "3"]);
    }

    #[test]
    fn update_to_unknown_id() {
        let mut harness = SqliteTestHarness::new(changelog());
        let err = harness.update_to("9").unwrap_err().to_string();
        assert!(err.contains("Changeset '9' does not exist"));
        assert!(err.contains("Available ids: 1, 2, 3"));
    }

    #[test]
    fn execute_and_query() {
        let mut harness = SqliteTestHarness::new(changelog());
        harness.update_to("1").unwrap();
        harness
            .execute("INSERT INTO users VALUES (1, 'alice'); INSERT INTO users VALUES (2, 'bob');")
            .unwrap();

        let name: String = harness.query_one("SELECT name FROM users WHERE id = 1").unwrap();
        assert_eq!(name, "alice");
        let names: Vec<String> = harness.query_all("SELECT name FROM users ORDER BY id").unwrap();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[test]
    fn table_column_and_index_assertions() {
        let mut harness = SqliteTestHarness::new(changelog());
        harness.assert_table_not_exists("users").unwrap();

        harness.update_to("1").unwrap();
        harness.assert_table_exists("users").unwrap();
        assert!(harness.assert_table_exists("nonexistent").is_err());
        harness.assert_column_exists("users", "name").unwrap();
        assert!(harness.assert_column_exists("users", "email").is_err());
        assert!(harness.assert_index_exists("idx_users_email").is_err());

        harness.update().unwrap();
        harness.assert_column_exists("users", "email").unwrap();
        harness.assert_index_exists("idx_users_email").unwrap();
    }

    #[test]
    fn capture_schema_skips_bookkeeping_tables() {
        let mut harness = SqliteTestHarness::new(changelog());
        harness.update().unwrap();
        let snapshot = harness.capture_schema().unwrap();
        assert_eq!(snapshot.tables.len(), 1);
        let users = &snapshot.tables["users"];
        assert_eq!(users.columns.len(), 3);
        assert_eq!(users.indexes.len(), 1);
        assert!(users.indexes[0].unique);
    }

    #[test]
    fn rollback_restores_tagged_schema() {
        let mut harness = SqliteTestHarness::new(changelog());
        harness.update_to("1").unwrap();
        harness.tag("v1").unwrap();
        let at_v1 = harness.capture_schema().unwrap();

        harness.update().unwrap();
        assert!(harness.assert_schema_matches(&at_v1).is_err());

        let report = harness.rollback_to_tag("v1").unwrap();
        assert_eq!(report.rolled_back.len(), 2);
        harness.assert_schema_matches(&at_v1).unwrap();
        assert_eq!(harness.applied().unwrap(), vec!["1"]);
    }

    #[test]
    fn schema_mismatch_lists_differences() {
        let mut harness = SqliteTestHarness::new(changelog());
        harness.update().unwrap();
        let mut snapshot = harness.capture_schema().unwrap();
        snapshot.tables.remove("users");
        snapshot.tables.insert(
            "accounts".to_string(),
            TableSchema {
                columns: vec![],
                indexes: vec![],
            },
        );

        let err = harness.assert_schema_matches(&snapshot).unwrap_err().to_string();
        assert!(err.contains("Table 'accounts' is missing"));
        assert!(err.contains("Unexpected table 'users' found"));
    }

    #[test]
    fn snapshot_serializes() {
        let mut harness = SqliteTestHarness::new(changelog());
        harness.update().unwrap();
        let snapshot = harness.capture_schema().unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: SchemaSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
