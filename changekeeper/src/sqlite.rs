//! SQLite backend built on [`rusqlite`](https://crates.io/crates/rusqlite).
//!
//! URLs take the form `sqlite://path/to/app.db` (or `sqlite:app.db`), and
//! `sqlite::memory:` for a private in-memory database.
//!
//! SQLite runs DDL inside transactions, so a failing changeset leaves no trace: its
//! statements and its ledger row are rolled back together.
//!
//! ```
//! use changekeeper::sqlite::SqliteBackend;
//! use changekeeper::{Changelog, Migrator, UpdateOptions};
//! use rusqlite::Connection;
//!
//! let changelog = Changelog::parse(
//!     "--liquibase formatted sql\n\
//!      --changeset alice:1\n\
//!      CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);\n\
//!      --rollback DROP TABLE users;\n",
//!     "changelog.sql",
//! )
//! .unwrap();
//!
//! let mut backend = SqliteBackend::new(Connection::open_in_memory().unwrap());
//! let report = Migrator::new(changelog)
//!     .update(&mut backend, &UpdateOptions::default())
//!     .unwrap();
//! assert_eq!(report.applied.len(), 1);
//!
//! let count: i64 = backend
//!     .connection()
//!     .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
//!     .unwrap();
//! assert_eq!(count, 0);
//! ```

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::backend::{
    parse_lock_granted, Backend, BackendTransaction, ConnectOptions, Dialect, LedgerRow,
    LEDGER_COLUMNS,
};
use crate::core::{ChangesetId, LedgerEntry, LockStatus};
use crate::error::{BackendError, Error};

/// A [`Backend`] over a single SQLite connection.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Open the database named by `options.url`.
    pub fn open(options: &ConnectOptions) -> Result<Self, Error> {
        let connect_error = |source: rusqlite::Error| Error::Connect {
            url: options.url.clone(),
            source: source.into(),
        };
        let conn = match database_path(&options.url)? {
            None => Connection::open_in_memory(),
            Some(path) => Connection::open(path),
        }
        .map_err(connect_error)?;
        conn.busy_timeout(options.timeout).map_err(connect_error)?;
        Ok(Self { conn })
    }

    /// [`BackendFactory`](crate::backend::BackendFactory) for the `sqlite` scheme.
    pub fn connect(options: &ConnectOptions) -> Result<Box<dyn Backend>, Error> {
        Ok(Box::new(Self::open(options)?))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }
}

/// `None` for an in-memory database.
fn database_path(url: &str) -> Result<Option<&str>, Error> {
    let rest = url
        .strip_prefix("sqlite:")
        .or_else(|| url.strip_prefix("SQLITE:"))
        .ok_or_else(|| Error::InvalidConfig(format!("'{}' is not a sqlite URL", url)))?;
    let path = rest.strip_prefix("//").unwrap_or(rest);
    match path {
        ":memory:" | "" => Ok(None),
        path => Ok(Some(path)),
    }
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, BackendError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn execute(&mut self, sql: &str) -> Result<(), BackendError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn select_entries(&mut self, table: &str) -> Result<Vec<LedgerEntry>, BackendError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY order_executed",
            LEDGER_COLUMNS, table
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LedgerRow {
                    id: row.get(0)?,
                    author: row.get(1)?,
                    filename: row.get(2)?,
                    applied_at: row.get(3)?,
                    order_executed: row.get(4)?,
                    exec_type: row.get(5)?,
                    checksum: row.get(6)?,
                    comments: row.get(7)?,
                    tag: row.get(8)?,
                    contexts: row.get(9)?,
                    labels: row.get(10)?,
                    deployment_id: row.get(11)?,
                    engine_version: row.get(12)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(LedgerRow::into_entry).collect()
    }

    fn insert_entry(&mut self, table: &str, entry: &LedgerEntry) -> Result<(), BackendError> {
        insert_entry(&self.conn, table, entry)
    }

    fn set_tag(&mut self, table: &str, id: &ChangesetId, tag: &str) -> Result<(), BackendError> {
        self.conn.execute(
            &format!(
                "UPDATE {} SET tag = ?1 WHERE id = ?2 AND author = ?3 AND filename = ?4",
                table
            ),
            params![tag, id.id, id.author, id.path],
        )?;
        Ok(())
    }

    fn init_lock(&mut self, table: &str) -> Result<(), BackendError> {
        self.conn.execute(
            &format!("INSERT OR IGNORE INTO {} (id, locked) VALUES (1, 0)", table),
            [],
        )?;
        Ok(())
    }

    fn try_lock(
        &mut self,
        table: &str,
        locked_by: &str,
        granted: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET locked = 1, lock_granted = ?1, locked_by = ?2 WHERE id = 1 AND locked = 0",
                table
            ),
            params![granted.to_rfc3339(), locked_by],
        )?;
        Ok(changed == 1)
    }

    fn lock_status(&mut self, table: &str) -> Result<Option<LockStatus>, BackendError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT locked, lock_granted, locked_by FROM {} WHERE id = 1",
                    table
                ),
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? != 0,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(locked, granted, locked_by)| LockStatus {
            locked,
            granted: parse_lock_granted(granted),
            locked_by,
        }))
    }

    fn unlock(&mut self, table: &str) -> Result<(), BackendError> {
        self.conn.execute(
            &format!(
                "UPDATE {} SET locked = 0, lock_granted = NULL, locked_by = NULL WHERE id = 1",
                table
            ),
            [],
        )?;
        Ok(())
    }

    fn begin(&mut self) -> Result<Box<dyn BackendTransaction + '_>, BackendError> {
        Ok(Box::new(SqliteTransaction {
            tx: self.conn.transaction()?,
        }))
    }
}

struct SqliteTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl BackendTransaction for SqliteTransaction<'_> {
    fn execute(&mut self, sql: &str) -> Result<(), BackendError> {
        self.tx.execute_batch(sql)?;
        Ok(())
    }

    fn insert_entry(&mut self, table: &str, entry: &LedgerEntry) -> Result<(), BackendError> {
        insert_entry(&self.tx, table, entry)
    }

    fn delete_entry(&mut self, table: &str, id: &ChangesetId) -> Result<(), BackendError> {
        self.tx.execute(
            &format!(
                "DELETE FROM {} WHERE id = ?1 AND author = ?2 AND filename = ?3",
                table
            ),
            params![id.id, id.author, id.path],
        )?;
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), BackendError> {
        self.tx.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), BackendError> {
        self.tx.rollback()?;
        Ok(())
    }
}

fn insert_entry(conn: &Connection, table: &str, entry: &LedgerEntry) -> Result<(), BackendError> {
    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            table, LEDGER_COLUMNS
        ),
        params![
            entry.id.id,
            entry.id.author,
            entry.id.path,
            entry.applied_at.to_rfc3339(),
            entry.order_executed,
            entry.exec_type.as_str(),
            entry.checksum,
            entry.comments,
            entry.tag,
            entry.contexts,
            entry.labels,
            entry.deployment_id,
            entry.engine_version,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecType;

    const LEDGER: &str = "ledger";
    const LOCK: &str = "lock";

    fn backend() -> SqliteBackend {
        let mut backend = SqliteBackend::new(Connection::open_in_memory().unwrap());
        backend
            .execute(&Dialect::Sqlite.ledger_table_ddl(LEDGER))
            .unwrap();
        backend.execute(&Dialect::Sqlite.lock_table_ddl(LOCK)).unwrap();
        backend
    }

    fn entry(id: &str, order: i64) -> LedgerEntry {
        LedgerEntry {
            id: ChangesetId::new(id, "alice", "changelog.sql"),
            checksum: format!("checksum-{}", id),
            applied_at: Utc::now(),
            order_executed: order,
            exec_type: ExecType::Executed,
            tag: None,
            comments: Some("a comment".into()),
            contexts: None,
            labels: Some("base".into()),
            deployment_id: "0000000001".into(),
            engine_version: "test".into(),
        }
    }

    #[test]
    fn url_forms() {
        assert_eq!(database_path("sqlite::memory:").unwrap(), None);
        assert_eq!(database_path("sqlite://:memory:").unwrap(), None);
        assert_eq!(database_path("sqlite://app.db").unwrap(), Some("app.db"));
        assert_eq!(database_path("sqlite:app.db").unwrap(), Some("app.db"));
        assert_eq!(
            database_path("sqlite:///var/db/app.db").unwrap(),
            Some("/var/db/app.db")
        );
        assert!(database_path("postgres://x").is_err());
    }

    #[test]
    fn opens_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("app.db").display());
        let mut backend = SqliteBackend::open(&ConnectOptions::new(url)).unwrap();
        backend.execute("CREATE TABLE t (id INTEGER)").unwrap();
        assert!(backend.table_exists("t").unwrap());
        assert!(!backend.table_exists("missing").unwrap());
    }

    #[test]
    fn entries_round_trip_in_order() {
        let mut backend = backend();
        backend.insert_entry(LEDGER, &entry("2", 2)).unwrap();
        backend.insert_entry(LEDGER, &entry("1", 1)).unwrap();
        let entries = backend.select_entries(LEDGER).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id.id, "1");
        assert_eq!(entries[1].id.id, "2");
        assert_eq!(entries[0].comments.as_deref(), Some("a comment"));
        assert_eq!(entries[0].exec_type, ExecType::Executed);
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut backend = backend();
        backend.insert_entry(LEDGER, &entry("1", 1)).unwrap();
        assert!(backend.insert_entry(LEDGER, &entry("1", 2)).is_err());
    }

    #[test]
    fn set_tag_updates_one_row() {
        let mut backend = backend();
        backend.insert_entry(LEDGER, &entry("1", 1)).unwrap();
        backend.insert_entry(LEDGER, &entry("2", 2)).unwrap();
        backend
            .set_tag(LEDGER, &ChangesetId::new("2", "alice", "changelog.sql"), "v1")
            .unwrap();
        let entries = backend.select_entries(LEDGER).unwrap();
        assert_eq!(entries[0].tag, None);
        assert_eq!(entries[1].tag.as_deref(), Some("v1"));
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let mut backend = backend();
        {
            let mut tx = backend.begin().unwrap();
            tx.execute("CREATE TABLE t (id INTEGER)").unwrap();
            tx.insert_entry(LEDGER, &entry("1", 1)).unwrap();
        }
        assert!(!backend.table_exists("t").unwrap());
        assert!(backend.select_entries(LEDGER).unwrap().is_empty());
    }

    #[test]
    fn committed_transaction_persists() {
        let mut backend = backend();
        let mut tx = backend.begin().unwrap();
        tx.execute("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        tx.insert_entry(LEDGER, &entry("1", 1)).unwrap();
        tx.commit().unwrap();
        assert!(backend.table_exists("t").unwrap());

        let mut tx = backend.begin().unwrap();
        tx.delete_entry(LEDGER, &ChangesetId::new("1", "alice", "changelog.sql"))
            .unwrap();
        tx.commit().unwrap();
        assert!(backend.select_entries(LEDGER).unwrap().is_empty());
    }

    #[test]
    fn lock_is_exclusive_until_unlocked() {
        let mut backend = backend();
        backend.init_lock(LOCK).unwrap();
        backend.init_lock(LOCK).unwrap();

        let status = backend.lock_status(LOCK).unwrap().unwrap();
        assert!(!status.locked);

        assert!(backend.try_lock(LOCK, "first", Utc::now()).unwrap());
        assert!(!backend.try_lock(LOCK, "second", Utc::now()).unwrap());
        let status = backend.lock_status(LOCK).unwrap().unwrap();
        assert!(status.locked);
        assert_eq!(status.locked_by.as_deref(), Some("first"));
        assert!(status.granted.is_some());

        backend.unlock(LOCK).unwrap();
        assert!(backend.try_lock(LOCK, "second", Utc::now()).unwrap());
    }

    #[test]
    fn lock_status_without_row() {
        let mut backend = backend();
        assert_eq!(backend.lock_status(LOCK).unwrap(), None);
    }
}
