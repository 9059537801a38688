//! The ledger table: one row per applied changeset, plus tag markers.

use chrono::Utc;

use crate::backend::{Backend, BackendTransaction};
use crate::core::{
    ChangesetId, ExecType, LedgerEntry, ENGINE_VERSION, TAG_MARKER_AUTHOR, TAG_MARKER_FILENAME,
};
use crate::error::{BackendError, Error};

#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    pub(crate) fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table if it is missing. Returns whether it already existed.
    pub fn ensure(&self, backend: &mut dyn Backend) -> Result<bool, Error> {
        let existed = backend
            .table_exists(&self.table)
            .map_err(|e| Error::storage("check for the ledger table", e))?;
        if !existed {
            #[cfg(feature = "tracing")]
            tracing::info!(table = %self.table, "Creating ledger table");

            let ddl = backend.dialect().ledger_table_ddl(&self.table);
            backend
                .execute(&ddl)
                .map_err(|e| Error::storage("create the ledger table", e))?;
        }
        Ok(existed)
    }

    /// Every row, oldest first. Creates the table on first use.
    pub fn load_applied(&self, backend: &mut dyn Backend) -> Result<Vec<LedgerEntry>, Error> {
        self.ensure(backend)?;
        self.select(backend)
    }

    /// Every row, oldest first, without creating anything. A missing table reads as empty.
    pub fn read(&self, backend: &mut dyn Backend) -> Result<Vec<LedgerEntry>, Error> {
        let exists = backend
            .table_exists(&self.table)
            .map_err(|e| Error::storage("check for the ledger table", e))?;
        if !exists {
            return Ok(vec![]);
        }
        self.select(backend)
    }

    fn select(&self, backend: &mut dyn Backend) -> Result<Vec<LedgerEntry>, Error> {
        backend
            .select_entries(&self.table)
            .map_err(|e| Error::storage("read the ledger", e))
    }

    /// Append `entry` as part of the changeset's transaction.
    pub fn record(
        &self,
        tx: &mut dyn BackendTransaction,
        entry: &LedgerEntry,
    ) -> Result<(), BackendError> {
        tx.insert_entry(&self.table, entry)
    }

    /// Remove the row for `id` as part of a rollback transaction.
    pub fn remove(
        &self,
        tx: &mut dyn BackendTransaction,
        id: &ChangesetId,
    ) -> Result<(), BackendError> {
        tx.delete_entry(&self.table, id)
    }

    /// Mark the current end of the ledger with `name`.
    ///
    /// The newest row takes the tag when it has none; otherwise a `TAG` marker row is
    /// appended so the existing tag is never changed.
    pub fn tag(
        &self,
        backend: &mut dyn Backend,
        name: &str,
        deployment_id: &str,
    ) -> Result<(), Error> {
        let entries = self.load_applied(backend)?;
        if entries.iter().any(|e| e.tag.as_deref() == Some(name)) {
            return Err(Error::DuplicateTag(name.to_string()));
        }
        let Some(newest) = entries.last() else {
            return Err(Error::UnknownPosition(format!(
                "cannot tag '{}': the ledger is empty",
                name
            )));
        };

        if newest.tag.is_none() {
            backend
                .set_tag(&self.table, &newest.id, name)
                .map_err(|e| Error::storage("write the tag", e))?;
        } else {
            let marker = LedgerEntry {
                id: ChangesetId::new(name, TAG_MARKER_AUTHOR, TAG_MARKER_FILENAME),
                checksum: String::new(),
                applied_at: Utc::now(),
                order_executed: next_order(&entries),
                exec_type: ExecType::Tag,
                tag: Some(name.to_string()),
                comments: None,
                contexts: None,
                labels: None,
                deployment_id: deployment_id.to_string(),
                engine_version: ENGINE_VERSION.to_string(),
            };
            backend
                .insert_entry(&self.table, &marker)
                .map_err(|e| Error::storage("write the tag", e))?;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(tag = %name, at = %newest.id, "Tagged ledger");

        Ok(())
    }

    /// Rows newer than the row carrying `tag`, oldest first.
    pub fn entries_after_tag(
        &self,
        backend: &mut dyn Backend,
        tag: &str,
    ) -> Result<Vec<LedgerEntry>, Error> {
        let mut entries = self.read(backend)?;
        let position = entries
            .iter()
            .position(|e| e.tag.as_deref() == Some(tag))
            .ok_or_else(|| Error::UnknownPosition(format!("tag '{}' is not in the ledger", tag)))?;
        Ok(entries.split_off(position + 1))
    }
}

/// The order index the next row should take.
pub(crate) fn next_order(entries: &[LedgerEntry]) -> i64 {
    entries
        .iter()
        .map(|e| e.order_executed)
        .max()
        .map_or(1, |max| max + 1)
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::sqlite::SqliteBackend;
    use rusqlite::Connection;

    fn backend() -> SqliteBackend {
        SqliteBackend::new(Connection::open_in_memory().unwrap())
    }

    fn entry(id: &str, order: i64) -> LedgerEntry {
        LedgerEntry {
            id: ChangesetId::new(id, "alice", "changelog.sql"),
            checksum: "abc".into(),
            applied_at: Utc::now(),
            order_executed: order,
            exec_type: ExecType::Executed,
            tag: None,
            comments: None,
            contexts: None,
            labels: None,
            deployment_id: "0000000001".into(),
            engine_version: ENGINE_VERSION.into(),
        }
    }

    fn record(ledger: &Ledger, backend: &mut SqliteBackend, entry: &LedgerEntry) {
        let mut tx = backend.begin().unwrap();
        ledger.record(tx.as_mut(), entry).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn load_applied_bootstraps_table() {
        let ledger = Ledger::new("ledger");
        let mut backend = backend();
        assert!(!backend.table_exists("ledger").unwrap());
        assert!(ledger.load_applied(&mut backend).unwrap().is_empty());
        assert!(backend.table_exists("ledger").unwrap());
        assert!(ledger.ensure(&mut backend).unwrap());
    }

    #[test]
    fn read_does_not_create_table() {
        let ledger = Ledger::new("ledger");
        let mut backend = backend();
        assert!(ledger.read(&mut backend).unwrap().is_empty());
        assert!(!backend.table_exists("ledger").unwrap());
    }

    #[test]
    fn unreadable_table_is_storage_unavailable() {
        let ledger = Ledger::new("ledger");
        let mut backend = backend();
        backend.execute("CREATE TABLE ledger (x INTEGER)").unwrap();
        assert!(matches!(
            ledger.load_applied(&mut backend),
            Err(Error::StorageUnavailable { .. })
        ));
    }

    #[test]
    fn tag_on_empty_ledger_is_unknown_position() {
        let ledger = Ledger::new("ledger");
        let mut backend = backend();
        assert!(matches!(
            ledger.tag(&mut backend, "v1", "1"),
            Err(Error::UnknownPosition(_))
        ));
    }

    #[test]
    fn tag_sets_newest_row_then_appends_marker() {
        let ledger = Ledger::new("ledger");
        let mut backend = backend();
        ledger.ensure(&mut backend).unwrap();
        record(&ledger, &mut backend, &entry("1", 1));
        record(&ledger, &mut backend, &entry("2", 2));

        ledger.tag(&mut backend, "v1", "1").unwrap();
        ledger.tag(&mut backend, "v2", "1").unwrap();

        let entries = ledger.read(&mut backend).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].tag.as_deref(), Some("v1"));
        assert!(entries[2].is_tag_marker());
        assert_eq!(entries[2].tag.as_deref(), Some("v2"));
        assert_eq!(entries[2].order_executed, 3);

        assert!(matches!(
            ledger.tag(&mut backend, "v1", "1"),
            Err(Error::DuplicateTag(ref t)) if t == "v1"
        ));
    }

    #[test]
    fn entries_after_tag() {
        let ledger = Ledger::new("ledger");
        let mut backend = backend();
        ledger.ensure(&mut backend).unwrap();
        record(&ledger, &mut backend, &entry("1", 1));
        ledger.tag(&mut backend, "v1", "1").unwrap();
        record(&ledger, &mut backend, &entry("2", 2));
        record(&ledger, &mut backend, &entry("3", 3));

        let after = ledger.entries_after_tag(&mut backend, "v1").unwrap();
        let ids: Vec<_> = after.iter().map(|e| e.id.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);

        assert!(matches!(
            ledger.entries_after_tag(&mut backend, "nope"),
            Err(Error::UnknownPosition(_))
        ));
    }

    #[test]
    fn remove_deletes_row() {
        let ledger = Ledger::new("ledger");
        let mut backend = backend();
        ledger.ensure(&mut backend).unwrap();
        record(&ledger, &mut backend, &entry("1", 1));

        let mut tx = backend.begin().unwrap();
        ledger
            .remove(tx.as_mut(), &ChangesetId::new("1", "alice", "changelog.sql"))
            .unwrap();
        tx.commit().unwrap();
        assert!(ledger.read(&mut backend).unwrap().is_empty());
    }

    #[test]
    fn next_order_follows_max() {
        assert_eq!(next_order(&[]), 1);
        assert_eq!(next_order(&[entry("1", 4), entry("2", 2)]), 5);
    }
}
