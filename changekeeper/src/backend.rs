//! Database backends.
//!
//! A [`Backend`] is one open connection plus the handful of ledger and lock queries the
//! engine needs, written in the backend's SQL dialect. Backends are found through an
//! explicit [`BackendRegistry`] keyed by URL scheme:
//!
//! | scheme | backend | feature |
//! |--------|---------|---------|
//! | `sqlite` | [`SqliteBackend`](crate::sqlite::SqliteBackend) | `sqlite` |
//! | `postgres`, `postgresql` | [`PostgresBackend`](crate::postgres::PostgresBackend) | `postgres` |
//!
//! Cloud Spanner databases using the PostgreSQL dialect are reached through PGAdapter with a
//! `postgres://` URL.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::{ChangesetId, LedgerEntry, LockStatus};
use crate::error::{BackendError, Error};

/// The SQL flavour a backend speaks. Decides the DDL of the ledger and lock tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn ledger_table_ddl(&self, table: &str) -> String {
        let (text, integer) = match self {
            Dialect::Sqlite => ("TEXT", "INTEGER"),
            Dialect::Postgres => ("VARCHAR", "BIGINT"),
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id {text} NOT NULL,
                author {text} NOT NULL,
                filename {text} NOT NULL,
                applied_at {text} NOT NULL,
                order_executed {integer} NOT NULL,
                exec_type {text} NOT NULL,
                checksum {text} NOT NULL,
                comments {text},
                tag {text},
                contexts {text},
                labels {text},
                deployment_id {text} NOT NULL,
                engine_version {text} NOT NULL,
                PRIMARY KEY (id, author, filename)
            )"
        )
    }

    pub fn lock_table_ddl(&self, table: &str) -> String {
        let (text, integer, boolean) = match self {
            Dialect::Sqlite => ("TEXT", "INTEGER", "INTEGER"),
            Dialect::Postgres => ("VARCHAR", "BIGINT", "BOOLEAN"),
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id {integer} NOT NULL PRIMARY KEY,
                locked {boolean} NOT NULL,
                lock_granted {text},
                locked_by {text}
            )"
        )
    }
}

/// A single open database connection.
///
/// All methods are plain queries; deciding when to call them (bootstrapping, locking,
/// ordering) is the job of the ledger, lock and executor.
pub trait Backend: Send {
    /// Short name for logs, eg `"sqlite"`.
    fn name(&self) -> &'static str;

    fn dialect(&self) -> Dialect;

    fn table_exists(&mut self, table: &str) -> Result<bool, BackendError>;

    /// Run one or more statements outside of a transaction.
    fn execute(&mut self, sql: &str) -> Result<(), BackendError>;

    /// All ledger rows, ordered by `order_executed`.
    fn select_entries(&mut self, table: &str) -> Result<Vec<LedgerEntry>, BackendError>;

    fn insert_entry(&mut self, table: &str, entry: &LedgerEntry) -> Result<(), BackendError>;

    fn set_tag(&mut self, table: &str, id: &ChangesetId, tag: &str) -> Result<(), BackendError>;

    /// Insert the single lock row unless it exists.
    fn init_lock(&mut self, table: &str) -> Result<(), BackendError>;

    /// Take the lock if it is free. Returns whether this call took it.
    fn try_lock(
        &mut self,
        table: &str,
        locked_by: &str,
        granted: DateTime<Utc>,
    ) -> Result<bool, BackendError>;

    fn lock_status(&mut self, table: &str) -> Result<Option<LockStatus>, BackendError>;

    fn unlock(&mut self, table: &str) -> Result<(), BackendError>;

    /// Start a transaction. Dropping it without calling `commit` rolls it back.
    fn begin(&mut self) -> Result<Box<dyn BackendTransaction + '_>, BackendError>;
}

/// An open transaction on a [`Backend`].
pub trait BackendTransaction {
    fn execute(&mut self, sql: &str) -> Result<(), BackendError>;

    fn insert_entry(&mut self, table: &str, entry: &LedgerEntry) -> Result<(), BackendError>;

    fn delete_entry(&mut self, table: &str, id: &ChangesetId) -> Result<(), BackendError>;

    fn commit(self: Box<Self>) -> Result<(), BackendError>;

    fn rollback(self: Box<Self>) -> Result<(), BackendError>;
}

/// A ledger row as read from the database, before its text columns are parsed.
pub(crate) struct LedgerRow {
    pub id: String,
    pub author: String,
    pub filename: String,
    pub applied_at: String,
    pub order_executed: i64,
    pub exec_type: String,
    pub checksum: String,
    pub comments: Option<String>,
    pub tag: Option<String>,
    pub contexts: Option<String>,
    pub labels: Option<String>,
    pub deployment_id: String,
    pub engine_version: String,
}

/// Columns in the order `LedgerRow` and the insert statements expect them.
pub(crate) const LEDGER_COLUMNS: &str = "id, author, filename, applied_at, order_executed, exec_type, checksum, comments, tag, contexts, labels, deployment_id, engine_version";

impl LedgerRow {
    pub fn into_entry(self) -> Result<LedgerEntry, BackendError> {
        let applied_at = DateTime::parse_from_rfc3339(&self.applied_at)
            .map_err(|e| {
                BackendError::Generic(format!(
                    "failed to parse applied_at '{}' of {}:{}: {}",
                    self.applied_at, self.author, self.id, e
                ))
            })?
            .with_timezone(&Utc);
        Ok(LedgerEntry {
            id: ChangesetId::new(self.id, self.author, self.filename),
            checksum: self.checksum,
            applied_at,
            order_executed: self.order_executed,
            exec_type: self.exec_type.parse()?,
            tag: self.tag,
            comments: self.comments,
            contexts: self.contexts,
            labels: self.labels,
            deployment_id: self.deployment_id,
            engine_version: self.engine_version,
        })
    }
}

pub(crate) fn parse_lock_granted(granted: Option<String>) -> Option<DateTime<Utc>> {
    granted
        .and_then(|g| DateTime::parse_from_rfc3339(&g).ok())
        .map(|g| g.with_timezone(&Utc))
}

/// Username and password merged into a connection, read from a JSON file:
///
/// ```json
/// { "username": "migrator", "password": "s3cret" }
/// ```
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|e| {
            Error::InvalidConfig(format!(
                "credentials file {} is not valid: {}",
                path.display(),
                e
            ))
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to open a [`Backend`].
///
/// Each changeset runs in one transaction together with its ledger row. Cloud Spanner
/// through PGAdapter refuses DDL inside such a transaction in its default DDL transaction
/// mode. The modes that accept it commit the DDL on its own, so a changeset mixing DDL with
/// DML or failing halfway is no longer atomic there. Keep each Spanner changeset to a single
/// DDL statement, or to DML only.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub credentials: Option<Credentials>,
    /// SQLite busy timeout, PostgreSQL connect timeout.
    pub timeout: Duration,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The URL scheme, eg `sqlite` for both `sqlite://app.db` and `sqlite::memory:`.
    pub fn scheme(&self) -> &str {
        self.url
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .unwrap_or(self.url.as_str())
    }
}

/// Opens a backend for a URL.
pub type BackendFactory = fn(&ConnectOptions) -> Result<Box<dyn Backend>, Error>;

/// Maps URL schemes to backend constructors. Nothing is discovered implicitly: a backend is
/// available only once it is registered.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// A registry with no backends.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with every backend compiled into this build.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "sqlite")]
        {
            registry = registry.register("sqlite", crate::sqlite::SqliteBackend::connect);
        }
        #[cfg(feature = "postgres")]
        {
            registry = registry
                .register("postgres", crate::postgres::PostgresBackend::connect)
                .register("postgresql", crate::postgres::PostgresBackend::connect);
        }
        registry
    }

    pub fn register(mut self, scheme: impl Into<String>, factory: BackendFactory) -> Self {
        self.factories
            .insert(scheme.into().to_ascii_lowercase(), factory);
        self
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn Backend>, Error> {
        let scheme = options.scheme().to_ascii_lowercase();
        let factory = self
            .factories
            .get(&scheme)
            .ok_or_else(|| Error::UnknownBackend(scheme.clone()))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(scheme = %scheme, "Connecting to database");

        factory(options)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Table names are spliced into SQL, so only plain identifiers are accepted.
pub(crate) fn validate_table_name(name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "'{}' is not a valid table name",
            name
        )))
    }
}
