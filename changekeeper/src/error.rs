use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ChangesetId;

/// Error raised by a database driver.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Generic(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for BackendError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<String> for BackendError {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

// Manual PartialEq implementation because postgres::Error doesn't implement PartialEq
impl PartialEq for BackendError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            #[cfg(feature = "sqlite")]
            (Self::Rusqlite(a), Self::Rusqlite(b)) => a == b,
            #[cfg(feature = "postgres")]
            (Self::Postgres(a), Self::Postgres(b)) => a.to_string() == b.to_string(),
            (Self::Generic(a), Self::Generic(b)) => a == b,
            _ => false,
        }
    }
}

/// Error type for the changekeeper crate.
///
/// Every variant aborts the current run. Nothing is retried internally: rerunning
/// the whole command is safe because applied changesets are skipped.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The changelog is malformed.
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An applied changeset was edited after it was applied.
    #[error(
        "changeset {id} was modified after it was applied: recorded checksum '{recorded}', current checksum '{current}'"
    )]
    DriftDetected {
        id: ChangesetId,
        recorded: String,
        current: String,
    },

    /// A statement failed. `applied` counts the changesets committed before this one.
    #[error("changeset {id} failed ({applied} changeset(s) applied before the failure): {source}")]
    ExecutionFailed {
        id: ChangesetId,
        applied: usize,
        #[source]
        source: BackendError,
    },

    /// The ledger or lock table could not be created or read.
    #[error("ledger storage unavailable while trying to {context}: {source}")]
    StorageUnavailable {
        context: String,
        #[source]
        source: BackendError,
    },

    #[error("unknown ledger position: {0}")]
    UnknownPosition(String),

    #[error("tag '{0}' already exists in the ledger")]
    DuplicateTag(String),

    #[error("cannot roll back changeset {id}: {reason}")]
    RollbackUnavailable { id: ChangesetId, reason: String },

    #[error(
        "could not acquire the changelog lock after {waited:?}: held by {} since {}",
        locked_by.as_deref().unwrap_or("<unknown>"),
        granted.map(|g| g.to_rfc3339()).unwrap_or_else(|| "<unknown>".to_string())
    )]
    LockUnavailable {
        locked_by: Option<String>,
        granted: Option<DateTime<Utc>>,
        waited: Duration,
    },

    #[error("run cancelled after {applied} changeset(s) were processed")]
    Cancelled { applied: usize },

    #[error("no backend registered for '{0}'")]
    UnknownBackend(String),

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: BackendError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn storage(context: impl Into<String>, source: impl Into<BackendError>) -> Self {
        Self::StorageUnavailable {
            context: context.into(),
            source: source.into(),
        }
    }
}
