use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::BackendError;
use crate::expression::Expression;

/// Version string written into every ledger row.
pub(crate) const ENGINE_VERSION: &str = concat!("changekeeper/", env!("CARGO_PKG_VERSION"));

/// Author recorded on tag marker rows.
pub(crate) const TAG_MARKER_AUTHOR: &str = "changekeeper";

/// Filename recorded on tag marker rows.
pub(crate) const TAG_MARKER_FILENAME: &str = "changekeeper:tag";

pub(crate) const DEFAULT_LEDGER_TABLE_NAME: &str = "changekeeper_ledger";
pub(crate) const DEFAULT_LOCK_TABLE_NAME: &str = "changekeeper_lock";

/// Identity of a changeset: `(id, author, changelog path)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangesetId {
    pub id: String,
    pub author: String,
    pub path: String,
}

impl ChangesetId {
    pub fn new(id: impl Into<String>, author: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.path, self.id, self.author)
    }
}

/// Rollback SQL declared for a changeset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rollback {
    /// Whether the changelog declared a rollback at all (`--rollback not required` declares an empty one).
    pub declared: bool,
    pub statements: Vec<String>,
}

/// A parsed, checksummed unit of forward and rollback SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    pub id: ChangesetId,
    pub checksum: String,
    pub statements: Vec<String>,
    pub rollback: Rollback,
    pub labels: BTreeSet<String>,
    pub context: Option<Expression>,
    pub comment: Option<String>,
    /// Line of the `--changeset` header in the changelog.
    pub line: usize,
}

impl Changeset {
    /// Labels joined the way they are stored in the ledger.
    pub fn labels_column(&self) -> Option<String> {
        if self.labels.is_empty() {
            None
        } else {
            Some(self.labels.iter().cloned().collect::<Vec<_>>().join(","))
        }
    }
}

/// How a ledger row came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecType {
    /// The changeset's statements ran.
    Executed,
    /// The changeset was recorded without running (changelog sync).
    MarkRan,
    /// Not a changeset: a tag marker appended because the newest row was already tagged.
    Tag,
}

impl ExecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecType::Executed => "EXECUTED",
            ExecType::MarkRan => "MARK_RAN",
            ExecType::Tag => "TAG",
        }
    }
}

impl fmt::Display for ExecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecType {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXECUTED" => Ok(ExecType::Executed),
            "MARK_RAN" => Ok(ExecType::MarkRan),
            "TAG" => Ok(ExecType::Tag),
            other => Err(BackendError::Generic(format!(
                "unknown exec_type '{}' in ledger",
                other
            ))),
        }
    }
}

/// One row of the ledger table.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub id: ChangesetId,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub order_executed: i64,
    pub exec_type: ExecType,
    pub tag: Option<String>,
    pub comments: Option<String>,
    pub contexts: Option<String>,
    pub labels: Option<String>,
    pub deployment_id: String,
    pub engine_version: String,
}

impl LedgerEntry {
    pub fn is_tag_marker(&self) -> bool {
        self.exec_type == ExecType::Tag
    }
}

/// State of the changelog lock row.
#[derive(Debug, Clone, PartialEq)]
pub struct LockStatus {
    pub locked: bool,
    pub granted: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

/// A report of an `update` run.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    pub ledger_existed: bool,
    pub deployment_id: String,
    /// Changesets applied by this run, in order.
    pub applied: Vec<ChangesetId>,
    /// Changesets that were already in the ledger.
    pub already_applied: usize,
    /// Pending changesets excluded by the label or context filter.
    pub filtered_out: Vec<ChangesetId>,
    pub tag: Option<String>,
}

/// A report of a rollback-to-tag run.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackReport {
    pub tag: String,
    /// Ledger entries removed, newest first.
    pub rolled_back: Vec<ChangesetId>,
}

/// Callbacks fired as changesets are processed.
#[derive(Default)]
pub(crate) struct Hooks {
    pub on_changeset_start: Option<Box<dyn Fn(&ChangesetId) + Send + Sync>>,
    pub on_changeset_complete: Option<Box<dyn Fn(&ChangesetId, Duration) + Send + Sync>>,
    pub on_changeset_skipped: Option<Box<dyn Fn(&ChangesetId) + Send + Sync>>,
    pub on_changeset_error: Option<Box<dyn Fn(&ChangesetId, &BackendError) + Send + Sync>>,
}

impl Hooks {
    pub fn start(&self, id: &ChangesetId) {
        if let Some(ref callback) = self.on_changeset_start {
            callback(id);
        }
    }

    pub fn complete(&self, id: &ChangesetId, duration: Duration) {
        if let Some(ref callback) = self.on_changeset_complete {
            callback(id, duration);
        }
    }

    pub fn skipped(&self, id: &ChangesetId) {
        if let Some(ref callback) = self.on_changeset_skipped {
            callback(id);
        }
    }

    pub fn error(&self, id: &ChangesetId, error: &BackendError) {
        if let Some(ref callback) = self.on_changeset_error {
            callback(id, error);
        }
    }
}

// Manual Debug impl since closures don't implement Debug
impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_changeset_start", &self.on_changeset_start.is_some())
            .field("on_changeset_complete", &self.on_changeset_complete.is_some())
            .field("on_changeset_skipped", &self.on_changeset_skipped.is_some())
            .field("on_changeset_error", &self.on_changeset_error.is_some())
            .finish()
    }
}

/// Calculate the checksum of a changeset's forward statements.
///
/// Whitespace runs are collapsed before hashing, so reformatting a statement does not
/// count as drift. Rollback SQL is not part of the checksum.
pub fn calculate_checksum<S: AsRef<str>>(statements: &[S]) -> String {
    let mut hasher = Sha256::new();
    for (i, statement) in statements.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        let normalized = statement
            .as_ref()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        hasher.update(normalized.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Identifier shared by every ledger row written in one run.
pub(crate) fn new_deployment_id(now: DateTime<Utc>) -> String {
    format!("{:010}", now.timestamp_millis().rem_euclid(10_000_000_000))
}
