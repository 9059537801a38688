#![cfg_attr(docsrs, feature(doc_cfg))]
//! `changekeeper` applies a declarative SQL changelog to a database and keeps a ledger of
//! what it applied.
//!
//! Core concepts:
//! - A [`Changelog`] is an ordered list of changesets, each identified by
//!   `(id, author, changelog path)` and checksummed.
//! - The ledger table records every applied changeset with its checksum. Editing a changeset
//!   after it was applied is detected as drift and stops the run.
//! - Each changeset runs in its own transaction together with its ledger row, so a database
//!   is always at a changeset boundary.
//! - Runs are serialized by a lock row, can be filtered by labels and contexts, and can tag
//!   the ledger so it can later be rolled back to that point.
//!
//! # Example
//!
//! ```
//! # #[cfg(not(feature = "sqlite"))]
//! # fn main() {}
//! # #[cfg(feature = "sqlite")]
//! # fn main() {
//! use changekeeper::{BackendRegistry, Changelog, ConnectOptions, Migrator, UpdateOptions};
//!
//! let changelog = Changelog::parse(
//!     "--liquibase formatted sql\n\
//!      --changeset alice:1 labels:base\n\
//!      CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT);\n\
//!      --rollback DROP TABLE person;\n\
//!      --changeset alice:2 labels:base\n\
//!      INSERT INTO person (id, name) VALUES (1, 'Ada');\n\
//!      --rollback DELETE FROM person WHERE id = 1;\n",
//!     "db/changelog.sql",
//! )
//! .unwrap();
//!
//! let mut backend = BackendRegistry::with_defaults()
//!     .connect(&ConnectOptions::new("sqlite::memory:"))
//!     .unwrap();
//!
//! let migrator = Migrator::new(changelog);
//! let report = migrator
//!     .update(backend.as_mut(), &UpdateOptions::default().with_tag("v1"))
//!     .unwrap();
//! assert_eq!(report.applied.len(), 2);
//!
//! // a second run finds nothing to do
//! let report = migrator
//!     .update(backend.as_mut(), &UpdateOptions::default())
//!     .unwrap();
//! assert!(report.applied.is_empty());
//! assert_eq!(report.already_applied, 2);
//! # }
//! ```
//!
//! # Features
//! - Observability hooks on [`Migrator`].
//! - Tracing integration - available with the `tracing` feature flag (on by default).
//! - Testing utilities - available with the `testing` feature flag.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag.
//! - [`PostgreSQL`](postgres), including Cloud Spanner through PGAdapter - available with
//!   the `postgres` feature flag.

mod core;
pub use core::{
    calculate_checksum, Changeset, ChangesetId, ExecType, LedgerEntry, LockStatus, Rollback,
    RollbackReport, UpdateReport,
};

mod error;
pub use error::{BackendError, Error};

mod expression;
pub use expression::Expression;

pub mod changelog;
pub use changelog::Changelog;

pub mod backend;
pub use backend::{Backend, BackendRegistry, ConnectOptions, Credentials, Dialect};

pub mod ledger;
pub mod lock;

pub mod planner;
pub use planner::{Filter, Plan};

pub mod executor;

mod migrator;
pub use migrator::{Migrator, UpdateOptions};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(feature = "testing")]
pub mod testing;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
