//! Testing utilities for changelog development

pub mod sqlite;

/// Error returned by the test harnesses.
#[derive(thiserror::Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Changekeeper(#[from] crate::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// An `assert_*` helper found the database in an unexpected state.
    #[error("{0}")]
    Assertion(String),
}
