//! The changelog lock: a single row that serializes concurrent runs against one database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::backend::Backend;
use crate::core::LockStatus;
use crate::error::Error;

pub(crate) const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5 * 60);
pub(crate) const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ChangelogLock {
    table: String,
    wait: Duration,
    poll_interval: Duration,
    cancel: Option<Arc<AtomicBool>>,
}

impl ChangelogLock {
    pub(crate) fn new(table: impl Into<String>, wait: Duration, poll_interval: Duration) -> Self {
        Self {
            table: table.into(),
            wait,
            poll_interval,
            cancel: None,
        }
    }

    /// Stop waiting for a busy lock once `cancel` is set.
    pub(crate) fn with_cancel_flag(mut self, cancel: Option<Arc<AtomicBool>>) -> Self {
        self.cancel = cancel;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Sleep for `duration`, waking early when the run is cancelled.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || self.cancelled() {
                return;
            }
            std::thread::sleep(CANCEL_CHECK_INTERVAL.min(deadline - now));
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn ensure(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        let exists = backend
            .table_exists(&self.table)
            .map_err(|e| Error::storage("check for the lock table", e))?;
        if !exists {
            #[cfg(feature = "tracing")]
            tracing::info!(table = %self.table, "Creating lock table");

            let ddl = backend.dialect().lock_table_ddl(&self.table);
            backend
                .execute(&ddl)
                .map_err(|e| Error::storage("create the lock table", e))?;
        }
        backend
            .init_lock(&self.table)
            .map_err(|e| Error::storage("initialize the lock row", e))
    }

    /// Take the lock, polling until the configured wait has elapsed. Waiting on a busy lock
    /// ends with [`Error::Cancelled`] as soon as the cancel flag is set.
    pub fn acquire(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        self.ensure(backend)?;
        let holder = holder_name();
        let started = Instant::now();
        loop {
            let taken = backend
                .try_lock(&self.table, &holder, Utc::now())
                .map_err(|e| Error::storage("acquire the changelog lock", e))?;
            if taken {
                #[cfg(feature = "tracing")]
                tracing::debug!(holder = %holder, "Acquired changelog lock");
                return Ok(());
            }

            if self.cancelled() {
                #[cfg(feature = "tracing")]
                tracing::warn!("Cancelled while waiting for changelog lock");
                return Err(Error::Cancelled { applied: 0 });
            }

            let waited = started.elapsed();
            if waited >= self.wait {
                let status = backend
                    .lock_status(&self.table)
                    .map_err(|e| Error::storage("read the changelog lock", e))?;
                let (locked_by, granted) = status
                    .map(|s| (s.locked_by, s.granted))
                    .unwrap_or((None, None));
                return Err(Error::LockUnavailable {
                    locked_by,
                    granted,
                    waited,
                });
            }

            #[cfg(feature = "tracing")]
            tracing::info!(waited = ?waited, "Waiting for changelog lock");

            self.pause(self.poll_interval.min(self.wait - waited));
        }
    }

    pub fn release(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        backend
            .unlock(&self.table)
            .map_err(|e| Error::storage("release the changelog lock", e))?;

        #[cfg(feature = "tracing")]
        tracing::debug!("Released changelog lock");

        Ok(())
    }

    /// Run `f` while holding the lock. The lock is released whether `f` succeeds or not;
    /// a failure to release is returned only when `f` itself succeeded.
    pub fn with_lock<T, F>(&self, backend: &mut dyn Backend, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut dyn Backend) -> Result<T, Error>,
    {
        self.acquire(backend)?;
        let result = f(&mut *backend);
        if let Err(release_error) = self.release(backend) {
            match result {
                Ok(_) => return Err(release_error),
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %release_error, "Failed to release changelog lock");
                }
            }
        }
        result
    }

    /// The lock row, or `None` when no lock table exists yet.
    pub fn status(&self, backend: &mut dyn Backend) -> Result<Option<LockStatus>, Error> {
        let exists = backend
            .table_exists(&self.table)
            .map_err(|e| Error::storage("check for the lock table", e))?;
        if !exists {
            return Ok(None);
        }
        backend
            .lock_status(&self.table)
            .map_err(|e| Error::storage("read the changelog lock", e))
    }

    /// Clear the lock regardless of who holds it. Returns whether it was held.
    pub fn force_release(&self, backend: &mut dyn Backend) -> Result<bool, Error> {
        let held = self.status(backend)?.is_some_and(|s| s.locked);
        if held {
            #[cfg(feature = "tracing")]
            tracing::warn!(table = %self.table, "Forcibly releasing changelog lock");

            self.release(backend)?;
        }
        Ok(held)
    }
}

fn holder_name() -> String {
    format!("changekeeper (pid {})", std::process::id())
}
