use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::backend::{validate_table_name, Backend};
use crate::changelog::Changelog;
use crate::core::{
    new_deployment_id, Changeset, ChangesetId, Hooks, LedgerEntry, LockStatus, RollbackReport,
    UpdateReport, DEFAULT_LEDGER_TABLE_NAME, DEFAULT_LOCK_TABLE_NAME,
};
use crate::error::{BackendError, Error};
use crate::executor::Executor;
use crate::expression::Expression;
use crate::ledger::Ledger;
use crate::lock::{ChangelogLock, DEFAULT_LOCK_POLL_INTERVAL, DEFAULT_LOCK_WAIT};
use crate::planner::{self, Filter, Plan};

/// Options for [`Migrator::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub filter: Filter,
    /// Tag written after every pending changeset has been applied.
    pub tag: Option<String>,
}

impl UpdateOptions {
    pub fn with_labels(mut self, labels: Expression) -> Self {
        self.filter.labels = labels;
        self
    }

    pub fn with_contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.filter = self.filter.with_contexts(contexts);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// The entrypoint for running a changelog against a database.
///
/// Every operation that writes (`update`, `tag`, `rollback_to_tag`, `changelog_sync`) holds
/// the changelog lock for its whole duration.
#[derive(Debug)]
pub struct Migrator {
    changelog: Changelog,
    ledger_table_name: String,
    lock_table_name: String,
    lock_wait: Duration,
    lock_poll_interval: Duration,
    cancel: Option<Arc<AtomicBool>>,
    hooks: Hooks,
}

impl Migrator {
    pub fn new(changelog: Changelog) -> Self {
        Self {
            changelog,
            ledger_table_name: DEFAULT_LEDGER_TABLE_NAME.to_string(),
            lock_table_name: DEFAULT_LOCK_TABLE_NAME.to_string(),
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            cancel: None,
            hooks: Hooks::default(),
        }
    }

    /// Parse the changelog at `path` and build a migrator for it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(Self::new(Changelog::from_path(path)?))
    }

    /// Set a custom name for the ledger table.
    /// Defaults to "changekeeper_ledger".
    pub fn with_ledger_table_name(mut self, name: impl Into<String>) -> Self {
        self.ledger_table_name = name.into();
        self
    }

    /// Set a custom name for the lock table.
    /// Defaults to "changekeeper_lock".
    pub fn with_lock_table_name(mut self, name: impl Into<String>) -> Self {
        self.lock_table_name = name.into();
        self
    }

    /// How long to wait for a lock held by another run. Defaults to five minutes.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// How often to retry a held lock. Defaults to two seconds.
    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// A flag checked before each changeset. Once it is set the run stops with
    /// [`Error::Cancelled`], leaving already-committed changesets in place.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Set a callback to be invoked when a changeset starts (applying or rolling back).
    pub fn on_changeset_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangesetId) + Send + Sync + 'static,
    {
        self.hooks.on_changeset_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a changeset completes successfully.
    /// The callback receives the changeset identity and how long it took.
    pub fn on_changeset_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangesetId, Duration) + Send + Sync + 'static,
    {
        self.hooks.on_changeset_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a changeset is recorded without running
    /// (see [`Migrator::changelog_sync`]).
    pub fn on_changeset_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangesetId) + Send + Sync + 'static,
    {
        self.hooks.on_changeset_skipped = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a changeset fails.
    pub fn on_changeset_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangesetId, &BackendError) + Send + Sync + 'static,
    {
        self.hooks.on_changeset_error = Some(Box::new(callback));
        self
    }

    pub fn changelog(&self) -> &Changelog {
        &self.changelog
    }

    pub fn changesets(&self) -> &[Changeset] {
        self.changelog.changesets()
    }

    pub fn ledger_table_name(&self) -> &str {
        &self.ledger_table_name
    }

    pub fn lock_table_name(&self) -> &str {
        &self.lock_table_name
    }

    fn ledger(&self) -> Result<Ledger, Error> {
        validate_table_name(&self.ledger_table_name)?;
        Ok(Ledger::new(&self.ledger_table_name))
    }

    fn lock(&self) -> Result<ChangelogLock, Error> {
        validate_table_name(&self.lock_table_name)?;
        Ok(ChangelogLock::new(
            &self.lock_table_name,
            self.lock_wait,
            self.lock_poll_interval,
        )
        .with_cancel_flag(self.cancel.clone()))
    }

    fn executor<'a>(&'a self, ledger: &'a Ledger) -> Executor<'a> {
        Executor::new(ledger, &self.hooks).with_cancel_flag(self.cancel.as_deref())
    }

    /// Apply every pending changeset accepted by `options.filter`, in changelog order, then
    /// write `options.tag` if given.
    ///
    /// Applied changesets whose content changed fail the run with
    /// [`Error::DriftDetected`] before anything is executed.
    pub fn update(
        &self,
        backend: &mut dyn Backend,
        options: &UpdateOptions,
    ) -> Result<UpdateReport, Error> {
        let ledger = self.ledger()?;
        let lock = self.lock()?;

        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "update",
            changelog = %self.changelog.path(),
            backend = backend.name()
        )
        .entered();

        lock.with_lock(backend, |backend| {
            let ledger_existed = ledger.ensure(backend)?;
            let applied = ledger.load_applied(backend)?;
            if let Some(tag) = &options.tag {
                if applied.iter().any(|e| e.tag.as_deref() == Some(tag.as_str())) {
                    return Err(Error::DuplicateTag(tag.clone()));
                }
            }
            let plan = planner::plan(self.changesets(), &applied, &options.filter)?;

            #[cfg(feature = "tracing")]
            tracing::info!(
                pending = plan.pending.len(),
                already_applied = plan.already_applied,
                filtered_out = plan.filtered_out.len(),
                "Starting update"
            );

            let mut executor = self.executor(&ledger);
            let applied = executor.apply(backend, &plan, options.tag.as_deref())?;

            #[cfg(feature = "tracing")]
            tracing::info!(applied = applied.len(), "Update complete");

            Ok(UpdateReport {
                ledger_existed,
                deployment_id: executor.deployment_id().to_string(),
                applied,
                already_applied: plan.already_applied,
                filtered_out: plan.filtered_out,
                tag: options.tag.clone(),
            })
        })
    }

    /// Preview which changesets `update` would apply with `filter`, without running them
    /// or taking the lock. Drift fails the preview the same way it fails `update`.
    pub fn preview_update(
        &self,
        backend: &mut dyn Backend,
        filter: &Filter,
    ) -> Result<Plan<'_>, Error> {
        let applied = self.ledger()?.read(backend)?;
        planner::plan(self.changesets(), &applied, filter)
    }

    /// Check every applied changeset against the changelog without changing anything.
    pub fn validate(&self, backend: &mut dyn Backend) -> Result<(), Error> {
        let plan = self.preview_update(backend, &Filter::default())?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            already_applied = plan.already_applied,
            pending = plan.pending.len(),
            "Changelog is consistent with the ledger"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = plan;

        Ok(())
    }

    /// Tag the current end of the ledger.
    pub fn tag(&self, backend: &mut dyn Backend, name: &str) -> Result<(), Error> {
        let ledger = self.ledger()?;
        let lock = self.lock()?;
        let deployment_id = new_deployment_id(Utc::now());
        lock.with_lock(backend, |backend| ledger.tag(backend, name, &deployment_id))
    }

    /// Ledger entries `rollback_to_tag` would undo, newest first.
    pub fn preview_rollback(
        &self,
        backend: &mut dyn Backend,
        tag: &str,
    ) -> Result<Vec<LedgerEntry>, Error> {
        let mut entries = self.ledger()?.entries_after_tag(backend, tag)?;
        entries.reverse();
        Ok(entries)
    }

    /// Undo every changeset applied after `tag`, newest first.
    pub fn rollback_to_tag(
        &self,
        backend: &mut dyn Backend,
        tag: &str,
    ) -> Result<RollbackReport, Error> {
        let ledger = self.ledger()?;
        let lock = self.lock()?;

        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("rollback", tag = %tag).entered();

        lock.with_lock(backend, |backend| {
            let entries = ledger.entries_after_tag(backend, tag)?;

            #[cfg(feature = "tracing")]
            tracing::info!(entries = entries.len(), "Rolling back to tag");

            let rolled_back = self
                .executor(&ledger)
                .roll_back(backend, &self.changelog, &entries)?;
            Ok(RollbackReport {
                tag: tag.to_string(),
                rolled_back,
            })
        })
    }

    /// Record pending changesets accepted by `filter` as applied without running them.
    /// Used to adopt a database whose schema was created some other way.
    pub fn changelog_sync(
        &self,
        backend: &mut dyn Backend,
        filter: &Filter,
    ) -> Result<Vec<ChangesetId>, Error> {
        let ledger = self.ledger()?;
        let lock = self.lock()?;
        lock.with_lock(backend, |backend| {
            let applied = ledger.load_applied(backend)?;
            let plan = planner::plan(self.changesets(), &applied, filter)?;
            self.executor(&ledger).mark_ran(backend, &plan)
        })
    }

    /// Get the history of all ledger entries, oldest first.
    /// Returns an empty vector if nothing has been applied.
    pub fn history(&self, backend: &mut dyn Backend) -> Result<Vec<LedgerEntry>, Error> {
        self.ledger()?.read(backend)
    }

    pub fn lock_status(&self, backend: &mut dyn Backend) -> Result<Option<LockStatus>, Error> {
        self.lock()?.status(backend)
    }

    /// Clear a lock left behind by a killed run. Returns whether a lock was held.
    pub fn release_locks(&self, backend: &mut dyn Backend) -> Result<bool, Error> {
        self.lock()?.force_release(backend)
    }
}
