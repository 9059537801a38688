//! Applying and undoing changesets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;

use crate::backend::Backend;
use crate::changelog::Changelog;
use crate::core::{
    new_deployment_id, Changeset, ChangesetId, ExecType, Hooks, LedgerEntry, ENGINE_VERSION,
};
use crate::error::{BackendError, Error};
use crate::ledger::Ledger;
use crate::planner::Plan;

/// Lifecycle of an [`Executor`]. `Committed` and `Aborted` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Committed,
    Aborted,
}

/// Runs one plan against one backend. Each changeset gets its own transaction holding both
/// its statements and its ledger row.
pub struct Executor<'a> {
    ledger: &'a Ledger,
    hooks: &'a Hooks,
    cancel: Option<&'a AtomicBool>,
    deployment_id: String,
    state: RunState,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(ledger: &'a Ledger, hooks: &'a Hooks) -> Self {
        Self {
            ledger,
            hooks,
            cancel: None,
            deployment_id: new_deployment_id(Utc::now()),
            state: RunState::Idle,
        }
    }

    pub(crate) fn with_cancel_flag(mut self, cancel: Option<&'a AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Apply every changeset in `plan`, then tag the ledger when `tag` is given.
    /// Stops at the first failure; changesets committed before it stay applied.
    pub fn apply(
        &mut self,
        backend: &mut dyn Backend,
        plan: &Plan<'_>,
        tag: Option<&str>,
    ) -> Result<Vec<ChangesetId>, Error> {
        self.start()?;
        let result = self.apply_all(backend, plan, tag);
        self.finish(&result);
        result
    }

    /// Record every changeset in `plan` as `MARK_RAN` without running its statements.
    pub fn mark_ran(
        &mut self,
        backend: &mut dyn Backend,
        plan: &Plan<'_>,
    ) -> Result<Vec<ChangesetId>, Error> {
        self.start()?;
        let result = self.mark_all(backend, plan);
        self.finish(&result);
        result
    }

    /// Undo `entries` (oldest first, as the ledger returns them) newest first, running each
    /// changeset's rollback SQL and deleting its ledger row in one transaction.
    ///
    /// Every entry is checked before anything runs: an entry whose changeset is gone from
    /// `changelog` or declares no rollback fails with [`Error::RollbackUnavailable`].
    pub fn roll_back(
        &mut self,
        backend: &mut dyn Backend,
        changelog: &Changelog,
        entries: &[LedgerEntry],
    ) -> Result<Vec<ChangesetId>, Error> {
        self.start()?;
        let result = self.roll_back_all(backend, changelog, entries);
        self.finish(&result);
        result
    }

    fn start(&mut self) -> Result<(), Error> {
        if self.state != RunState::Idle {
            return Err(Error::InvalidConfig(format!(
                "executor already used (state {:?}); create a new one for each run",
                self.state
            )));
        }
        self.state = RunState::Running;
        Ok(())
    }

    fn finish<T>(&mut self, result: &Result<T, Error>) {
        self.state = match result {
            Ok(_) => RunState::Committed,
            Err(_) => RunState::Aborted,
        };
    }

    fn check_cancelled(&self, processed: usize) -> Result<(), Error> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(processed, "Run cancelled");
                Err(Error::Cancelled { applied: processed })
            }
            _ => Ok(()),
        }
    }

    fn entry_for(&self, changeset: &Changeset, order: i64, exec_type: ExecType) -> LedgerEntry {
        LedgerEntry {
            id: changeset.id.clone(),
            checksum: changeset.checksum.clone(),
            applied_at: Utc::now(),
            order_executed: order,
            exec_type,
            tag: None,
            comments: changeset.comment.clone(),
            contexts: changeset.context.as_ref().map(|c| c.to_string()),
            labels: changeset.labels_column(),
            deployment_id: self.deployment_id.clone(),
            engine_version: ENGINE_VERSION.to_string(),
        }
    }

    fn apply_all(
        &self,
        backend: &mut dyn Backend,
        plan: &Plan<'_>,
        tag: Option<&str>,
    ) -> Result<Vec<ChangesetId>, Error> {
        let mut applied = Vec::with_capacity(plan.pending.len());
        let mut order = plan.next_order;

        for changeset in &plan.pending {
            self.check_cancelled(applied.len())?;

            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!("changeset_update", changeset = %changeset.id).entered();

            #[cfg(feature = "tracing")]
            tracing::info!(statements = changeset.statements.len(), "Applying changeset");

            self.hooks.start(&changeset.id);
            let started = Instant::now();

            let entry = self.entry_for(changeset, order, ExecType::Executed);
            match self.apply_one(backend, changeset, &entry) {
                Ok(()) => {
                    let duration = started.elapsed();

                    #[cfg(feature = "tracing")]
                    tracing::info!(duration_ms = duration.as_millis(), "Changeset applied");

                    self.hooks.complete(&changeset.id, duration);
                    applied.push(changeset.id.clone());
                    order += 1;
                }
                Err(source) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %source, "Changeset failed");

                    self.hooks.error(&changeset.id, &source);
                    return Err(Error::ExecutionFailed {
                        id: changeset.id.clone(),
                        applied: applied.len(),
                        source,
                    });
                }
            }
        }

        if let Some(tag) = tag {
            self.ledger.tag(backend, tag, &self.deployment_id)?;
        }

        Ok(applied)
    }

    fn apply_one(
        &self,
        backend: &mut dyn Backend,
        changeset: &Changeset,
        entry: &LedgerEntry,
    ) -> Result<(), BackendError> {
        let mut tx = backend.begin()?;
        for statement in &changeset.statements {
            #[cfg(feature = "tracing")]
            tracing::debug!(sql = %statement, "Executing statement");

            tx.execute(statement)?;
        }
        self.ledger.record(tx.as_mut(), entry)?;
        tx.commit()
    }

    fn mark_all(
        &self,
        backend: &mut dyn Backend,
        plan: &Plan<'_>,
    ) -> Result<Vec<ChangesetId>, Error> {
        let mut marked = Vec::with_capacity(plan.pending.len());
        let mut order = plan.next_order;

        for changeset in &plan.pending {
            self.check_cancelled(marked.len())?;

            let entry = self.entry_for(changeset, order, ExecType::MarkRan);
            let result = backend.begin().and_then(|mut tx| {
                self.ledger.record(tx.as_mut(), &entry)?;
                tx.commit()
            });
            if let Err(source) = result {
                self.hooks.error(&changeset.id, &source);
                return Err(Error::ExecutionFailed {
                    id: changeset.id.clone(),
                    applied: marked.len(),
                    source,
                });
            }

            #[cfg(feature = "tracing")]
            tracing::info!(changeset = %changeset.id, "Marked changeset as ran");

            self.hooks.skipped(&changeset.id);
            marked.push(changeset.id.clone());
            order += 1;
        }

        Ok(marked)
    }

    fn roll_back_all(
        &self,
        backend: &mut dyn Backend,
        changelog: &Changelog,
        entries: &[LedgerEntry],
    ) -> Result<Vec<ChangesetId>, Error> {
        let mut steps = Vec::with_capacity(entries.len());
        for entry in entries.iter().rev() {
            if entry.is_tag_marker() {
                steps.push((entry, None));
                continue;
            }
            let changeset = changelog
                .find(&entry.id)
                .ok_or_else(|| Error::RollbackUnavailable {
                    id: entry.id.clone(),
                    reason: "the changeset is no longer in the changelog".to_string(),
                })?;
            if !changeset.rollback.declared {
                return Err(Error::RollbackUnavailable {
                    id: entry.id.clone(),
                    reason: "no rollback is declared".to_string(),
                });
            }
            steps.push((entry, Some(changeset)));
        }

        let mut rolled_back = Vec::with_capacity(steps.len());
        for (entry, changeset) in steps {
            self.check_cancelled(rolled_back.len())?;

            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!("changeset_rollback", changeset = %entry.id).entered();

            self.hooks.start(&entry.id);
            let started = Instant::now();

            let statements = changeset.map(|c| c.rollback.statements.as_slice()).unwrap_or_default();
            match self.roll_back_one(backend, &entry.id, statements) {
                Ok(()) => {
                    let duration = started.elapsed();

                    #[cfg(feature = "tracing")]
                    tracing::info!(duration_ms = duration.as_millis(), "Changeset rolled back");

                    self.hooks.complete(&entry.id, duration);
                    rolled_back.push(entry.id.clone());
                }
                Err(source) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %source, "Rollback failed");

                    self.hooks.error(&entry.id, &source);
                    return Err(Error::ExecutionFailed {
                        id: entry.id.clone(),
                        applied: rolled_back.len(),
                        source,
                    });
                }
            }
        }

        Ok(rolled_back)
    }

    fn roll_back_one(
        &self,
        backend: &mut dyn Backend,
        id: &ChangesetId,
        statements: &[String],
    ) -> Result<(), BackendError> {
        let mut tx = backend.begin()?;
        for statement in statements {
            tx.execute(statement)?;
        }
        self.ledger.remove(tx.as_mut(), id)?;
        tx.commit()
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::planner::{plan, Filter};
    use crate::sqlite::SqliteBackend;
    use rusqlite::Connection;

    fn changelog(source: &str) -> Changelog {
        Changelog::parse(
            &format!("--liquibase formatted sql\n{}", source),
            "changelog.sql",
        )
        .unwrap()
    }

    fn backend() -> SqliteBackend {
        SqliteBackend::new(Connection::open_in_memory().unwrap())
    }

    fn run(ledger: &Ledger, backend: &mut SqliteBackend, changelog: &Changelog) -> Result<Vec<ChangesetId>, Error> {
        let hooks = Hooks::default();
        let applied = ledger.load_applied(backend)?;
        let plan = plan(changelog.changesets(), &applied, &Filter::default())?;
        Executor::new(ledger, &hooks).apply(backend, &plan, None)
    }

    fn count(backend: &SqliteBackend, sql: &str) -> i64 {
        backend
            .connection()
            .query_row(sql, [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn applies_in_order_and_records_ledger() {
        let ledger = Ledger::new("ledger");
        let mut backend = backend();
        let changelog = changelog(
            "--changeset alice:1 labels:base\n\
             --comment: first\n\
             CREATE TABLE t (id INTEGER);\n\
             --changeset alice:2 context:dev\n\
             INSERT INTO t VALUES (1);\n",
        );

        let applied = run(&ledger, &mut backend, &changelog).unwrap();
        assert_eq!(applied.len(), 2);

        let entries = ledger.read(&mut backend).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].order_executed, 1);
        assert_eq!(entries[1].order_executed, 2);
        assert_eq!(entries[0].exec_type, ExecType::Executed);
        assert_eq!(entries[0].comments.as_deref(), Some("first"));
        assert_eq!(entries[0].labels.as_deref(), Some("base"));
        assert_eq!(entries[1].contexts.as_deref(), Some("dev"));
        assert_eq!(entries[0].deployment_id, entries[1].deployment_id);
        assert_eq!(count(&backend, "SELECT COUNT(*) FROM t"), 1);
    }

    #[test]
    fn failure_rolls_back_only_the_failing_changeset() {
        let ledger = Ledger::new("ledger");
        let mut backend = backend();
        let changelog = changelog(
            "--changeset alice:1\n\
             CREATE TABLE t (id INTEGER);\n\
             --changeset alice:2\n\
             CREATE TABLE u (id INTEGER);\n\
             INSERT INTO missing VALUES (1);\n\
             --changeset alice:3\n\
             CREATE TABLE v (id INTEGER);\n",
        );

        match run(&ledger, &mut backend, &changelog) {
            Err(Error::ExecutionFailed { id, applied, .. }) => {
                assert_eq!(id.id, "2");
                assert_eq!(applied, 1);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(backend.table_exists("t").unwrap());
        assert!(!backend.table_exists("u").unwrap());
        assert!(!backend.table_exists("v").unwrap());
        assert_eq!(ledger.read(&mut backend).unwrap().len(), 1);
    }

    #[test]
    fn executor_is_single_use() {
        let ledger = Ledger::new("ledger");
        let hooks = Hooks::default();
        let mut backend = backend();
        let changelog = changelog("--changeset a:1\nCREATE TABLE t (id INTEGER);\n");
        let applied = ledger.load_applied(&mut backend).unwrap();
        let plan = plan(changelog.changesets(), &applied, &Filter::default()).unwrap();

        let mut executor = Executor::new(&ledger, &hooks);
        assert_eq!(executor.state(), RunState::Idle);
        executor.apply(&mut backend, &plan, None).unwrap();
        assert_eq!(executor.state(), RunState::Committed);
        assert!(matches!(
            executor.apply(&mut backend, &plan, None),
            Err(Error::InvalidConfig(_))
        ));
        assert_eq!(executor.state(), RunState::Committed);
    }

    #[test]
    fn failed_run_ends_aborted() {
        let ledger = Ledger::new("ledger");
        let hooks = Hooks::default();
        let mut backend = backend();
        let changelog = changelog("--changeset a:1\nINSERT INTO missing VALUES (1);\n");
        let plan = plan(changelog.changesets(), &[], &Filter::default()).unwrap();
        ledger.ensure(&mut backend).unwrap();

        let mut executor = Executor::new(&ledger, &hooks);
        assert!(executor.apply(&mut backend, &plan, None).is_err());
        assert_eq!(executor.state(), RunState::Aborted);
    }

    #[test]
    fn cancellation_stops_before_next_changeset() {
        let ledger = Ledger::new("ledger");
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let hooks = Hooks {
            on_changeset_complete: Some(Box::new(move |_: &ChangesetId, _: Duration| {
                flag.store(true, Ordering::SeqCst)
            })),
            ..Hooks::default()
        };
        let mut backend = backend();
        let changelog = changelog(
            "--changeset a:1\nCREATE TABLE t (id INTEGER);\n\
             --changeset a:2\nCREATE TABLE u (id INTEGER);\n",
        );
        ledger.ensure(&mut backend).unwrap();
        let plan = plan(changelog.changesets(), &[], &Filter::default()).unwrap();

        let err = Executor::new(&ledger, &hooks)
            .with_cancel_flag(Some(cancel.as_ref()))
            .apply(&mut backend, &plan, None)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { applied: 1 }));
        assert!(backend.table_exists("t").unwrap());
        assert!(!backend.table_exists("u").unwrap());
        assert_eq!(ledger.read(&mut backend).unwrap().len(), 1);
    }

    #[test]
    fn hooks_fire_per_changeset() {
        let ledger = Ledger::new("ledger");
        let events = Arc::new(Mutex::new(Vec::new()));
        let (start, complete, error) = (events.clone(), events.clone(), events.clone());
        let hooks = Hooks {
            on_changeset_start: Some(Box::new(move |id: &ChangesetId| {
                start.lock().unwrap().push(format!("start {}", id.id))
            })),
            on_changeset_complete: Some(Box::new(move |id: &ChangesetId, _: Duration| {
                complete.lock().unwrap().push(format!("complete {}", id.id))
            })),
            on_changeset_error: Some(Box::new(move |id: &ChangesetId, _: &BackendError| {
                error.lock().unwrap().push(format!("error {}", id.id))
            })),
            ..Hooks::default()
        };
        let mut backend = backend();
        let changelog = changelog(
            "--changeset a:1\nCREATE TABLE t (id INTEGER);\n\
             --changeset a:2\nINSERT INTO missing VALUES (1);\n",
        );
        ledger.ensure(&mut backend).unwrap();
        let plan = plan(changelog.changesets(), &[], &Filter::default()).unwrap();
        let _ = Executor::new(&ledger, &hooks).apply(&mut backend, &plan, None);

        assert_eq!(
            *events.lock().unwrap(),
            vec!["start 1", "complete 1", "start 2", "error 2"]
        );
    }

    #[test]
    fn mark_ran_records_without_executing() {
        let ledger = Ledger::new("ledger");
        let hooks = Hooks::default();
        let mut backend = backend();
        let changelog = changelog("--changeset a:1\nCREATE TABLE t (id INTEGER);\n");
        ledger.ensure(&mut backend).unwrap();
        let plan = plan(changelog.changesets(), &[], &Filter::default()).unwrap();

        let marked = Executor::new(&ledger, &hooks)
            .mark_ran(&mut backend, &plan)
            .unwrap();
        assert_eq!(marked.len(), 1);
        assert!(!backend.table_exists("t").unwrap());
        let entries = ledger.read(&mut backend).unwrap();
        assert_eq!(entries[0].exec_type, ExecType::MarkRan);
        assert_eq!(entries[0].checksum, changelog.changesets()[0].checksum);
    }

    #[test]
    fn roll_back_runs_newest_first() {
        let ledger = Ledger::new("ledger");
        let hooks = Hooks::default();
        let mut backend = backend();
        let changelog = changelog(
            "--changeset a:1\nCREATE TABLE t (id INTEGER);\n--rollback DROP TABLE t;\n\
             --changeset a:2\nCREATE TABLE u (id INTEGER REFERENCES t (id));\n--rollback DROP TABLE u;\n\
             --changeset a:3\nINSERT INTO t VALUES (1);\n--rollback not required\n",
        );
        run(&ledger, &mut backend, &changelog).unwrap();

        let entries = ledger.read(&mut backend).unwrap();
        let rolled_back = Executor::new(&ledger, &hooks)
            .roll_back(&mut backend, &changelog, &entries)
            .unwrap();
        let ids: Vec<_> = rolled_back.iter().map(|id| id.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);
        assert!(!backend.table_exists("t").unwrap());
        assert!(!backend.table_exists("u").unwrap());
        assert!(ledger.read(&mut backend).unwrap().is_empty());
    }

    #[test]
    fn roll_back_refuses_before_running_anything() {
        let ledger = Ledger::new("ledger");
        let hooks = Hooks::default();
        let mut backend = backend();
        let changelog = changelog(
            "--changeset a:1\nCREATE TABLE t (id INTEGER);\n\
             --changeset a:2\nCREATE TABLE u (id INTEGER);\n--rollback DROP TABLE u;\n",
        );
        run(&ledger, &mut backend, &changelog).unwrap();

        let entries = ledger.read(&mut backend).unwrap();
        let err = Executor::new(&ledger, &hooks)
            .roll_back(&mut backend, &changelog, &entries)
            .unwrap_err();
        assert!(matches!(err, Error::RollbackUnavailable { ref id, .. } if id.id == "1"));
        assert!(backend.table_exists("u").unwrap());
        assert_eq!(ledger.read(&mut backend).unwrap().len(), 2);
    }
}
