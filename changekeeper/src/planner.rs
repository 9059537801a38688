//! Deciding what an update run will do.

use std::collections::{BTreeSet, HashMap};

use crate::core::{Changeset, ChangesetId, LedgerEntry};
use crate::error::Error;
use crate::expression::Expression;
use crate::ledger::next_order;

/// Which pending changesets a run should apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Evaluated against each changeset's labels. Changesets without labels always match.
    pub labels: Expression,
    /// The run's contexts. Each changeset's context expression is evaluated against them;
    /// an empty list matches every changeset.
    pub contexts: BTreeSet<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_labels(mut self, labels: Expression) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.contexts = contexts
            .into_iter()
            .map(|c| c.as_ref().trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        self
    }

    pub fn accepts(&self, changeset: &Changeset) -> bool {
        let labels_match = changeset.labels.is_empty() || self.labels.matches(&changeset.labels);
        let contexts_match = self.contexts.is_empty()
            || changeset
                .context
                .as_ref()
                .map_or(true, |context| context.matches(&self.contexts));
        labels_match && contexts_match
    }
}

/// The outcome of planning an update.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan<'a> {
    /// Changesets to apply, in changelog order.
    pub pending: Vec<&'a Changeset>,
    /// Unapplied changesets the filter excluded.
    pub filtered_out: Vec<ChangesetId>,
    /// Changesets already in the ledger with a matching checksum.
    pub already_applied: usize,
    /// Ledger rows with no changeset in the changelog.
    pub unknown_applied: Vec<ChangesetId>,
    /// Order index the first applied changeset will take.
    pub next_order: i64,
}

impl Plan<'_> {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Compare the changelog against the ledger.
///
/// Applied changesets must still carry the checksum they were applied with; any difference
/// fails the whole plan with [`Error::DriftDetected`]. Unapplied changesets are kept in
/// changelog order when `filter` accepts them.
pub fn plan<'a>(
    changesets: &'a [Changeset],
    applied: &[LedgerEntry],
    filter: &Filter,
) -> Result<Plan<'a>, Error> {
    let recorded: HashMap<&ChangesetId, &LedgerEntry> = applied
        .iter()
        .filter(|e| !e.is_tag_marker())
        .map(|e| (&e.id, e))
        .collect();

    let mut plan = Plan {
        pending: Vec::new(),
        filtered_out: Vec::new(),
        already_applied: 0,
        unknown_applied: Vec::new(),
        next_order: next_order(applied),
    };

    for changeset in changesets {
        match recorded.get(&changeset.id) {
            Some(entry) => {
                if entry.checksum != changeset.checksum {
                    return Err(Error::DriftDetected {
                        id: changeset.id.clone(),
                        recorded: entry.checksum.clone(),
                        current: changeset.checksum.clone(),
                    });
                }
                plan.already_applied += 1;
            }
            None if filter.accepts(changeset) => plan.pending.push(changeset),
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(changeset = %changeset.id, "Excluded by label or context filter");

                plan.filtered_out.push(changeset.id.clone());
            }
        }
    }

    let known: BTreeSet<&ChangesetId> = changesets.iter().map(|c| &c.id).collect();
    for id in recorded.keys() {
        if !known.contains(id) {
            plan.unknown_applied.push((*id).clone());
        }
    }
    plan.unknown_applied.sort();

    #[cfg(feature = "tracing")]
    for id in &plan.unknown_applied {
        tracing::warn!(changeset = %id, "Ledger entry has no matching changeset in the changelog");
    }

    Ok(plan)
}
