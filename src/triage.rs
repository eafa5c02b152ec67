//! Triage loop.
//!
//! Drives the per-item cycle: fetch, build facts, reconcile, apply, and redo
//! when applying changed state the facts were computed from. One item's
//! failure never aborts the batch; retry exhaustion and configuration errors
//! do, because they signal a systemic problem.
//!
//! Actions inside one set are applied in a fixed order: label removals,
//! label additions, comment deletions, comment postings, then terminal
//! operations (close, merge, CI control). A close therefore never races
//! ahead of the comment explaining it.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use crate::actions::ActionSet;
use crate::ci::{get_ci_facts, CiProvider, CiStatus};
use crate::config::TriageConfig;
use crate::engine::{commands, ReconciliationEngine};
use crate::error::Result;
use crate::facts::{FactStore, FactValue};
use crate::governor::RetryGovernor;
use crate::item::TrackedItem;
use crate::remote::RemoteApi;
use crate::snapshot::{ItemSnapshot, SnapshotStore};

/// Redo iterations per item before the loop starts complaining.
const REDO_WARN_THRESHOLD: u32 = 5;

/// External fact-extractor hook. A failing extractor leaves its keys absent;
/// it never fails the item.
#[async_trait::async_trait]
pub trait FactExtractor: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, item: &TrackedItem) -> anyhow::Result<FactStore>;
}

/// Batch-level flags, mirrored from the CLI.
#[derive(Debug, Clone, Default)]
pub struct TriageOptions {
    /// Skip items whose update timestamp has not moved since the last pass
    pub skip_no_update: bool,
    /// Stop after caching item state, before reconciliation
    pub collect_only: bool,
    pub only_issues: bool,
    pub only_prs: bool,
}

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Triaged { redos: u32 },
    Skipped,
    Collected,
}

/// Counters for one batch run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchSummary {
    pub triaged: u32,
    pub skipped: u32,
    pub collected: u32,
    pub failed: u32,
    pub redos: u32,
}

/// Drives the state machine over a batch of tracked items.
pub struct TriageLoop {
    remote: Arc<dyn RemoteApi>,
    governor: Arc<RetryGovernor>,
    ci: Option<Arc<dyn CiProvider>>,
    engine: ReconciliationEngine,
    snapshots: SnapshotStore,
    extractors: Vec<Box<dyn FactExtractor>>,
    config: TriageConfig,
    options: TriageOptions,
}

impl TriageLoop {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        governor: Arc<RetryGovernor>,
        ci: Option<Arc<dyn CiProvider>>,
        config: TriageConfig,
        options: TriageOptions,
    ) -> Self {
        Self {
            engine: ReconciliationEngine::new(config.engine_config()),
            snapshots: SnapshotStore::new(config.snapshot_dir()),
            remote,
            governor,
            ci,
            extractors: Vec::new(),
            config,
            options,
        }
    }

    /// Register an external fact-extractor. Extraction order is not part of
    /// the contract; extractors must not depend on one another.
    pub fn with_extractor(mut self, extractor: Box<dyn FactExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    /// Process a batch. With an empty id list the open items are fetched
    /// from the remote.
    pub async fn run(&self, item_ids: &[u64]) -> Result<BatchSummary> {
        let started = std::time::Instant::now();

        let ids = if item_ids.is_empty() {
            self.governor
                .execute("list_open_items", || self.remote.list_open_items())
                .await?
                .unwrap_or_default()
        } else {
            item_ids.to_vec()
        };

        let valid_labels: BTreeSet<String> = self
            .governor
            .execute("list_repo_labels", || self.remote.list_repo_labels())
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect();

        info!(items = ids.len(), "starting triage batch");
        let progress = ProgressBar::new(ids.len() as u64);
        progress.set_style(
            ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut summary = BatchSummary::default();
        for &id in &ids {
            progress.set_message(format!("#{id}"));
            match self.process_item(id, &valid_labels).await {
                Ok(ItemOutcome::Triaged { redos }) => {
                    summary.triaged += 1;
                    summary.redos += redos;
                }
                Ok(ItemOutcome::Skipped) => summary.skipped += 1,
                Ok(ItemOutcome::Collected) => summary.collected += 1,
                Err(err) if err.is_process_fatal() => {
                    progress.abandon();
                    return Err(err);
                }
                Err(err) => {
                    // item-scoped failure: log with context, keep the batch going
                    error!(item = id, %err, "item failed, continuing batch");
                    summary.failed += 1;
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        info!(
            triaged = summary.triaged,
            skipped = summary.skipped,
            failed = summary.failed,
            redos = summary.redos,
            elapsed_s = started.elapsed().as_secs(),
            "batch finished"
        );
        Ok(summary)
    }

    /// Fetch → Facts → Reconcile → Apply → (Redo → Fetch | Done) for one item.
    async fn process_item(&self, id: u64, valid_labels: &BTreeSet<String>) -> Result<ItemOutcome> {
        let mut loopcount: u32 = 0;
        loop {
            loopcount += 1;
            if loopcount > REDO_WARN_THRESHOLD {
                warn!(item = id, cycles = loopcount, "item keeps requesting redo");
            }
            if loopcount == 1 {
                info!(item = id, "starting triage");
            } else {
                info!(item = id, cycle = loopcount, "restarting triage");
            }

            let Some(item) = self
                .governor
                .execute("fetch_item", || self.remote.fetch_item(id))
                .await?
            else {
                info!(item = id, "item gone, skipping");
                return Ok(ItemOutcome::Skipped);
            };

            if !item.is_open {
                return Ok(if loopcount == 1 {
                    info!(item = id, "closed, skipping");
                    ItemOutcome::Skipped
                } else {
                    ItemOutcome::Triaged { redos: loopcount - 1 }
                });
            }
            if self.options.only_prs && item.is_issue() {
                return Ok(ItemOutcome::Skipped);
            }
            if self.options.only_issues && item.is_pull_request() {
                return Ok(ItemOutcome::Skipped);
            }

            let previous = self.snapshots.load(id)?;

            let ci_status = match (&self.ci, item.is_pull_request()) {
                (Some(ci), true) => self
                    .governor
                    .execute("ci_status", || ci.status(&item))
                    .await?
                    .flatten(),
                _ => None,
            };

            if self.options.collect_only {
                self.save_snapshot(&item, FactStore::new(), ActionSet::new(), previous.as_ref())?;
                return Ok(ItemOutcome::Collected);
            }

            if self.options.skip_no_update
                && loopcount == 1
                && self.should_skip(&item, previous.as_ref(), ci_status.as_ref())
            {
                info!(item = id, "skipping: no changes since last run");
                return Ok(ItemOutcome::Skipped);
            }

            let facts = self
                .build_facts(&item, ci_status.as_ref(), previous.as_ref())
                .await?;

            let actions = self
                .engine
                .reconcile(&item, &facts, valid_labels, Utc::now())?;

            let ci_run = facts.get_int("ci_run_number").map(|n| n as u64);
            let redo = self.apply(&item, &actions, ci_run).await?;

            self.save_snapshot(&item, facts, actions, previous.as_ref())?;

            if !redo {
                return Ok(ItemOutcome::Triaged { redos: loopcount - 1 });
            }
        }
    }

    /// No-change check against the persisted snapshot.
    fn should_skip(
        &self,
        item: &TrackedItem,
        previous: Option<&ItemSnapshot>,
        ci_status: Option<&CiStatus>,
    ) -> bool {
        let Some(prev) = previous else {
            return false;
        };
        if prev.updated_at != item.updated_at {
            return false;
        }
        // force a periodic re-triage even for quiet items
        let days_stale = (Utc::now() - prev.time).num_days();
        if days_stale > self.config.stale_window_days {
            info!(item = item.number, days_stale, "re-triaging stale item");
            return false;
        }
        if item.is_pull_request() {
            // keep polling rebuilds and pending merges until they land
            if prev.needs_rebuild || prev.admin_merge {
                return false;
            }
            // CI finished after the last pass: status facts changed
            if let Some(status) = ci_status {
                if status.started_at > prev.updated_at {
                    return false;
                }
            }
        }
        true
    }

    /// Assemble the fact snapshot: external extractors first, then the CI
    /// facts, then the remote-dependent command facts.
    async fn build_facts(
        &self,
        item: &TrackedItem,
        ci_status: Option<&CiStatus>,
        previous: Option<&ItemSnapshot>,
    ) -> Result<FactStore> {
        let mut facts = FactStore::new();

        for extractor in &self.extractors {
            match extractor.extract(item).await {
                Ok(partial) => facts.merge(partial),
                Err(err) => {
                    // absent keys read as unknown downstream
                    warn!(
                        item = item.number,
                        extractor = extractor.name(),
                        %err,
                        "fact extractor failed, keys absent"
                    );
                }
            }
        }

        facts.merge(get_ci_facts(
            item,
            ci_status,
            previous.and_then(|p| p.notified_ci_run),
        ));

        self.resolve_pr_reference(item, &mut facts).await?;
        Ok(facts)
    }

    /// resolved_by_pr needs a remote round-trip for the merge state; only the
    /// most recent matching command is inspected.
    async fn resolve_pr_reference(&self, item: &TrackedItem, facts: &mut FactStore) -> Result<()> {
        let maintainers: BTreeSet<String> = facts.get_list("maintainers").iter().cloned().collect();
        let active = commands::active_commands(&item.command_events, Some(&maintainers));
        if !active.contains("resolved_by_pr") {
            return Ok(());
        }
        let Some(event) =
            commands::latest_command_event(&item.command_events, "resolved_by_pr", Some(&maintainers))
        else {
            return Ok(());
        };
        let Some(number) = commands::extract_pr_number(&event.token) else {
            // unparseable command was already logged; nothing to resolve
            return Ok(());
        };
        let merged = self
            .governor
            .execute("is_pr_merged", || self.remote.is_pr_merged(number))
            .await?
            .unwrap_or(false);
        facts.set(
            "resolved_by_pr",
            FactValue::Record(serde_json::json!({ "number": number, "merged": merged })),
        );
        Ok(())
    }

    /// Apply one action set in the fixed order, every call governed.
    /// Returns true when a state-altering side effect makes a redo necessary.
    async fn apply(&self, item: &TrackedItem, actions: &ActionSet, ci_run: Option<u64>) -> Result<bool> {
        if actions.is_noop() {
            return Ok(false);
        }
        let id = item.number;
        let mut redo = false;

        for label in &actions.remove_labels {
            self.governor
                .execute("remove_label", || self.remote.remove_label(id, label))
                .await?;
        }
        if !actions.add_labels.is_empty() {
            self.governor
                .execute("add_labels", || self.remote.add_labels(id, &actions.add_labels))
                .await?;
        }
        for comment_id in &actions.delete_comments {
            self.governor
                .execute("delete_comment", || self.remote.delete_comment(*comment_id))
                .await?;
        }
        for body in &actions.comments {
            self.governor
                .execute("post_comment", || self.remote.post_comment(id, body))
                .await?;
        }

        if actions.close {
            self.governor
                .execute("close_item", || self.remote.close_item(id))
                .await?;
            redo = true;
        }
        if actions.merge {
            let merged = self
                .governor
                .execute("merge_item", || self.remote.merge_item(id))
                .await?;
            if merged.is_some() {
                redo = true;
            }
        }

        if let Some(ci) = &self.ci {
            if actions.rebuild || actions.rebuild_failed_only {
                match ci_run {
                    Some(run) => {
                        if actions.rebuild {
                            info!(item = id, run, "rebuilding CI");
                            self.governor.execute("ci_rebuild", || ci.rebuild(run)).await?;
                        } else {
                            info!(item = id, run, "rebuilding failed CI jobs");
                            self.governor
                                .execute("ci_rebuild_failed", || ci.rebuild_failed(run))
                                .await?;
                        }
                        redo = true;
                    }
                    None => error!(item = id, "rebuild requested without a CI run id"),
                }
            }
            if actions.cancel_ci {
                match ci_run {
                    Some(run) => {
                        info!(item = id, run, "cancelling CI");
                        self.governor.execute("ci_cancel", || ci.cancel(run)).await?;
                    }
                    None => error!(item = id, "cancel requested without a CI run id"),
                }
            }
            if actions.cancel_ci_branch {
                if let Some(branch) = &item.head_branch {
                    self.governor
                        .execute("ci_cancel_branch", || ci.cancel_on_branch(branch))
                        .await?;
                }
            }
        }

        Ok(redo)
    }

    fn save_snapshot(
        &self,
        item: &TrackedItem,
        facts: FactStore,
        actions: ActionSet,
        previous: Option<&ItemSnapshot>,
    ) -> Result<()> {
        let notified_ci_run = if actions
            .comments
            .iter()
            .any(|c| c.contains("boilerplate: ci_test_results"))
        {
            facts.get_int("ci_run_number").map(|n| n as u64)
        } else {
            previous.and_then(|p| p.notified_ci_run)
        };
        let snapshot = ItemSnapshot {
            number: item.number,
            updated_at: item.updated_at,
            time: Utc::now(),
            needs_rebuild: actions.rebuild || actions.rebuild_failed_only,
            admin_merge: facts.get_bool("admin_merge"),
            notified_ci_run,
            facts: facts.to_json(),
            actions,
        };
        self.snapshots.save(&snapshot)
    }
}
