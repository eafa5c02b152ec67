//! Reconciliation engine.
//!
//! Turns one item's facts into a minimal [`ActionSet`] without oscillating or
//! double-applying mutations. Policy is an **ordered** list of independent
//! clauses, each a small predicate+effect function:
//!
//! - Short-circuit gates run first (bot_broken, bot_skip, missing incoming
//!   reference, not-from-fork, unknown mergeable state). Once a gate fires,
//!   evaluation stops with whatever the gate produced.
//! - Label/comment clauses follow in a fixed order. A later clause may
//!   withdraw a proposal an earlier one queued (the bad-item notice strips
//!   notification comments, rebuild strips a pending stale_ci).
//! - Finalization sorts and deduplicates the label sets, then enforces the
//!   oscillation invariants: a waffling label, or a label proposed for both
//!   addition and removal, fails the item with a policy conflict instead of
//!   silently resolving.
//!
//! Clauses read facts through [`FactStore`]'s absent-tolerant getters, so a
//! failed fact-extractor degrades to "unknown", never to a crash.

pub mod commands;
pub mod waffling;

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, warn};

use crate::actions::ActionSet;
use crate::error::{Result, ShepherdError};
use crate::facts::FactStore;
use crate::item::{LabelAction, TrackedItem};
use crate::templates;

/// Issue-type fact values mapped to their tracker labels.
const ISSUE_TYPE_LABELS: &[(&str, &str)] = &[
    ("bug report", "bug"),
    ("bugfix pull request", "bug"),
    ("feature idea", "feature"),
    ("feature pull request", "feature"),
    ("documentation report", "docs"),
    ("docs pull request", "docs"),
    ("new module pull request", "new_plugin"),
];

/// Maintainer commands that close an item outright.
const CLOSING_COMMANDS: &[&str] = &["wontfix", "notabug", "bug_resolved", "duplicate_of", "close_me"];

/// Engine policy knobs, derived from [`crate::config::TriageConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Actor names that count as the bot itself
    pub bot_names: BTreeSet<String>,
    /// Allow the automerge clause to set the merge flag
    pub automerge_enabled: bool,
    /// Close PRs whose incoming repository vanished
    pub close_missing_ref: bool,
    /// Seed the needs_triage label on fresh items
    pub seed_needs_triage: bool,
    /// Alternations beyond this count are waffling
    pub waffle_tolerance: u32,
    /// Label-change lookback window for the waffling scan
    pub waffle_lookback_days: i64,
    /// Days before a needs_info item expires, quoted in warnings
    pub needs_info_expire_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bot_names: ["shepherd".to_string(), "shepherd-dev".to_string()]
                .into_iter()
                .collect(),
            automerge_enabled: false,
            close_missing_ref: true,
            seed_needs_triage: true,
            waffle_tolerance: 3,
            waffle_lookback_days: 90,
            needs_info_expire_days: 60,
        }
    }
}

/// Whether evaluation proceeds past a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseFlow {
    Continue,
    /// Stop evaluating; the actions accumulated so far are terminal.
    Halt,
}

type ClauseFn = fn(&ClauseContext<'_>, &mut ActionSet) -> ClauseFlow;

struct Clause {
    name: &'static str,
    run: ClauseFn,
}

/// Everything one clause may read. Immutable for the whole pass.
pub struct ClauseContext<'a> {
    pub item: &'a TrackedItem,
    pub facts: &'a FactStore,
    pub valid_labels: &'a BTreeSet<String>,
    pub config: &'a EngineConfig,
    pub now: DateTime<Utc>,
    maintainer_commands: BTreeSet<String>,
    submitter_commands: BTreeSet<String>,
}

impl<'a> ClauseContext<'a> {
    fn new(
        item: &'a TrackedItem,
        facts: &'a FactStore,
        valid_labels: &'a BTreeSet<String>,
        config: &'a EngineConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let maintainers: BTreeSet<String> = facts
            .get_list("maintainers")
            .iter()
            .cloned()
            .collect();
        let submitter: BTreeSet<String> = [item.submitter.clone()].into_iter().collect();
        Self {
            item,
            facts,
            valid_labels,
            config,
            now,
            maintainer_commands: commands::active_commands(&item.command_events, Some(&maintainers)),
            submitter_commands: commands::active_commands(&item.command_events, Some(&submitter)),
        }
    }

    fn is_bad_item(&self) -> bool {
        self.facts.get_bool("is_bad_item")
    }

    /// Active for either the maintainers or the submitter.
    fn command_active(&self, name: &str) -> bool {
        self.maintainer_commands.contains(name) || self.submitter_commands.contains(name)
    }

    /// Addition is suppressed when a human removed this exact label.
    fn may_auto_add(&self, label: &str) -> bool {
        !self.item.was_removed_by_human(label, &self.config.bot_names)
    }

    /// Removal is suppressed when a human added this exact label.
    fn may_auto_remove(&self, label: &str) -> bool {
        !self.item.was_added_by_human(label, &self.config.bot_names)
    }

    /// Monotone, override-respecting label addition.
    fn propose_add(&self, actions: &mut ActionSet, label: &str) {
        if !self.item.has_label(label) && self.may_auto_add(label) {
            actions.add_label(label);
        }
    }

    /// Monotone addition that ignores the manual-override check, for clauses
    /// whose trigger is itself an explicit human signal.
    fn propose_add_forced(&self, actions: &mut ActionSet, label: &str) {
        if !self.item.has_label(label) {
            actions.add_label(label);
        }
    }

    /// Monotone, override-respecting label removal.
    fn propose_remove(&self, actions: &mut ActionSet, label: &str) {
        if self.item.has_label(label) && self.may_auto_remove(label) {
            actions.remove_label(label);
        }
    }

    fn propose_remove_forced(&self, actions: &mut ActionSet, label: &str) {
        if self.item.has_label(label) {
            actions.remove_label(label);
        }
    }
}

// ============================================================================
// Short-circuit gates
// ============================================================================

/// bot_broken/!bot_broken from any actor, with label flips counting as
/// commands. While broken the bot does nothing except keep the marker label.
fn gate_bot_broken(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    let mut latest: Option<(DateTime<Utc>, bool)> = None;
    for event in &ctx.item.command_events {
        let verdict = match event.command() {
            "bot_broken" => Some(true),
            "!bot_broken" => Some(false),
            _ => None,
        };
        if let Some(broken) = verdict {
            if latest.map_or(true, |(ts, _)| event.timestamp >= ts) {
                latest = Some((event.timestamp, broken));
            }
        }
    }
    for event in &ctx.item.label_events {
        if event.label != "bot_broken" {
            continue;
        }
        let broken = event.action == LabelAction::Applied;
        if latest.map_or(true, |(ts, _)| event.timestamp >= ts) {
            latest = Some((event.timestamp, broken));
        }
    }

    if matches!(latest, Some((_, true))) {
        warn!(item = ctx.item.number, "bot marked broken, skipping triage");
        ctx.propose_add_forced(actions, "bot_broken");
        return ClauseFlow::Halt;
    }
    ctx.propose_remove_forced(actions, "bot_broken");
    ClauseFlow::Continue
}

/// bot_skip from a maintainer or the submitter suspends triage quietly.
fn gate_bot_skip(ctx: &ClauseContext<'_>, _actions: &mut ActionSet) -> ClauseFlow {
    if ctx.command_active("bot_skip") {
        warn!(item = ctx.item.number, "bot_skip active, skipping triage");
        return ClauseFlow::Halt;
    }
    ClauseFlow::Continue
}

/// A PR whose source repository vanished can never be rebuilt or merged.
fn gate_missing_incoming_ref(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.item.is_pull_request() || ctx.item.incoming_repo_exists {
        return ClauseFlow::Continue;
    }
    actions.push_comment(templates::missing_ref(&ctx.item.submitter));
    if ctx.config.close_missing_ref {
        actions.close = true;
    }
    actions.cancel_ci = true;
    actions.cancel_ci_branch = true;
    ClauseFlow::Halt
}

/// PRs must come from forks so the upstream repo does not accumulate
/// contributor branches. Bot-submitted PRs (backports) are exempt.
fn gate_outside_fork(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.item.is_pull_request()
        || ctx.item.from_fork
        || ctx.config.bot_names.contains(&ctx.item.submitter)
    {
        return ClauseFlow::Continue;
    }
    actions.push_comment(templates::fork(&ctx.item.submitter));
    actions.close = true;
    actions.cancel_ci = true;
    actions.cancel_ci_branch = true;
    ClauseFlow::Halt
}

/// The tracker has not finished computing mergeability; anything decided now
/// would be based on stale data.
fn gate_unknown_mergeable(ctx: &ClauseContext<'_>, _actions: &mut ActionSet) -> ClauseFlow {
    if ctx.item.is_pull_request()
        && ctx.item.is_open
        && ctx.item.mergeable_state.as_deref() == Some("unknown")
    {
        warn!(
            item = ctx.item.number,
            "mergeable state unknown, skipping this pass"
        );
        return ClauseFlow::Halt;
    }
    ClauseFlow::Continue
}

// ============================================================================
// Policy clauses
// ============================================================================

/// Seed needs_triage on fresh items and migrate the legacy triage label.
fn clause_triage_seed(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.config.seed_needs_triage {
        return ClauseFlow::Continue;
    }
    if !ctx.item.has_label("needs_triage")
        && ctx.may_auto_add("needs_triage")
        && ctx.may_auto_add("triage")
    {
        actions.add_label("needs_triage");
    }
    if ctx.item.has_label("triage") {
        if !ctx.item.has_label("needs_triage") && !actions.will_add("needs_triage") {
            actions.add_label("needs_triage");
        }
        ctx.propose_remove_forced(actions, "triage");
    }
    ClauseFlow::Continue
}

/// The WIP marker in a PR title is an explicit human signal.
fn clause_work_in_progress(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.item.is_pull_request() {
        return ClauseFlow::Continue;
    }
    if ctx.item.work_in_progress {
        ctx.propose_add_forced(actions, "WIP");
        ctx.propose_remove_forced(actions, "shipit");
    } else {
        ctx.propose_remove_forced(actions, "WIP");
    }
    ClauseFlow::Continue
}

fn clause_needs_revision(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.item.is_pull_request() || ctx.item.work_in_progress {
        return ClauseFlow::Continue;
    }
    if ctx.facts.get_bool("is_needs_revision") || ctx.is_bad_item() {
        ctx.propose_add(actions, "needs_revision");
    } else {
        ctx.propose_remove(actions, "needs_revision");
    }
    ClauseFlow::Continue
}

fn clause_needs_rebase(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.item.is_pull_request() {
        return ClauseFlow::Continue;
    }
    if ctx.facts.get_bool("is_needs_rebase") || ctx.is_bad_item() {
        ctx.propose_add(actions, "needs_rebase");
    } else {
        ctx.propose_remove(actions, "needs_rebase");
    }
    ClauseFlow::Continue
}

fn clause_needs_ci(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.item.is_pull_request() {
        return ClauseFlow::Continue;
    }
    if !ctx.facts.get_bool("has_ci") {
        ctx.propose_add(actions, "needs_ci");
    } else {
        ctx.propose_remove(actions, "needs_ci");
    }
    ClauseFlow::Continue
}

/// Post the failing test output once per CI run. The comment body is capped
/// at the remote limit by the action set itself.
fn clause_ci_failure_comment(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.item.is_pull_request() || ctx.is_bad_item() {
        return ClauseFlow::Continue;
    }
    if ctx.facts.get_str("ci_state") == Some("failure")
        && ctx.facts.get_bool("needs_testresult_notification")
    {
        let results = ctx.facts.get_str("ci_test_results").unwrap_or("");
        actions.push_comment(templates::ci_test_results(&ctx.item.submitter, results));
    }
    ClauseFlow::Continue
}

fn clause_stale_ci(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.item.is_pull_request() || ctx.is_bad_item() {
        return ClauseFlow::Continue;
    }
    if ctx.facts.get_bool("ci_stale") {
        ctx.propose_add(actions, "stale_ci");
    } else {
        ctx.propose_remove(actions, "stale_ci");
    }
    ClauseFlow::Continue
}

fn clause_shipit_automerge(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.item.is_pull_request() || ctx.is_bad_item() {
        return ClauseFlow::Continue;
    }
    if ctx.facts.get_bool("shipit") {
        ctx.propose_add(actions, "shipit");
        if ctx.facts.get_bool("automerge") {
            ctx.propose_add(actions, "automerge");
            if ctx.config.automerge_enabled {
                actions.merge = true;
            }
        } else {
            ctx.propose_remove(actions, "automerge");
        }
    } else {
        ctx.propose_remove(actions, "shipit");
        ctx.propose_remove(actions, "automerge");
    }
    ClauseFlow::Continue
}

/// Version-affects labels are mutually exclusive: the winner is added and
/// every other present family member removed in the same pass.
fn clause_version_family(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    let Some(version) = ctx.facts.get_str("affects_version") else {
        return ClauseFlow::Continue;
    };
    let winner = format!("affects_{version}");
    if !ctx.valid_labels.contains(&winner) {
        return ClauseFlow::Continue;
    }
    ctx.propose_add(actions, &winner);
    for label in &ctx.item.labels {
        if label.starts_with("affects_") && *label != winner {
            ctx.propose_remove(actions, label);
        }
    }
    ClauseFlow::Continue
}

fn clause_issue_type(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    let Some(issue_type) = ctx.facts.get_str("issue_type") else {
        return ClauseFlow::Continue;
    };
    if let Some((_, label)) = ISSUE_TYPE_LABELS.iter().find(|(k, _)| *k == issue_type) {
        ctx.propose_add(actions, label);
    }
    ClauseFlow::Continue
}

/// needs_info is driven by explicit commands and timeouts, so the fact set
/// forces the label on even past a manual removal; the waffling guard is
/// what stops a genuine tug-of-war.
fn clause_needs_info(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if ctx.facts.get_bool("is_needs_info") {
        ctx.propose_add_forced(actions, "needs_info");
        if let Some(action) = ctx.facts.get_str("needs_info_action") {
            if action == "close" {
                actions.close = true;
            }
            actions.push_comment(templates::needs_info_action(
                &ctx.item.submitter,
                action,
                ctx.config.needs_info_expire_days,
            ));
        }
    } else {
        ctx.propose_remove(actions, "needs_info");
    }
    ClauseFlow::Continue
}

fn clause_waiting_on_contributor(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if ctx.facts.get_bool("is_needs_contributor") {
        ctx.propose_add(actions, "waiting_on_contributor");
    } else {
        ctx.propose_remove(actions, "waiting_on_contributor");
    }
    ClauseFlow::Continue
}

/// Maintainer close commands, plus resolved_by_pr once the referenced PR has
/// merged (merged status arrives as a fact computed before reconciliation).
fn clause_terminal_commands(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    for cmd in CLOSING_COMMANDS {
        if ctx.maintainer_commands.contains(*cmd) {
            actions.close = true;
        }
    }
    if ctx.maintainer_commands.contains("resolved_by_pr") {
        if let Some(resolved) = ctx.facts.get_record("resolved_by_pr") {
            if resolved["merged"].as_bool() == Some(true) {
                actions.close = true;
            }
        }
    }
    ClauseFlow::Continue
}

fn clause_bot_status(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if ctx.facts.get_bool("needs_bot_status") {
        actions.push_comment(templates::bot_status(
            ctx.facts.get_str("waiting_on").unwrap_or("maintainer"),
            ctx.facts.get_bool("is_needs_info"),
            ctx.facts.get_bool("is_needs_revision"),
        ));
    }
    ClauseFlow::Continue
}

/// Explicit label add/remove commands from humans override anything the
/// automatic clauses proposed for the same label.
fn clause_label_commands(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    for label in ctx.facts.get_list("label_cmds_add") {
        if !ctx.item.has_label(label) {
            actions.add_label(label.clone());
        }
        actions.cancel_remove(label);
    }
    for label in ctx.facts.get_list("label_cmds_del") {
        if ctx.item.has_label(label) {
            actions.remove_label(label.clone());
        }
        actions.cancel_add(label);
    }
    ClauseFlow::Continue
}

fn clause_component_labels(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if ctx.is_bad_item() {
        return ClauseFlow::Continue;
    }
    for label in ctx.facts.get_list("component_labels") {
        if ctx.valid_labels.contains(label) && !actions.will_add(label) {
            ctx.propose_add(actions, label);
        }
    }
    ClauseFlow::Continue
}

/// A requested rebuild supersedes the stale-CI marker.
fn clause_ci_rebuild(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if ctx.facts.get_bool("needs_rebuild_all") {
        actions.rebuild = true;
    } else if ctx.facts.get_bool("needs_rebuild_failed") {
        actions.rebuild_failed_only = true;
    } else {
        return ClauseFlow::Continue;
    }
    actions.cancel_add("stale_ci");
    ctx.propose_remove_forced(actions, "stale_ci");
    ClauseFlow::Continue
}

fn clause_admin_merge(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.is_bad_item()
        && !ctx.facts.get_bool("needs_rebuild")
        && ctx.facts.get_bool("admin_merge")
    {
        actions.merge = true;
    }
    ClauseFlow::Continue
}

fn clause_spam_cleanup(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    for raw in ctx.facts.get_list("spam_comment_ids") {
        match raw.parse::<u64>() {
            Ok(id) => actions.delete_comment(id),
            Err(_) => warn!(item = ctx.item.number, id = %raw, "unparseable spam comment id"),
        }
    }
    ClauseFlow::Continue
}

/// Terminal classification: strip the notification comments queued so far,
/// then post the explanation once.
fn clause_bad_item_notice(ctx: &ClauseContext<'_>, actions: &mut ActionSet) -> ClauseFlow {
    if !ctx.is_bad_item() {
        return ClauseFlow::Continue;
    }
    let Some(reason) = ctx.facts.get_str("bad_item_reason") else {
        return ClauseFlow::Continue;
    };
    actions.strip_mention_comments();
    if !ctx.facts.get_bool("bad_item_notified") {
        actions.push_comment(templates::bad_item(&ctx.item.submitter, reason));
    }
    ClauseFlow::Continue
}

/// The fixed evaluation order. Gates first; reordering label clauses changes
/// observable behavior (bad_item_notice must run after every comment-producing
/// clause, ci_rebuild after stale_ci, label_commands after the automatic
/// label clauses).
const CLAUSES: &[Clause] = &[
    Clause { name: "bot_broken", run: gate_bot_broken },
    Clause { name: "bot_skip", run: gate_bot_skip },
    Clause { name: "missing_incoming_ref", run: gate_missing_incoming_ref },
    Clause { name: "outside_fork", run: gate_outside_fork },
    Clause { name: "unknown_mergeable", run: gate_unknown_mergeable },
    Clause { name: "triage_seed", run: clause_triage_seed },
    Clause { name: "work_in_progress", run: clause_work_in_progress },
    Clause { name: "needs_revision", run: clause_needs_revision },
    Clause { name: "needs_rebase", run: clause_needs_rebase },
    Clause { name: "needs_ci", run: clause_needs_ci },
    Clause { name: "ci_failure_comment", run: clause_ci_failure_comment },
    Clause { name: "stale_ci", run: clause_stale_ci },
    Clause { name: "shipit_automerge", run: clause_shipit_automerge },
    Clause { name: "version_family", run: clause_version_family },
    Clause { name: "issue_type", run: clause_issue_type },
    Clause { name: "needs_info", run: clause_needs_info },
    Clause { name: "waiting_on_contributor", run: clause_waiting_on_contributor },
    Clause { name: "terminal_commands", run: clause_terminal_commands },
    Clause { name: "bot_status", run: clause_bot_status },
    Clause { name: "label_commands", run: clause_label_commands },
    Clause { name: "component_labels", run: clause_component_labels },
    Clause { name: "ci_rebuild", run: clause_ci_rebuild },
    Clause { name: "admin_merge", run: clause_admin_merge },
    Clause { name: "spam_cleanup", run: clause_spam_cleanup },
    Clause { name: "bad_item_notice", run: clause_bad_item_notice },
];

/// The ordered rule evaluator.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationEngine {
    config: EngineConfig,
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reconcile one item's facts into an action set. Pure in its inputs;
    /// fails with a policy conflict when the clauses produced contradictory
    /// or oscillating label proposals.
    pub fn reconcile(
        &self,
        item: &TrackedItem,
        facts: &FactStore,
        valid_labels: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<ActionSet> {
        let ctx = ClauseContext::new(item, facts, valid_labels, &self.config, now);
        let mut actions = ActionSet::new();

        for clause in CLAUSES {
            match (clause.run)(&ctx, &mut actions) {
                ClauseFlow::Continue => {}
                ClauseFlow::Halt => {
                    debug!(item = item.number, clause = clause.name, "short-circuit");
                    break;
                }
            }
        }

        actions.normalize();
        self.enforce_invariants(item, facts, &actions, now)?;
        Ok(actions)
    }

    /// Oscillation invariants over a finalized action set. Exposed separately
    /// so contradictory inputs can be checked without running the clauses.
    pub fn enforce_invariants(
        &self,
        item: &TrackedItem,
        facts: &FactStore,
        actions: &ActionSet,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let overrides = facts.get_list("label_waffling_overrides");
        let lookback = Duration::days(self.config.waffle_lookback_days);

        for label in actions.touched_labels() {
            if overrides.iter().any(|o| *o == label) {
                continue;
            }
            if waffling::is_waffling(
                &item.label_events,
                &label,
                self.config.waffle_tolerance,
                lookback,
                now,
            ) {
                error!(item = item.number, label = %label, "label is waffling");
                return Err(ShepherdError::policy_conflict(
                    item.number,
                    label,
                    "is waffling",
                ));
            }
            if actions.will_add(&label) && actions.will_remove(&label) {
                error!(item = item.number, label = %label, "label proposed for add and remove");
                return Err(ShepherdError::policy_conflict(
                    item.number,
                    label,
                    "proposed for both addition and removal",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::test_support::{issue, pull_request, ts};
    use crate::item::{CommandEvent, LabelEvent};

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(EngineConfig {
            seed_needs_triage: false,
            ..EngineConfig::default()
        })
    }

    fn labels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn reconcile(
        eng: &ReconciliationEngine,
        item: &TrackedItem,
        facts: &FactStore,
    ) -> Result<ActionSet> {
        let valid = labels(&[
            "needs_info",
            "needs_triage",
            "affects_2.10",
            "affects_2.9",
            "networking",
            "windows",
            "bug",
        ]);
        eng.reconcile(item, facts, &valid, ts(1000))
    }

    // -------------------------------------------------------------------------
    // needs_info convergence
    // -------------------------------------------------------------------------

    #[test]
    fn test_needs_info_removed_when_fact_false() {
        let mut item = issue(1);
        item.labels.insert("needs_info".into());
        let mut facts = FactStore::new();
        facts.set("is_needs_info", false);

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert_eq!(actions.remove_labels, vec!["needs_info"]);
        assert!(actions.add_labels.is_empty());
        assert!(actions.comments.is_empty());
        assert!(!actions.close);
    }

    // -------------------------------------------------------------------------
    // Idempotence: a converged state reconciles to a no-op
    // -------------------------------------------------------------------------

    #[test]
    fn test_converged_state_is_noop() {
        let mut item = issue(2);
        item.labels.insert("needs_info".into());
        let mut facts = FactStore::new();
        facts.set("is_needs_info", true);

        let first = reconcile(&engine(), &item, &facts).unwrap();
        assert!(first.is_noop());

        let second = reconcile(&engine(), &item, &facts).unwrap();
        assert!(second.add_labels.is_empty());
        assert!(second.remove_labels.is_empty());
    }

    // -------------------------------------------------------------------------
    // Manual-override respect
    // -------------------------------------------------------------------------

    #[test]
    fn test_human_removed_label_not_re_added() {
        let mut item = issue(3);
        item.label_events = vec![
            LabelEvent::new("networking", LabelAction::Applied, "shepherd", ts(0)),
            LabelEvent::new("networking", LabelAction::Removed, "alice", ts(1)),
        ];
        let mut facts = FactStore::new();
        facts.set("component_labels", vec!["networking".to_string()]);

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(!actions.will_add("networking"));
    }

    #[test]
    fn test_bot_removed_label_is_re_added() {
        let mut item = issue(4);
        item.label_events = vec![
            LabelEvent::new("networking", LabelAction::Applied, "shepherd", ts(0)),
            LabelEvent::new("networking", LabelAction::Removed, "shepherd", ts(1)),
        ];
        let mut facts = FactStore::new();
        facts.set("component_labels", vec!["networking".to_string()]);

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.will_add("networking"));
    }

    #[test]
    fn test_human_added_label_not_removed() {
        let mut item = pull_request(5);
        item.labels.insert("shipit".into());
        item.label_events = vec![LabelEvent::new(
            "shipit",
            LabelAction::Applied,
            "alice",
            ts(0),
        )];
        let facts = FactStore::new(); // shipit fact absent => falsy

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(!actions.will_remove("shipit"));
    }

    // -------------------------------------------------------------------------
    // Oscillation guard
    // -------------------------------------------------------------------------

    #[test]
    fn test_waffling_label_aborts_with_policy_conflict() {
        let mut item = issue(6);
        // four alternations inside the lookback window
        item.label_events = (0..5)
            .map(|i| {
                let action = if i % 2 == 0 {
                    LabelAction::Applied
                } else {
                    LabelAction::Removed
                };
                LabelEvent::new("needs_info", action, "someone", ts(990 + i))
            })
            .collect();
        let mut facts = FactStore::new();
        facts.set("is_needs_info", true);

        let err = reconcile(&engine(), &item, &facts).unwrap_err();
        assert!(matches!(err, ShepherdError::PolicyConflict { ref label, .. } if label == "needs_info"));
    }

    #[test]
    fn test_waffling_override_exempts_label() {
        let mut item = issue(7);
        item.label_events = (0..5)
            .map(|i| {
                let action = if i % 2 == 0 {
                    LabelAction::Applied
                } else {
                    LabelAction::Removed
                };
                LabelEvent::new("needs_info", action, "someone", ts(990 + i))
            })
            .collect();
        let mut facts = FactStore::new();
        facts.set("is_needs_info", true);
        facts.set("label_waffling_overrides", vec!["needs_info".to_string()]);

        assert!(reconcile(&engine(), &item, &facts).is_ok());
    }

    #[test]
    fn test_add_and_remove_same_label_is_conflict() {
        let item = issue(8);
        let facts = FactStore::new();
        let mut actions = ActionSet::new();
        actions.add_label("module");
        actions.remove_label("module");
        actions.normalize();

        let err = engine()
            .enforce_invariants(&item, &facts, &actions, ts(0))
            .unwrap_err();
        assert!(matches!(err, ShepherdError::PolicyConflict { ref label, .. } if label == "module"));
    }

    // -------------------------------------------------------------------------
    // Short-circuit gates
    // -------------------------------------------------------------------------

    #[test]
    fn test_bot_broken_halts_everything() {
        let mut item = issue(9);
        item.command_events = vec![CommandEvent::new("anyone", "bot_broken", ts(0))];
        let mut facts = FactStore::new();
        facts.set("is_needs_info", true);

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert_eq!(actions.add_labels, vec!["bot_broken"]);
        // needs_info clause never ran
        assert!(!actions.will_add("needs_info"));
    }

    #[test]
    fn test_bot_broken_negation_unwinds() {
        let mut item = issue(10);
        item.labels.insert("bot_broken".into());
        item.command_events = vec![
            CommandEvent::new("anyone", "bot_broken", ts(0)),
            CommandEvent::new("anyone", "!bot_broken", ts(1)),
        ];
        let facts = FactStore::new();

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.will_remove("bot_broken"));
    }

    #[test]
    fn test_bot_skip_from_submitter_halts() {
        let mut item = issue(11);
        item.command_events = vec![CommandEvent::new("reporter", "bot_skip", ts(0))];
        let mut facts = FactStore::new();
        facts.set("is_needs_info", true);

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.is_noop());
    }

    #[test]
    fn test_non_fork_pr_is_closed() {
        let mut item = pull_request(12);
        item.from_fork = false;
        let facts = FactStore::new();

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.close);
        assert!(actions.cancel_ci);
        assert!(actions.cancel_ci_branch);
        assert_eq!(actions.comments.len(), 1);
        // gates run before label clauses: nothing else proposed
        assert!(actions.add_labels.is_empty());
    }

    #[test]
    fn test_missing_incoming_ref_closes_and_cancels() {
        let mut item = pull_request(13);
        item.incoming_repo_exists = false;
        let facts = FactStore::new();

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.close);
        assert!(actions.cancel_ci_branch);
    }

    #[test]
    fn test_unknown_mergeable_state_skips() {
        let mut item = pull_request(14);
        item.mergeable_state = Some("unknown".into());
        let mut facts = FactStore::new();
        facts.set("is_needs_rebase", true);

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.is_noop());
    }

    // -------------------------------------------------------------------------
    // Label clauses
    // -------------------------------------------------------------------------

    #[test]
    fn test_triage_seed_and_legacy_migration() {
        let eng = ReconciliationEngine::new(EngineConfig::default());
        let mut item = issue(15);
        item.labels.insert("triage".into());
        let facts = FactStore::new();

        let actions = reconcile(&eng, &item, &facts).unwrap();
        assert!(actions.will_add("needs_triage"));
        assert!(actions.will_remove("triage"));
    }

    #[test]
    fn test_wip_strips_shipit() {
        let mut item = pull_request(16);
        item.work_in_progress = true;
        item.labels.insert("shipit".into());
        let facts = FactStore::new();

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.will_add("WIP"));
        assert!(actions.will_remove("shipit"));
    }

    #[test]
    fn test_version_family_mutual_exclusion() {
        let mut item = issue(17);
        item.labels.insert("affects_2.9".into());
        let mut facts = FactStore::new();
        facts.set("affects_version", "2.10");

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.will_add("affects_2.10"));
        assert!(actions.will_remove("affects_2.9"));
    }

    #[test]
    fn test_version_family_unknown_label_skipped() {
        let item = issue(18);
        let mut facts = FactStore::new();
        facts.set("affects_version", "9.99"); // not in valid label set

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.add_labels.is_empty());
    }

    #[test]
    fn test_terminal_commands_close() {
        let mut item = issue(19);
        item.command_events = vec![CommandEvent::new("alice", "wontfix", ts(0))];
        let mut facts = FactStore::new();
        facts.set("maintainers", vec!["alice".to_string()]);

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.close);
    }

    #[test]
    fn test_terminal_command_from_non_maintainer_ignored() {
        let mut item = issue(20);
        item.command_events = vec![CommandEvent::new("driveby", "wontfix", ts(0))];
        let facts = FactStore::new();

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(!actions.close);
    }

    #[test]
    fn test_resolved_by_pr_closes_only_when_merged() {
        let mut item = issue(21);
        item.command_events = vec![CommandEvent::new("alice", "resolved_by_pr #100", ts(0))];
        let mut facts = FactStore::new();
        facts.set("maintainers", vec!["alice".to_string()]);
        facts.set(
            "resolved_by_pr",
            crate::facts::FactValue::Record(serde_json::json!({"number": 100, "merged": false})),
        );
        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(!actions.close);

        let mut facts = FactStore::new();
        facts.set("maintainers", vec!["alice".to_string()]);
        facts.set(
            "resolved_by_pr",
            crate::facts::FactValue::Record(serde_json::json!({"number": 100, "merged": true})),
        );
        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.close);
    }

    #[test]
    fn test_label_commands_override_automatic_removal() {
        let mut item = pull_request(22);
        item.labels.insert("stale_ci".into());
        let mut facts = FactStore::new();
        // stale_ci fact false would remove it, but a human said keep it
        facts.set("ci_stale", false);
        facts.set("label_cmds_add", vec!["stale_ci".to_string()]);

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(!actions.will_remove("stale_ci"));
    }

    #[test]
    fn test_rebuild_strips_stale_ci() {
        let mut item = pull_request(23);
        item.labels.insert("stale_ci".into());
        let mut facts = FactStore::new();
        facts.set("ci_stale", true); // would normally keep/add stale_ci
        facts.set("needs_rebuild_all", true);

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.rebuild);
        assert!(!actions.will_add("stale_ci"));
        assert!(actions.will_remove("stale_ci"));
    }

    #[test]
    fn test_admin_merge_blocked_by_needs_rebuild() {
        let item = pull_request(24);
        let mut facts = FactStore::new();
        facts.set("admin_merge", true);
        facts.set("needs_rebuild", true);
        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(!actions.merge);

        let mut facts = FactStore::new();
        facts.set("admin_merge", true);
        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.merge);
    }

    #[test]
    fn test_automerge_requires_config_enable() {
        let mut item = pull_request(25);
        item.labels.insert("needs_ci".into());
        let mut facts = FactStore::new();
        facts.set("shipit", true);
        facts.set("automerge", true);
        facts.set("has_ci", true);

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.will_add("shipit"));
        assert!(actions.will_add("automerge"));
        assert!(!actions.merge);

        let eng = ReconciliationEngine::new(EngineConfig {
            automerge_enabled: true,
            seed_needs_triage: false,
            ..EngineConfig::default()
        });
        let actions = reconcile(&eng, &item, &facts).unwrap();
        assert!(actions.merge);
    }

    #[test]
    fn test_bad_item_strips_notifications() {
        let mut item = pull_request(26);
        let mut facts = FactStore::new();
        facts.set("is_bad_item", true);
        facts.set("bad_item_reason", "empty diff");
        // a CI failure comment would normally be queued with an @mention
        facts.set("has_ci", true);
        facts.set("ci_state", "failure");
        facts.set("needs_testresult_notification", true);
        facts.set("ci_test_results", "FAILED: everything");
        item.labels.insert("needs_triage".into());

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        // the bad-item clause ran last: only its own comment survives
        assert_eq!(actions.comments.len(), 1);
        assert!(actions.comments[0].contains("cannot be processed"));
        // bad item still gets the revision/rebase markers
        assert!(actions.will_add("needs_revision"));
        assert!(actions.will_add("needs_rebase"));
    }

    #[test]
    fn test_spam_comment_deletion() {
        let mut item = issue(27);
        item.command_events.clear();
        let mut facts = FactStore::new();
        facts.set(
            "spam_comment_ids",
            vec!["101".to_string(), "bogus".to_string(), "102".to_string()],
        );

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert_eq!(actions.delete_comments, vec![101, 102]);
    }

    #[test]
    fn test_output_labels_sorted() {
        let mut item = issue(28);
        let mut facts = FactStore::new();
        facts.set(
            "component_labels",
            vec!["windows".to_string(), "networking".to_string()],
        );
        facts.set("issue_type", "bug report");
        item.labels.clear();

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        let mut sorted = actions.add_labels.clone();
        sorted.sort();
        assert_eq!(actions.add_labels, sorted);
        assert!(actions.will_add("bug"));
        assert!(actions.will_add("networking"));
        assert!(actions.will_add("windows"));
    }

    #[test]
    fn test_oversized_ci_comment_dropped() {
        let mut item = pull_request(29);
        item.labels.insert("needs_ci".into());
        let mut facts = FactStore::new();
        facts.set("has_ci", true);
        facts.set("ci_state", "failure");
        facts.set("needs_testresult_notification", true);
        facts.set("ci_test_results", "x".repeat(70_000));

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.comments.is_empty());
    }

    #[test]
    fn test_needs_info_close_action() {
        let mut item = issue(30);
        let mut facts = FactStore::new();
        facts.set("is_needs_info", true);
        facts.set("needs_info_action", "close");

        let actions = reconcile(&engine(), &item, &facts).unwrap();
        assert!(actions.close);
        assert!(actions.will_add("needs_info"));
        assert_eq!(actions.comments.len(), 1);
    }
}
