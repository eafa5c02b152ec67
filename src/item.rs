//! Tracked item data model.
//!
//! A [`TrackedItem`] is an immutable snapshot of one issue or pull request,
//! including the chronological label-change log and command log the
//! reconciliation engine reads. Items are only refreshed by re-fetching from
//! the remote tracker; nothing mutates them locally.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Issue,
    PullRequest,
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::Issue => write!(f, "issue"),
            ItemKind::PullRequest => write!(f, "pull request"),
        }
    }
}

/// Direction of one label-change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelAction {
    Applied,
    Removed,
}

/// One entry in an item's label-change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEvent {
    pub label: String,
    pub action: LabelAction,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl LabelEvent {
    pub fn new(
        label: impl Into<String>,
        action: LabelAction,
        actor: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            label: label.into(),
            action,
            actor: actor.into(),
            timestamp,
        }
    }
}

/// One command token extracted from a comment.
///
/// The token carries the full command text (e.g. `resolved_by_pr #19141`);
/// matching is on the leading word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub actor: String,
    pub token: String,
    pub timestamp: DateTime<Utc>,
}

impl CommandEvent {
    pub fn new(
        actor: impl Into<String>,
        token: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            actor: actor.into(),
            token: token.into(),
            timestamp,
        }
    }

    /// Leading word of the token, which is the command name.
    pub fn command(&self) -> &str {
        self.token.split_whitespace().next().unwrap_or("")
    }
}

/// Immutable snapshot of one issue or pull request under triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedItem {
    /// Stable numeric identifier on the tracker
    pub number: u64,
    pub kind: ItemKind,
    pub title: String,
    pub submitter: String,
    /// Current label set
    pub labels: BTreeSet<String>,
    /// False once closed
    pub is_open: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Chronological label-change log, oldest first
    pub label_events: Vec<LabelEvent>,
    /// Chronological command log, oldest first
    pub command_events: Vec<CommandEvent>,

    // Pull-request-only attributes; defaulted for issues.
    /// Head branch lives in a fork of the upstream repo
    #[serde(default)]
    pub from_fork: bool,
    /// Title carries a work-in-progress marker
    #[serde(default)]
    pub work_in_progress: bool,
    /// The repo the PR branch points at still exists
    #[serde(default = "default_true")]
    pub incoming_repo_exists: bool,
    /// Tracker-reported mergeability ("clean", "dirty", "unknown", ...)
    #[serde(default)]
    pub mergeable_state: Option<String>,
    /// Head branch name
    #[serde(default)]
    pub head_branch: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TrackedItem {
    pub fn is_issue(&self) -> bool {
        self.kind == ItemKind::Issue
    }

    pub fn is_pull_request(&self) -> bool {
        self.kind == ItemKind::PullRequest
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// The most recent label-change event for `label`, if any.
    pub fn last_event_for(&self, label: &str) -> Option<&LabelEvent> {
        self.label_events.iter().rev().find(|e| e.label == label)
    }

    /// True when the most recent removal of `label` was performed by a human
    /// actor (not in `bots`). Used to suppress re-adding a label a human
    /// deliberately took off.
    pub fn was_removed_by_human(&self, label: &str, bots: &BTreeSet<String>) -> bool {
        self.label_events
            .iter()
            .rev()
            .find(|e| e.label == label && e.action == LabelAction::Removed)
            .is_some_and(|e| !bots.contains(&e.actor))
    }

    /// True when the most recent addition of `label` was performed by a human
    /// actor. Used to suppress removing a label a human deliberately put on.
    pub fn was_added_by_human(&self, label: &str, bots: &BTreeSet<String>) -> bool {
        self.label_events
            .iter()
            .rev()
            .find(|e| e.label == label && e.action == LabelAction::Applied)
            .is_some_and(|e| !bots.contains(&e.actor))
    }

    /// Age of the item relative to `now`, in whole days.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}
