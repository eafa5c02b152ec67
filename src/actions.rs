//! Action accumulator for one reconciliation pass.
//!
//! An [`ActionSet`] collects the mutations a pass proposes. Labels are kept
//! as raw proposal lists until [`ActionSet::normalize`] deduplicates and
//! sorts them; comments are deduplicated and size-capped at insertion time
//! because posting is not idempotent on the remote side.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Remote APIs reject bodies beyond this size; larger comments are dropped
/// whole, never truncated.
pub const MAX_COMMENT_BYTES: usize = 65_536;

/// Accumulated mutations for one item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionSet {
    /// Labels proposed for addition (raw, possibly duplicated until normalize)
    pub add_labels: Vec<String>,
    /// Labels proposed for removal
    pub remove_labels: Vec<String>,
    /// Comment bodies in posting order
    pub comments: Vec<String>,
    /// Comment ids to delete
    pub delete_comments: Vec<u64>,
    pub close: bool,
    pub merge: bool,
    /// Re-run the full CI build
    pub rebuild: bool,
    /// Re-run only the failed CI jobs
    pub rebuild_failed_only: bool,
    pub cancel_ci: bool,
    pub cancel_ci_branch: bool,
}

impl ActionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_label(&mut self, label: impl Into<String>) {
        self.add_labels.push(label.into());
    }

    pub fn remove_label(&mut self, label: impl Into<String>) {
        self.remove_labels.push(label.into());
    }

    /// Withdraw a pending addition (used by explicit label commands).
    pub fn cancel_add(&mut self, label: &str) {
        self.add_labels.retain(|l| l != label);
    }

    /// Withdraw a pending removal.
    pub fn cancel_remove(&mut self, label: &str) {
        self.remove_labels.retain(|l| l != label);
    }

    pub fn will_add(&self, label: &str) -> bool {
        self.add_labels.iter().any(|l| l == label)
    }

    pub fn will_remove(&self, label: &str) -> bool {
        self.remove_labels.iter().any(|l| l == label)
    }

    /// Queue a comment body. A byte-identical body already queued is skipped;
    /// an oversized body is dropped entirely to respect remote body limits.
    pub fn push_comment(&mut self, body: impl Into<String>) {
        let body = body.into();
        if body.len() >= MAX_COMMENT_BYTES {
            warn!(
                bytes = body.len(),
                "dropping oversized comment ({} byte limit)", MAX_COMMENT_BYTES
            );
            return;
        }
        if self.comments.iter().any(|c| c == &body) {
            return;
        }
        self.comments.push(body);
    }

    /// Drop queued comments that mention users. Used by terminal
    /// classifications that must not ping notification lists.
    pub fn strip_mention_comments(&mut self) {
        self.comments.retain(|c| !c.contains('@'));
    }

    pub fn delete_comment(&mut self, comment_id: u64) {
        if !self.delete_comments.contains(&comment_id) {
            self.delete_comments.push(comment_id);
        }
    }

    /// Deduplicate and lexicographically sort the label proposal lists.
    pub fn normalize(&mut self) {
        let adds: BTreeSet<String> = self.add_labels.drain(..).collect();
        let removes: BTreeSet<String> = self.remove_labels.drain(..).collect();
        self.add_labels = adds.into_iter().collect();
        self.remove_labels = removes.into_iter().collect();
    }

    /// Labels appearing in both the add and remove proposals. Must be empty
    /// after reconciliation; a non-empty intersection is a policy conflict.
    pub fn conflicting_labels(&self) -> Vec<String> {
        self.add_labels
            .iter()
            .filter(|l| self.will_remove(l))
            .cloned()
            .collect()
    }

    /// Every label this pass touches, in sorted order.
    pub fn touched_labels(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = self.add_labels.iter().cloned().collect();
        all.extend(self.remove_labels.iter().cloned());
        all.into_iter().collect()
    }

    /// True when applying this set would change nothing on the tracker.
    pub fn is_noop(&self) -> bool {
        self.add_labels.is_empty()
            && self.remove_labels.is_empty()
            && self.comments.is_empty()
            && self.delete_comments.is_empty()
            && !self.close
            && !self.merge
            && !self.rebuild
            && !self.rebuild_failed_only
            && !self.cancel_ci
            && !self.cancel_ci_branch
    }

    /// True when applying this set changes tracker state in a way that
    /// invalidates previously computed facts.
    pub fn alters_state(&self) -> bool {
        self.close || self.merge || self.rebuild || self.rebuild_failed_only
    }
}
