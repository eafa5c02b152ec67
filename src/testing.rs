//! Testing infrastructure: in-memory doubles for the remote boundaries.
//!
//! [`MockRemote`] is a full in-memory tracker that records every mutation in
//! call order, so tests can assert both the outcome and the apply ordering.
//! [`MockCi`] serves a preset status and records control calls. Both are
//! ordinary library types so integration tests can drive the real triage
//! loop against them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::ci::{CiProvider, CiStatus};
use crate::governor::{QuotaSnapshot, QuotaSource};
use crate::item::{CommandEvent, LabelEvent, TrackedItem};
use crate::remote::{RemoteApi, RemoteError};

/// In-memory tracker with a recorded mutation log.
#[derive(Default)]
pub struct MockRemote {
    items: Mutex<HashMap<u64, TrackedItem>>,
    merged: Mutex<BTreeSet<u64>>,
    repo_labels: Mutex<Vec<String>>,
    /// Every mutation in call order, e.g. `remove_label:7:needs_info`
    calls: Mutex<Vec<String>>,
    /// Errors to inject, consumed one per matching call name
    failures: Mutex<Vec<(String, RemoteError)>>,
    quota_remaining: Mutex<i64>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            quota_remaining: Mutex::new(5000),
            ..Self::default()
        }
    }

    pub fn insert_item(&self, item: TrackedItem) {
        self.items.lock().unwrap().insert(item.number, item);
    }

    pub fn set_repo_labels(&self, labels: &[&str]) {
        *self.repo_labels.lock().unwrap() = labels.iter().map(|s| s.to_string()).collect();
    }

    pub fn mark_merged(&self, id: u64) {
        self.merged.lock().unwrap().insert(id);
    }

    /// Queue an error for the next call whose name matches.
    pub fn fail_next(&self, call: &str, error: RemoteError) {
        self.failures.lock().unwrap().push((call.to_string(), error));
    }

    /// Recorded mutation log, in call order.
    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn item(&self, id: u64) -> Option<TrackedItem> {
        self.items.lock().unwrap().get(&id).cloned()
    }

    fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    fn take_failure(&self, call: &str) -> Option<RemoteError> {
        let mut failures = self.failures.lock().unwrap();
        let idx = failures.iter().position(|(name, _)| name == call)?;
        Some(failures.remove(idx).1)
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn list_open_items(&self) -> Result<Vec<u64>, RemoteError> {
        if let Some(err) = self.take_failure("list_open_items") {
            return Err(err);
        }
        let mut ids: Vec<u64> = self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.is_open)
            .map(|i| i.number)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn list_repo_labels(&self) -> Result<Vec<String>, RemoteError> {
        Ok(self.repo_labels.lock().unwrap().clone())
    }

    async fn fetch_item(&self, id: u64) -> Result<TrackedItem, RemoteError> {
        if let Some(err) = self.take_failure("fetch_item") {
            return Err(err);
        }
        self.items
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    async fn list_label_events(&self, id: u64) -> Result<Vec<LabelEvent>, RemoteError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(&id)
            .map(|i| i.label_events.clone())
            .unwrap_or_default())
    }

    async fn list_comment_events(&self, id: u64) -> Result<Vec<CommandEvent>, RemoteError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(&id)
            .map(|i| i.command_events.clone())
            .unwrap_or_default())
    }

    async fn add_labels(&self, id: u64, labels: &[String]) -> Result<(), RemoteError> {
        if let Some(err) = self.take_failure("add_labels") {
            return Err(err);
        }
        self.record(format!("add_labels:{id}:{}", labels.join(",")));
        if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
            item.labels.extend(labels.iter().cloned());
        }
        Ok(())
    }

    async fn remove_label(&self, id: u64, label: &str) -> Result<(), RemoteError> {
        if let Some(err) = self.take_failure("remove_label") {
            return Err(err);
        }
        self.record(format!("remove_label:{id}:{label}"));
        if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
            item.labels.remove(label);
        }
        Ok(())
    }

    async fn post_comment(&self, id: u64, body: &str) -> Result<(), RemoteError> {
        if let Some(err) = self.take_failure("post_comment") {
            return Err(err);
        }
        let head: String = body.chars().take(24).collect();
        self.record(format!("post_comment:{id}:{head}"));
        Ok(())
    }

    async fn delete_comment(&self, comment_id: u64) -> Result<(), RemoteError> {
        self.record(format!("delete_comment:{comment_id}"));
        Ok(())
    }

    async fn close_item(&self, id: u64) -> Result<(), RemoteError> {
        if let Some(err) = self.take_failure("close_item") {
            return Err(err);
        }
        self.record(format!("close_item:{id}"));
        if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
            item.is_open = false;
        }
        Ok(())
    }

    async fn merge_item(&self, id: u64) -> Result<(), RemoteError> {
        if let Some(err) = self.take_failure("merge_item") {
            return Err(err);
        }
        self.record(format!("merge_item:{id}"));
        self.merged.lock().unwrap().insert(id);
        if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
            item.is_open = false;
        }
        Ok(())
    }

    async fn is_pr_merged(&self, id: u64) -> Result<bool, RemoteError> {
        Ok(self.merged.lock().unwrap().contains(&id))
    }

    async fn quota_check(&self) -> Result<QuotaSnapshot, RemoteError> {
        Ok(QuotaSnapshot {
            remaining: *self.quota_remaining.lock().unwrap(),
            reset_at: Utc::now() + chrono::Duration::minutes(30),
        })
    }
}

#[async_trait]
impl QuotaSource for MockRemote {
    async fn check(&self) -> Result<QuotaSnapshot, RemoteError> {
        self.quota_check().await
    }
}

/// CI double serving a preset status and recording control calls.
#[derive(Default, Debug)]
pub struct MockCi {
    status: Mutex<Option<CiStatus>>,
    calls: Mutex<Vec<String>>,
}

impl MockCi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: CiStatus) -> Self {
        Self {
            status: Mutex::new(Some(status)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CiProvider for MockCi {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn status(&self, _item: &TrackedItem) -> Result<Option<CiStatus>, RemoteError> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn rebuild(&self, run_id: u64) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(format!("rebuild:{run_id}"));
        Ok(())
    }

    async fn rebuild_failed(&self, run_id: u64) -> Result<(), RemoteError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("rebuild_failed:{run_id}"));
        Ok(())
    }

    async fn cancel(&self, run_id: u64) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(format!("cancel:{run_id}"));
        Ok(())
    }

    async fn cancel_on_branch(&self, branch: &str) -> Result<(), RemoteError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("cancel_on_branch:{branch}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::test_support::issue;

    #[tokio::test]
    async fn test_mock_remote_mutations_visible_on_refetch() {
        let remote = MockRemote::new();
        remote.insert_item(issue(1));

        remote.add_labels(1, &["bug".to_string()]).await.unwrap();
        remote.close_item(1).await.unwrap();

        let item = remote.fetch_item(1).await.unwrap();
        assert!(item.has_label("bug"));
        assert!(!item.is_open);
        assert_eq!(
            remote.call_log(),
            vec!["add_labels:1:bug", "close_item:1"]
        );
    }

    #[tokio::test]
    async fn test_mock_remote_injected_failure_consumed_once() {
        let remote = MockRemote::new();
        remote.insert_item(issue(1));
        remote.fail_next("fetch_item", RemoteError::ServerError(502));

        assert!(remote.fetch_item(1).await.is_err());
        assert!(remote.fetch_item(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_remote_missing_item_is_not_found() {
        let remote = MockRemote::new();
        let err = remote.fetch_item(404).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound));
    }
}
