//! Remote tracker API boundary.
//!
//! [`RemoteApi`] is the full surface the triage loop consumes; [`HttpRemote`]
//! is the reqwest-backed implementation against a generic authenticated JSON
//! tracker API. Label mutations are idempotent on the remote side; comment
//! posting is not, which is why deduplication happens in the action set
//! before anything reaches this layer.
//!
//! Every method returns [`RemoteError`], whose [`RemoteError::class`] drives
//! the retry governor's backoff choice.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::governor::{FailureClass, QuotaSnapshot, QuotaSource};
use crate::item::{CommandEvent, ItemKind, LabelAction, LabelEvent, TrackedItem};

/// Failure surface of one remote call.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Quota window exhausted
    #[error("rate limit exceeded")]
    RateLimited,

    /// Network or protocol hiccup
    #[error("network error: {0}")]
    Network(String),

    /// Remote-side 5xx
    #[error("server error: HTTP {0}")]
    ServerError(u16),

    /// Target object no longer exists
    #[error("object not found")]
    NotFound,

    /// Feature disabled for the target repository
    #[error("feature disabled on remote")]
    Disabled,

    /// Credentials rejected
    #[error("unauthorized")]
    Unauthorized,

    /// Response that could not be classified
    #[error("unclassified remote failure: {0}")]
    Unknown(String),
}

impl RemoteError {
    /// Map this error onto the governor's retry classes.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::RateLimited => FailureClass::RateLimited,
            Self::Network(_) | Self::ServerError(_) => FailureClass::Transient,
            Self::NotFound | Self::Disabled => FailureClass::BenignAbsent,
            Self::Unauthorized => FailureClass::Fatal,
            Self::Unknown(_) => FailureClass::QuotaUnknown,
        }
    }

    fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 => Self::Unauthorized,
            403 | 429 => Self::RateLimited,
            404 | 410 => Self::NotFound,
            s if s >= 500 => Self::ServerError(s),
            s => Self::Unknown(format!("HTTP {s}")),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status);
        }
        Self::Network(err.to_string())
    }
}

/// The remote surface the triage loop consumes.
///
/// Fine-grained mutation methods exist so the governor can wrap each call
/// individually; the loop applies them in a fixed order so a close never
/// races ahead of the comments explaining it.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Open item numbers, oldest first.
    async fn list_open_items(&self) -> Result<Vec<u64>, RemoteError>;
    /// Labels defined on the repository.
    async fn list_repo_labels(&self) -> Result<Vec<String>, RemoteError>;

    async fn fetch_item(&self, id: u64) -> Result<TrackedItem, RemoteError>;
    async fn list_label_events(&self, id: u64) -> Result<Vec<LabelEvent>, RemoteError>;
    async fn list_comment_events(&self, id: u64) -> Result<Vec<CommandEvent>, RemoteError>;

    async fn add_labels(&self, id: u64, labels: &[String]) -> Result<(), RemoteError>;
    async fn remove_label(&self, id: u64, label: &str) -> Result<(), RemoteError>;
    async fn post_comment(&self, id: u64, body: &str) -> Result<(), RemoteError>;
    async fn delete_comment(&self, comment_id: u64) -> Result<(), RemoteError>;
    async fn close_item(&self, id: u64) -> Result<(), RemoteError>;
    async fn merge_item(&self, id: u64) -> Result<(), RemoteError>;

    async fn is_pr_merged(&self, id: u64) -> Result<bool, RemoteError>;
    async fn quota_check(&self) -> Result<QuotaSnapshot, RemoteError>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawActor {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawPullInfo {
    /// Trackers that do not report this must not have their PRs closed as
    /// reference-less, so absence reads as present.
    #[serde(default = "default_true")]
    head_repo_exists: bool,
    #[serde(default)]
    from_fork: bool,
    mergeable_state: Option<String>,
    head_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    number: u64,
    title: String,
    user: RawActor,
    state: String,
    labels: Vec<RawLabel>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    pull_request: Option<RawPullInfo>,
}

#[derive(Debug, Deserialize)]
struct RawLabelEvent {
    label: RawLabel,
    event: String,
    actor: RawActor,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawCommandEvent {
    actor: RawActor,
    command: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawMergeState {
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct RawQuota {
    remaining: i64,
    /// UTC epoch seconds of the window reset
    reset: i64,
}

fn wip_title(title: &str) -> bool {
    let t = title.trim_start();
    t.starts_with("WIP") || t.starts_with("[WIP]") || t.to_lowercase().starts_with("wip:")
}

impl RawItem {
    fn into_item(self) -> TrackedItem {
        let kind = if self.pull_request.is_some() {
            ItemKind::PullRequest
        } else {
            ItemKind::Issue
        };
        let pull = self.pull_request;
        TrackedItem {
            number: self.number,
            kind,
            work_in_progress: kind == ItemKind::PullRequest && wip_title(&self.title),
            title: self.title,
            submitter: self.user.login,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            is_open: self.state == "open",
            created_at: self.created_at,
            updated_at: self.updated_at,
            label_events: Vec::new(),
            command_events: Vec::new(),
            from_fork: pull.as_ref().is_some_and(|p| p.from_fork),
            incoming_repo_exists: pull.as_ref().map_or(true, |p| p.head_repo_exists),
            head_branch: pull.as_ref().and_then(|p| p.head_branch.clone()),
            mergeable_state: pull.and_then(|p| p.mergeable_state),
        }
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Authenticated JSON client for the tracker API.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status));
        }
        response.json().await.map_err(RemoteError::from)
    }

    async fn send_empty(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), RemoteError> {
        let mut request = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn list_open_items(&self) -> Result<Vec<u64>, RemoteError> {
        #[derive(Deserialize)]
        struct Numbered {
            number: u64,
        }
        let raw: Vec<Numbered> = self.get_json("/items?state=open").await?;
        Ok(raw.into_iter().map(|n| n.number).collect())
    }

    async fn list_repo_labels(&self) -> Result<Vec<String>, RemoteError> {
        let raw: Vec<RawLabel> = self.get_json("/labels").await?;
        Ok(raw.into_iter().map(|l| l.name).collect())
    }

    async fn fetch_item(&self, id: u64) -> Result<TrackedItem, RemoteError> {
        let raw: RawItem = self.get_json(&format!("/items/{id}")).await?;
        let mut item = raw.into_item();
        item.label_events = self.list_label_events(id).await?;
        item.command_events = self.list_comment_events(id).await?;
        Ok(item)
    }

    async fn list_label_events(&self, id: u64) -> Result<Vec<LabelEvent>, RemoteError> {
        let raw: Vec<RawLabelEvent> = self.get_json(&format!("/items/{id}/label-events")).await?;
        Ok(raw
            .into_iter()
            .filter_map(|e| {
                let action = match e.event.as_str() {
                    "labeled" => LabelAction::Applied,
                    "unlabeled" => LabelAction::Removed,
                    _ => return None,
                };
                Some(LabelEvent::new(e.label.name, action, e.actor.login, e.created_at))
            })
            .collect())
    }

    async fn list_comment_events(&self, id: u64) -> Result<Vec<CommandEvent>, RemoteError> {
        let raw: Vec<RawCommandEvent> =
            self.get_json(&format!("/items/{id}/command-events")).await?;
        Ok(raw
            .into_iter()
            .map(|e| CommandEvent::new(e.actor.login, e.command, e.created_at))
            .collect())
    }

    async fn add_labels(&self, id: u64, labels: &[String]) -> Result<(), RemoteError> {
        self.send_empty(
            reqwest::Method::POST,
            &format!("/items/{id}/labels"),
            Some(serde_json::json!({ "labels": labels })),
        )
        .await
    }

    async fn remove_label(&self, id: u64, label: &str) -> Result<(), RemoteError> {
        self.send_empty(
            reqwest::Method::DELETE,
            &format!("/items/{id}/labels/{label}"),
            None,
        )
        .await
    }

    async fn post_comment(&self, id: u64, body: &str) -> Result<(), RemoteError> {
        self.send_empty(
            reqwest::Method::POST,
            &format!("/items/{id}/comments"),
            Some(serde_json::json!({ "body": body })),
        )
        .await
    }

    async fn delete_comment(&self, comment_id: u64) -> Result<(), RemoteError> {
        self.send_empty(
            reqwest::Method::DELETE,
            &format!("/comments/{comment_id}"),
            None,
        )
        .await
    }

    async fn close_item(&self, id: u64) -> Result<(), RemoteError> {
        self.send_empty(
            reqwest::Method::PATCH,
            &format!("/items/{id}"),
            Some(serde_json::json!({ "state": "closed" })),
        )
        .await
    }

    async fn merge_item(&self, id: u64) -> Result<(), RemoteError> {
        self.send_empty(reqwest::Method::PUT, &format!("/items/{id}/merge"), None)
            .await
    }

    async fn is_pr_merged(&self, id: u64) -> Result<bool, RemoteError> {
        let raw: RawMergeState = self.get_json(&format!("/items/{id}/merge")).await?;
        Ok(raw.merged)
    }

    async fn quota_check(&self) -> Result<QuotaSnapshot, RemoteError> {
        let raw: RawQuota = self.get_json("/rate_limit").await?;
        let reset_at = Utc
            .timestamp_opt(raw.reset, 0)
            .single()
            .ok_or_else(|| RemoteError::Unknown(format!("bad reset epoch {}", raw.reset)))?;
        Ok(QuotaSnapshot {
            remaining: raw.remaining,
            reset_at,
        })
    }
}

#[async_trait]
impl QuotaSource for HttpRemote {
    async fn check(&self) -> Result<QuotaSnapshot, RemoteError> {
        self.quota_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(RemoteError::RateLimited.class(), FailureClass::RateLimited);
        assert_eq!(
            RemoteError::Network("reset".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(RemoteError::ServerError(502).class(), FailureClass::Transient);
        assert_eq!(RemoteError::NotFound.class(), FailureClass::BenignAbsent);
        assert_eq!(RemoteError::Disabled.class(), FailureClass::BenignAbsent);
        assert_eq!(RemoteError::Unauthorized.class(), FailureClass::Fatal);
        assert_eq!(
            RemoteError::Unknown("?".into()).class(),
            FailureClass::QuotaUnknown
        );
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            RemoteError::from_status(StatusCode::UNAUTHORIZED),
            RemoteError::Unauthorized
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::FORBIDDEN),
            RemoteError::RateLimited
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::NOT_FOUND),
            RemoteError::NotFound
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::BAD_GATEWAY),
            RemoteError::ServerError(502)
        ));
    }

    #[test]
    fn test_wip_title_detection() {
        assert!(wip_title("WIP: fix the thing"));
        assert!(wip_title("[WIP] fix the thing"));
        assert!(wip_title("wip: lowercase"));
        assert!(!wip_title("fix the WIP detector"));
    }

    #[test]
    fn test_raw_item_conversion() {
        let raw: RawItem = serde_json::from_value(serde_json::json!({
            "number": 42,
            "title": "WIP: new connection pool",
            "user": {"login": "alice"},
            "state": "open",
            "labels": [{"name": "needs_triage"}],
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-02T00:00:00Z",
            "pull_request": {
                "head_repo_exists": true,
                "from_fork": true,
                "mergeable_state": "clean"
            }
        }))
        .unwrap();
        let item = raw.into_item();
        assert_eq!(item.number, 42);
        assert_eq!(item.kind, ItemKind::PullRequest);
        assert!(item.work_in_progress);
        assert!(item.from_fork);
        assert!(item.has_label("needs_triage"));
    }

    #[test]
    fn test_raw_item_issue_defaults() {
        let raw: RawItem = serde_json::from_value(serde_json::json!({
            "number": 7,
            "title": "panic on empty config",
            "user": {"login": "bob"},
            "state": "closed",
            "labels": [],
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-02T00:00:00Z",
            "pull_request": null
        }))
        .unwrap();
        let item = raw.into_item();
        assert_eq!(item.kind, ItemKind::Issue);
        assert!(!item.is_open);
        assert!(item.incoming_repo_exists);
        assert!(!item.work_in_progress);
    }
}
