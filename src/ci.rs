//! CI provider boundary.
//!
//! A [`CiProvider`] reports build status for a pull request and executes the
//! control actions the engine can request (rebuild, rebuild failed jobs only,
//! cancel). Two providers exist, selected by name at startup; an unknown name
//! is a configuration error before any item is processed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::TriageConfig;
use crate::error::{Result, ShepherdError};
use crate::facts::FactStore;
use crate::item::TrackedItem;
use crate::remote::RemoteError;

/// Names accepted by `--ci`.
pub const VALID_CI_PROVIDERS: &[&str] = &["azp", "gha"];

/// Terminal or in-flight state of the newest CI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiState {
    Success,
    Failure,
    Pending,
}

impl CiState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiState::Success => "success",
            CiState::Failure => "failure",
            CiState::Pending => "pending",
        }
    }
}

/// Snapshot of the newest run for one pull request.
#[derive(Debug, Clone)]
pub struct CiStatus {
    pub state: CiState,
    pub run_id: u64,
    pub started_at: DateTime<Utc>,
    /// Parsed failure output, when the provider exposes it
    pub test_results: Option<String>,
}

/// Provider-side status and control surface.
#[async_trait]
pub trait CiProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Newest run for the item's head, None when no run exists yet.
    async fn status(&self, item: &TrackedItem) -> std::result::Result<Option<CiStatus>, RemoteError>;

    async fn rebuild(&self, run_id: u64) -> std::result::Result<(), RemoteError>;
    async fn rebuild_failed(&self, run_id: u64) -> std::result::Result<(), RemoteError>;
    async fn cancel(&self, run_id: u64) -> std::result::Result<(), RemoteError>;
    async fn cancel_on_branch(&self, branch: &str) -> std::result::Result<(), RemoteError>;
}

/// Select a provider by name. Unknown names fail configuration, not triage.
pub fn create_provider(name: &str, config: &TriageConfig) -> Result<Arc<dyn CiProvider>> {
    match name {
        "gha" => Ok(Arc::new(WorkflowCi::new(
            config.remote_url.clone(),
            config.token().unwrap_or_default(),
            config.ci_workflow.clone(),
        ))),
        "azp" => Ok(Arc::new(PipelinesCi::new(
            config.azp_org.clone().unwrap_or_default(),
            config.azp_project.clone().unwrap_or_default(),
            config.token().unwrap_or_default(),
        ))),
        other => Err(ShepherdError::UnknownCiProvider {
            provider: other.to_string(),
            valid: VALID_CI_PROVIDERS.join(", "),
        }),
    }
}

/// Derive the CI fact block for one item.
///
/// `last_notified_run` is the run id the previous pass commented about, from
/// the item snapshot; it keeps the failure comment to one per run.
pub fn get_ci_facts(
    item: &TrackedItem,
    status: Option<&CiStatus>,
    last_notified_run: Option<u64>,
) -> FactStore {
    let mut facts = FactStore::new();
    let Some(status) = status else {
        facts.set("has_ci", false);
        return facts;
    };

    facts.set("has_ci", true);
    facts.set("ci_state", status.state.as_str());
    facts.set("ci_run_number", status.run_id as i64);
    // a run older than the newest push is stale
    facts.set("ci_stale", status.started_at < item.updated_at);

    if status.state == CiState::Failure {
        if let Some(results) = &status.test_results {
            facts.set("ci_test_results", results.clone());
        }
        let already_notified = last_notified_run == Some(status.run_id);
        facts.set("needs_testresult_notification", !already_notified);
    }
    facts
}

// ============================================================================
// Workflow-based provider ("gha")
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawWorkflowRun {
    id: u64,
    status: String,
    conclusion: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    failure_summary: Option<String>,
}

/// Workflow-run provider speaking the same authenticated JSON API as the
/// tracker itself.
#[derive(Debug)]
pub struct WorkflowCi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    workflow: String,
}

impl WorkflowCi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            workflow: workflow.into(),
        }
    }

    async fn post(&self, path: &str) -> std::result::Result<(), RemoteError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(RemoteError::from)?;
        status_to_result(response.status())
    }
}

fn status_to_result(status: StatusCode) -> std::result::Result<(), RemoteError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(match status.as_u16() {
            401 => RemoteError::Unauthorized,
            403 | 429 => RemoteError::RateLimited,
            404 | 410 => RemoteError::NotFound,
            s if s >= 500 => RemoteError::ServerError(s),
            s => RemoteError::Unknown(format!("HTTP {s}")),
        })
    }
}

fn run_to_status(run: RawWorkflowRun) -> CiStatus {
    let state = if run.status == "completed" {
        if run.conclusion.as_deref() == Some("success") {
            CiState::Success
        } else {
            CiState::Failure
        }
    } else {
        CiState::Pending
    };
    CiStatus {
        state,
        run_id: run.id,
        started_at: run.created_at,
        test_results: run.failure_summary,
    }
}

#[async_trait]
impl CiProvider for WorkflowCi {
    fn name(&self) -> &'static str {
        "gha"
    }

    async fn status(&self, item: &TrackedItem) -> std::result::Result<Option<CiStatus>, RemoteError> {
        let url = format!(
            "{}/workflows/{}/runs?item={}",
            self.base_url, self.workflow, item.number
        );
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(RemoteError::from)?;
        let status = response.status();
        if !status.is_success() {
            return status_to_result(status).map(|_| None);
        }
        let mut runs: Vec<RawWorkflowRun> = response.json().await.map_err(RemoteError::from)?;
        // newest first
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs.into_iter().next().map(run_to_status))
    }

    async fn rebuild(&self, run_id: u64) -> std::result::Result<(), RemoteError> {
        self.post(&format!("/runs/{run_id}/rerun")).await
    }

    async fn rebuild_failed(&self, run_id: u64) -> std::result::Result<(), RemoteError> {
        self.post(&format!("/runs/{run_id}/rerun-failed-jobs")).await
    }

    async fn cancel(&self, run_id: u64) -> std::result::Result<(), RemoteError> {
        self.post(&format!("/runs/{run_id}/cancel")).await
    }

    async fn cancel_on_branch(&self, branch: &str) -> std::result::Result<(), RemoteError> {
        self.post(&format!("/runs/cancel?branch={branch}")).await
    }
}

// ============================================================================
// Pipelines-based provider ("azp")
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawBuild {
    id: u64,
    status: String,
    result: Option<String>,
    #[serde(rename = "queueTime")]
    queue_time: DateTime<Utc>,
}

/// Pipeline-build provider addressed by organization and project.
#[derive(Debug)]
pub struct PipelinesCi {
    client: reqwest::Client,
    org: String,
    project: String,
    token: String,
}

impl PipelinesCi {
    pub fn new(org: impl Into<String>, project: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            org: org.into(),
            project: project.into(),
            token: token.into(),
        }
    }

    fn api(&self, path: &str) -> String {
        format!(
            "https://dev.azure.com/{}/{}/_apis{path}",
            self.org, self.project
        )
    }

    async fn patch(&self, path: &str, body: serde_json::Value) -> std::result::Result<(), RemoteError> {
        let response = self
            .client
            .patch(self.api(path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(RemoteError::from)?;
        status_to_result(response.status())
    }
}

#[async_trait]
impl CiProvider for PipelinesCi {
    fn name(&self) -> &'static str {
        "azp"
    }

    async fn status(&self, item: &TrackedItem) -> std::result::Result<Option<CiStatus>, RemoteError> {
        let url = self.api(&format!("/build/builds?branchName=refs/pull/{}/merge", item.number));
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(RemoteError::from)?;
        let status = response.status();
        if !status.is_success() {
            return status_to_result(status).map(|_| None);
        }
        let mut builds: Vec<RawBuild> = response.json().await.map_err(RemoteError::from)?;
        builds.sort_by(|a, b| b.queue_time.cmp(&a.queue_time));
        Ok(builds.into_iter().next().map(|b| {
            let state = if b.status == "completed" {
                if b.result.as_deref() == Some("succeeded") {
                    CiState::Success
                } else {
                    CiState::Failure
                }
            } else {
                CiState::Pending
            };
            CiStatus {
                state,
                run_id: b.id,
                started_at: b.queue_time,
                test_results: None,
            }
        }))
    }

    async fn rebuild(&self, run_id: u64) -> std::result::Result<(), RemoteError> {
        self.patch(
            &format!("/build/builds/{run_id}"),
            serde_json::json!({"retry": true}),
        )
        .await
    }

    async fn rebuild_failed(&self, run_id: u64) -> std::result::Result<(), RemoteError> {
        // the pipelines API has no failed-only retry; a full retry is the
        // closest safe equivalent
        self.rebuild(run_id).await
    }

    async fn cancel(&self, run_id: u64) -> std::result::Result<(), RemoteError> {
        self.patch(
            &format!("/build/builds/{run_id}"),
            serde_json::json!({"status": "cancelling"}),
        )
        .await
    }

    async fn cancel_on_branch(&self, branch: &str) -> std::result::Result<(), RemoteError> {
        self.patch(
            "/build/builds/cancel",
            serde_json::json!({"branch": branch}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::test_support::{pull_request, ts};

    fn status(state: CiState, run_id: u64, started_hours: i64) -> CiStatus {
        CiStatus {
            state,
            run_id,
            started_at: ts(started_hours),
            test_results: Some("FAILED: test_connection".into()),
        }
    }

    #[test]
    fn test_no_ci_run_yields_has_ci_false() {
        let item = pull_request(1);
        let facts = get_ci_facts(&item, None, None);
        assert!(!facts.get_bool("has_ci"));
        assert!(facts.get_str("ci_state").is_none());
    }

    #[test]
    fn test_failure_run_sets_notification() {
        let item = pull_request(1);
        let facts = get_ci_facts(&item, Some(&status(CiState::Failure, 900, 1)), None);
        assert!(facts.get_bool("has_ci"));
        assert_eq!(facts.get_str("ci_state"), Some("failure"));
        assert!(facts.get_bool("needs_testresult_notification"));
        assert_eq!(facts.get_int("ci_run_number"), Some(900));
    }

    #[test]
    fn test_already_notified_run_suppresses_notification() {
        let item = pull_request(1);
        let facts = get_ci_facts(&item, Some(&status(CiState::Failure, 900, 1)), Some(900));
        assert!(!facts.get_bool("needs_testresult_notification"));
    }

    #[test]
    fn test_stale_run_detected() {
        let mut item = pull_request(1);
        item.updated_at = ts(10); // pushed after the run started
        let facts = get_ci_facts(&item, Some(&status(CiState::Success, 900, 2)), None);
        assert!(facts.get_bool("ci_stale"));

        item.updated_at = ts(1);
        let facts = get_ci_facts(&item, Some(&status(CiState::Success, 900, 2)), None);
        assert!(!facts.get_bool("ci_stale"));
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let config = TriageConfig::default();
        let err = create_provider("jenkins", &config).unwrap_err();
        assert!(matches!(err, ShepherdError::UnknownCiProvider { .. }));
        assert!(err.is_process_fatal());
    }

    #[test]
    fn test_known_providers_construct() {
        let config = TriageConfig::default();
        assert_eq!(create_provider("gha", &config).unwrap().name(), "gha");
        assert_eq!(create_provider("azp", &config).unwrap().name(), "azp");
    }

    #[test]
    fn test_run_to_status_mapping() {
        let run = RawWorkflowRun {
            id: 5,
            status: "completed".into(),
            conclusion: Some("success".into()),
            created_at: ts(0),
            failure_summary: None,
        };
        assert_eq!(run_to_status(run).state, CiState::Success);

        let run = RawWorkflowRun {
            id: 6,
            status: "completed".into(),
            conclusion: Some("failure".into()),
            created_at: ts(0),
            failure_summary: Some("boom".into()),
        };
        let status = run_to_status(run);
        assert_eq!(status.state, CiState::Failure);
        assert_eq!(status.test_results.as_deref(), Some("boom"));

        let run = RawWorkflowRun {
            id: 7,
            status: "in_progress".into(),
            conclusion: None,
            created_at: ts(0),
            failure_summary: None,
        };
        assert_eq!(run_to_status(run).state, CiState::Pending);
    }
}
