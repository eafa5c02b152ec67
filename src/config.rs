//! Configuration loading and validation.
//!
//! Settings come from a TOML file (explicit path, `./shepherd.toml`, or the
//! user config directory, first found wins) with `SHEPHERD_*` environment
//! overrides on top. The API token is environment-only and never written to
//! disk. Validation runs at startup; a bad value is fatal before any item is
//! processed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ci::VALID_CI_PROVIDERS;
use crate::engine::EngineConfig;
use crate::error::{Result, ShepherdError};

/// Name of the config file searched for in the working and config dirs.
pub const CONFIG_FILE_NAME: &str = "shepherd.toml";

/// Bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// Base URL of the tracker API
    pub remote_url: String,
    /// Actor names that count as the bot itself
    pub bot_names: Vec<String>,
    /// CI provider name, see `--ci`
    pub ci_provider: String,
    /// Workflow file for the workflow-based provider
    pub ci_workflow: String,
    /// Organization for the pipelines-based provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp_org: Option<String>,
    /// Project for the pipelines-based provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp_project: Option<String>,
    /// Days after which a skipped item is re-triaged anyway
    pub stale_window_days: i64,
    /// Days of silence before a needs_info warning
    pub needs_info_warn_days: u32,
    /// Days of silence before a needs_info close
    pub needs_info_expire_days: u32,
    /// Label alternations beyond this count are waffling
    pub waffle_tolerance: u32,
    /// Lookback window for the waffling scan
    pub waffle_lookback_days: i64,
    /// Allow the merge flag on automerge-eligible PRs
    pub automerge: bool,
    /// Close PRs whose incoming repository vanished
    pub close_missing_ref: bool,
    /// Seed needs_triage on fresh items
    pub seed_needs_triage: bool,
    /// Cache directory; defaults to the platform cache dir
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// API token, environment-only (`SHEPHERD_TOKEN`)
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            remote_url: "https://api.github.com".to_string(),
            bot_names: vec!["shepherd".to_string(), "shepherd-dev".to_string()],
            ci_provider: "azp".to_string(),
            ci_workflow: "tests.yml".to_string(),
            azp_org: None,
            azp_project: None,
            stale_window_days: 7,
            needs_info_warn_days: 30,
            needs_info_expire_days: 60,
            waffle_tolerance: 3,
            waffle_lookback_days: 90,
            automerge: false,
            close_missing_ref: true,
            seed_needs_triage: true,
            cache_dir: None,
            token: None,
        }
    }
}

impl TriageConfig {
    /// Load configuration: explicit path, then `./shepherd.toml`, then the
    /// user config dir. Missing files fall back to defaults; a present but
    /// unparseable file is fatal.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::find_config_file(explicit) {
            Some(path) => {
                debug!(path = %path.display(), "loading config file");
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    ShepherdError::config_with_path(e.to_string(), path.clone())
                })?;
                toml::from_str(&raw)
                    .map_err(|e| ShepherdError::config_with_path(e.to_string(), path))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let cwd = PathBuf::from(CONFIG_FILE_NAME);
        if cwd.exists() {
            return Some(cwd);
        }
        let user = dirs::config_dir()?.join("shepherd").join(CONFIG_FILE_NAME);
        user.exists().then_some(user)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("SHEPHERD_REMOTE_URL") {
            self.remote_url = url;
        }
        if let Ok(provider) = std::env::var("SHEPHERD_CI_PROVIDER") {
            self.ci_provider = provider;
        }
        if let Ok(token) = std::env::var("SHEPHERD_TOKEN") {
            if !token.is_empty() {
                self.token = Some(token);
            }
        }
    }

    /// Startup validation; every violation here is process-fatal.
    pub fn validate(&self) -> Result<()> {
        if !VALID_CI_PROVIDERS.contains(&self.ci_provider.as_str()) {
            return Err(ShepherdError::UnknownCiProvider {
                provider: self.ci_provider.clone(),
                valid: VALID_CI_PROVIDERS.join(", "),
            });
        }
        if self.remote_url.is_empty() {
            return Err(ShepherdError::InvalidConfig {
                field: "remote_url".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.stale_window_days <= 0 {
            return Err(ShepherdError::InvalidConfig {
                field: "stale_window_days".into(),
                reason: "must be positive".into(),
            });
        }
        if self.waffle_lookback_days <= 0 {
            return Err(ShepherdError::InvalidConfig {
                field: "waffle_lookback_days".into(),
                reason: "must be positive".into(),
            });
        }
        if self.needs_info_warn_days >= self.needs_info_expire_days {
            return Err(ShepherdError::InvalidConfig {
                field: "needs_info_warn_days".into(),
                reason: "must be below needs_info_expire_days".into(),
            });
        }
        if self.bot_names.is_empty() {
            return Err(ShepherdError::InvalidConfig {
                field: "bot_names".into(),
                reason: "at least one bot actor name is required".into(),
            });
        }
        Ok(())
    }

    pub fn token(&self) -> Option<String> {
        self.token.clone()
    }

    pub fn bot_name_set(&self) -> BTreeSet<String> {
        self.bot_names.iter().cloned().collect()
    }

    /// Resolved cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("shepherd")
        })
    }

    pub fn quota_path(&self) -> PathBuf {
        self.cache_dir().join("quota.json")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.cache_dir().join("items")
    }

    /// Policy knobs handed to the reconciliation engine.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            bot_names: self.bot_name_set(),
            automerge_enabled: self.automerge,
            close_missing_ref: self.close_missing_ref,
            seed_needs_triage: self.seed_needs_triage,
            waffle_tolerance: self.waffle_tolerance,
            waffle_lookback_days: self.waffle_lookback_days,
            needs_info_expire_days: self.needs_info_expire_days,
        }
    }
}
