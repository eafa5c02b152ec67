//! Rate-governed remote call execution.
//!
//! Every remote call goes through [`RetryGovernor::execute`], which tracks a
//! shared, time-windowed call quota and classifies failures into fixed-backoff
//! retry classes. Backoff intervals are fixed per class rather than
//! exponential: the bound being protected is a single external quota window,
//! so worst-case latency stays predictable.
//!
//! Callers treat the governor as synchronous: `execute` returns only on
//! success (`Ok(Some)`), benign absence of the target (`Ok(None)`), or a
//! fatal error. Exceeding the retry ceiling is fatal to the whole process,
//! since it signals a systemic remote or credential problem.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, ShepherdError};
use crate::remote::RemoteError;

/// Refresh the quota from the remote once this many governed calls have been
/// made against the cached value.
pub const QUOTA_REFRESH_THRESHOLD: u64 = 100;

/// Refresh when the cached remaining allowance drops below this floor.
pub const QUOTA_LOW_WATER: i64 = 100;

/// Attempts per governed call before giving up for good.
pub const MAX_ATTEMPTS: u32 = 10;

/// Padding added to every quota-reset sleep.
pub const RESET_PADDING: Duration = Duration::from_secs(5);

/// Backoff for transient network/protocol failures.
pub const TRANSIENT_BACKOFF: Duration = Duration::from_secs(2 * 60);

/// Conservative backoff when the quota state is unknown.
pub const UNKNOWN_QUOTA_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Fallback reset wait when the quota endpoint itself is unavailable.
const FALLBACK_RESET_WAIT: Duration = Duration::from_secs(62 * 60);

/// Failure classification for one remote call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Quota window exhausted; sleep until reset plus padding
    RateLimited,
    /// Network or protocol hiccup; short fixed sleep
    Transient,
    /// Quota state unknown; conservative fixed sleep
    QuotaUnknown,
    /// Target object gone or feature disabled; not an error
    BenignAbsent,
    /// Unrecoverable; propagate immediately
    Fatal,
}

/// Shared, persisted quota record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateQuota {
    /// Remaining call allowance, decremented approximately between refreshes
    pub remaining: i64,
    /// When the current window resets
    pub reset_at: DateTime<Utc>,
    /// Governed calls made since the last true refresh
    pub calls_since_refresh: u64,
}

impl RateQuota {
    pub fn needs_refresh(&self, threshold: u64, low_water: i64) -> bool {
        self.calls_since_refresh > threshold || self.remaining < low_water
    }
}

/// Fresh quota reading from the remote.
#[derive(Debug, Clone, Copy)]
pub struct QuotaSnapshot {
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

/// The explicit quota-check call, kept separate from the governed surface so
/// the governor can refresh without recursing into itself.
#[async_trait]
pub trait QuotaSource: Send + Sync {
    async fn check(&self) -> std::result::Result<QuotaSnapshot, RemoteError>;
}

/// Disk persistence for [`RateQuota`], shared across processes via an
/// exclusive file lock.
#[derive(Debug, Clone)]
pub struct QuotaStore {
    path: PathBuf,
}

impl QuotaStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<Option<RateQuota>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(&self.path)?;
        FileExt::lock_shared(&file).map_err(|e| ShepherdError::QuotaStore {
            message: format!("lock {}: {e}", self.path.display()),
        })?;
        let quota = serde_json::from_reader(&file).ok();
        let _ = FileExt::unlock(&file);
        Ok(quota)
    }

    pub fn save(&self, quota: &RateQuota) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(&self.path)?;
        FileExt::lock_exclusive(&file).map_err(|e| ShepherdError::QuotaStore {
            message: format!("lock {}: {e}", self.path.display()),
        })?;
        serde_json::to_writer(&file, quota)?;
        let _ = FileExt::unlock(&file);
        Ok(())
    }
}

/// Governor tuning knobs. Defaults mirror the production constants.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub max_attempts: u32,
    pub refresh_threshold: u64,
    pub low_water: i64,
    pub reset_padding: Duration,
    pub transient_backoff: Duration,
    pub unknown_backoff: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            refresh_threshold: QUOTA_REFRESH_THRESHOLD,
            low_water: QUOTA_LOW_WATER,
            reset_padding: RESET_PADDING,
            transient_backoff: TRANSIENT_BACKOFF,
            unknown_backoff: UNKNOWN_QUOTA_BACKOFF,
        }
    }
}

/// Wraps remote calls with quota accounting and classified retries.
pub struct RetryGovernor {
    quota: Arc<Mutex<Option<RateQuota>>>,
    store: Option<QuotaStore>,
    source: Arc<dyn QuotaSource>,
    config: GovernorConfig,
}

impl RetryGovernor {
    pub fn new(source: Arc<dyn QuotaSource>, store: Option<QuotaStore>, config: GovernorConfig) -> Self {
        let initial = store.as_ref().and_then(|s| s.load().ok().flatten());
        Self {
            quota: Arc::new(Mutex::new(initial)),
            store,
            source,
            config,
        }
    }

    /// Run one remote call to completion.
    ///
    /// Returns `Ok(Some(value))` on success, `Ok(None)` when the target is
    /// benignly absent, and `Err` on fatal failure or retry exhaustion.
    pub async fn execute<T, F, Fut>(&self, name: &str, call: F) -> Result<Option<T>>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, RemoteError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            if attempts > self.config.max_attempts {
                return Err(ShepherdError::RetryExhausted {
                    attempts: attempts - 1,
                    message: name.to_string(),
                });
            }

            self.account_call(name).await;

            match call().await {
                Ok(value) => return Ok(Some(value)),
                Err(err) => match err.class() {
                    FailureClass::BenignAbsent => {
                        info!(call = name, "target absent, treating as empty result");
                        return Ok(None);
                    }
                    FailureClass::Fatal => {
                        return Err(ShepherdError::remote(format!("{name}: {err}")));
                    }
                    FailureClass::RateLimited => {
                        let delay = self.reset_delay().await;
                        warn!(call = name, attempt = attempts, delay_s = delay.as_secs(), "rate limited");
                        tokio::time::sleep(delay).await;
                    }
                    FailureClass::Transient => {
                        warn!(call = name, attempt = attempts, %err, "transient remote failure");
                        tokio::time::sleep(self.config.transient_backoff).await;
                    }
                    FailureClass::QuotaUnknown => {
                        warn!(call = name, attempt = attempts, %err, "quota state unknown");
                        tokio::time::sleep(self.config.unknown_backoff).await;
                    }
                },
            }
        }
    }

    /// Read-modify-write on the shared quota: refresh if stale, then charge
    /// one call against the in-memory approximation.
    async fn account_call(&self, name: &str) {
        let mut guard = self.quota.lock().await;
        let stale = match guard.as_ref() {
            None => true,
            Some(q) => q.needs_refresh(self.config.refresh_threshold, self.config.low_water),
        };
        if stale {
            match self.source.check().await {
                Ok(snap) => {
                    *guard = Some(RateQuota {
                        remaining: snap.remaining,
                        reset_at: snap.reset_at,
                        calls_since_refresh: 0,
                    });
                }
                Err(err) => {
                    warn!(call = name, %err, "quota refresh failed, keeping approximation");
                }
            }
        }
        if let Some(quota) = guard.as_mut() {
            quota.calls_since_refresh += 1;
            quota.remaining -= 1;
            debug!(call = name, remaining = quota.remaining, "quota charged");
            if let Some(store) = &self.store {
                if let Err(err) = store.save(quota) {
                    warn!(%err, "failed to persist quota");
                }
            }
        }
    }

    /// How long to sleep for a rate-limit failure: until the window resets,
    /// rounded up to whole seconds, plus the fixed padding.
    async fn reset_delay(&self) -> Duration {
        match self.source.check().await {
            Ok(snap) => {
                {
                    let mut guard = self.quota.lock().await;
                    *guard = Some(RateQuota {
                        remaining: snap.remaining,
                        reset_at: snap.reset_at,
                        calls_since_refresh: 0,
                    });
                }
                let wait_ms = (snap.reset_at - Utc::now()).num_milliseconds().max(0);
                let wait = Duration::from_secs(((wait_ms + 999) / 1000) as u64);
                wait + self.config.reset_padding
            }
            Err(err) => {
                warn!(%err, "quota check failed during backoff");
                FALLBACK_RESET_WAIT
            }
        }
    }

    /// Current cached quota, if any. Mostly for status output and tests.
    pub async fn cached_quota(&self) -> Option<RateQuota> {
        self.quota.lock().await.clone()
    }
}
