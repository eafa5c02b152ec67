//! Shepherd - Issue and Pull Request Triage Bot
//!
//! A Rust-based triage bot that reconciles tracker state against derived
//! facts and applies the resulting mutations through a rate-governed remote
//! call layer.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`engine`] - Ordered-clause reconciliation of facts into actions
//! - [`governor`] - Shared rate quota and classified retry execution
//! - [`triage`] - The per-item fetch/facts/reconcile/apply/redo loop
//! - [`remote`] - Tracker API boundary and HTTP implementation
//! - [`ci`] - CI provider boundary (`azp`/`gha`)
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (mock remote and CI)
//!
//! # Example
//!
//! ```rust,ignore
//! use shepherd::config::TriageConfig;
//! use shepherd::triage::{TriageLoop, TriageOptions};
//!
//! let config = TriageConfig::load(None)?;
//! let looper = TriageLoop::new(remote, governor, ci, config, TriageOptions::default());
//! let summary = looper.run(&[]).await?;
//! println!("triaged {} items", summary.triaged);
//! ```

pub mod actions;
pub mod ci;
pub mod config;
pub mod engine;
pub mod error;
pub mod facts;
pub mod governor;
pub mod item;
pub mod remote;
pub mod snapshot;
pub mod templates;
pub mod testing;
pub mod triage;

// Re-export commonly used types
pub use error::{Result, ShepherdError};

// Re-export config types
pub use config::TriageConfig;

// Re-export data model types
pub use actions::{ActionSet, MAX_COMMENT_BYTES};
pub use facts::{FactStore, FactValue};
pub use item::{CommandEvent, ItemKind, LabelAction, LabelEvent, TrackedItem};

// Re-export engine types
pub use engine::{EngineConfig, ReconciliationEngine};

// Re-export governor types
pub use governor::{
    GovernorConfig, QuotaSnapshot, QuotaSource, QuotaStore, RateQuota, RetryGovernor,
};

// Re-export remote and CI boundaries
pub use ci::{CiProvider, CiState, CiStatus, VALID_CI_PROVIDERS};
pub use remote::{HttpRemote, RemoteApi, RemoteError};

// Re-export loop types
pub use triage::{BatchSummary, FactExtractor, TriageLoop, TriageOptions};
