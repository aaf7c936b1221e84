//! # identity-dedup
//!
//! Detection, tracking and resolution of duplicate identity records.
//!
//! The crate maintains *suspicions*: stored assertions that two (or more)
//! identities are probable duplicates under a given detection rule. Three
//! periodic daemons keep them current:
//!
//! - [`services::DetectionScanner`] walks the active rules, asks the external
//!   duplicate search provider about candidate identities and records new
//!   suspicions (then purges the ones that no longer match).
//! - [`services::ReconciliationProcessor`] consumes queued identity-change
//!   actions and recomputes the suspicions touching the changed identity.
//! - [`services::ResolutionEngine`] merges safe duplicates found by the
//!   designated strict rule.
//!
//! Matching itself is delegated to a pluggable
//! [`services::DuplicateSearchProvider`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use identity_dedup::config::DedupConfig;
//! use identity_dedup::services::DedupServices;
//!
//! let config = DedupConfig::load_default();
//! let services = DedupServices::from_config(&config)?;
//! let report = services.scanner().run()?;
//! println!("{}", report.summary());
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use chrono::Utc;
use thiserror::Error as ThisError;

pub mod config;
pub mod daemon;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

pub use config::DedupConfig;
pub use models::{
    ActionType, CustomerId, DuplicateRule, DuplicateSearchOutcome, Identity, IdentityAttribute,
    LimitationMode, QualifiedIdentitySearchResult, RequestAuthor, SuspicionAction,
    SuspiciousIdentity,
};
pub use services::{
    DedupServices, DetectionScanner, DuplicateSearchGateway, ReconciliationProcessor,
    ResilientDuplicateSearch, ResolutionEngine, SuspicionService,
};

/// Error type for identity-dedup operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Empty rule list, blank identifiers, unknown enum strings, zero page size |
/// | `NotFound` | Unknown rule, identity, suspicion or exclusion |
/// | `Conflict` | Page out of range, pair already excluded, lock held by another author |
/// | `ProviderUnavailable` | The duplicate search provider could not be reached |
/// | `OperationFailed` | `SQLite` queries fail, I/O or serialization errors |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Malformed request, rejected before any side effect.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested resource does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of resource (rule, identity, suspicion, ...).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The operation conflicts with the current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient fault of the duplicate search provider.
    ///
    /// Retried by [`services::ResilientDuplicateSearch`]; once retries are
    /// exhausted callers skip the item and try again on the next run.
    #[error("duplicate search provider '{provider}' unavailable: {cause}")]
    ProviderUnavailable {
        /// Provider name.
        provider: String,
        /// The underlying cause.
        cause: String,
    },

    /// An internal operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Creates a [`Error::NotFound`] error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates an [`Error::OperationFailed`] error from any displayable cause.
    #[must_use]
    pub fn operation(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Returns true if the failure is transient and worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderUnavailable { .. })
    }

    /// Returns the HTTP-equivalent status code for the REST surface.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::ProviderUnavailable { .. } => 503,
            Self::OperationFailed { .. } => 500,
        }
    }
}

/// Result type alias for identity-dedup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds.
#[must_use]
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}
