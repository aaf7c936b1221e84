//! Business logic services.
//!
//! Services orchestrate storage backends and the duplicate search provider:
//!
//! - [`SuspicionService`]: suspicion lifecycle (create, lock, exclude, delete)
//! - [`DetectionScanner`]: periodic rule scan and purge
//! - [`ReconciliationProcessor`]: recomputation after identity changes
//! - [`ResolutionEngine`]: automatic merge of strict duplicates
//! - [`DedupServices`]: the service graph built once from configuration

mod container;
mod detection;
mod duplicate_search;
mod reconciliation;
mod resolution;
mod suspicion;

pub use container::{DedupBackends, DedupServices};
pub use detection::{DetectionReport, DetectionScanner, DetectionSettings};
pub use duplicate_search::{
    Backoff, DuplicateSearchGateway, DuplicateSearchProvider, ExactAttributeMatcher,
    METADATA_PROVIDER, ResilientDuplicateSearch, RetryPolicy,
};
pub use reconciliation::{ReconciliationProcessor, ReconciliationReport, ReconciliationSettings};
pub use resolution::{
    MergeRejection, ResolutionEngine, ResolutionReport, ResolutionSettings, attribute_deltas,
    can_merge, first_conflict, is_strict_duplicate, rank_for_merge,
};
pub use suspicion::{SuspicionLockGuard, SuspicionService, SuspicionSettings};

use std::time::Duration;

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
#[inline]
pub(crate) fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Converts u64 to f64 for metrics, capping at `u32::MAX`.
#[inline]
pub(crate) fn u64_to_f64(value: u64) -> f64 {
    let capped = u32::try_from(value).unwrap_or(u32::MAX);
    f64::from(capped)
}
