//! Automatic resolution of strict duplicates.
//!
//! For each suspicion of the strict rule, the engine recomputes the live
//! duplicate group, picks a primary and merges every eligible candidate
//! into it under the suspicion lock.

mod eligibility;
mod engine;

pub use eligibility::{
    MergeRejection, attribute_deltas, can_merge, first_conflict, is_strict_duplicate,
    rank_for_merge,
};
pub use engine::{ResolutionEngine, ResolutionReport, ResolutionSettings};
