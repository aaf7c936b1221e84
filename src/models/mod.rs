//! Data models for identity-dedup.
//!
//! This module contains the core data structures shared by the storage
//! backends and the deduplication services.

mod action;
mod events;
mod identity;
mod rule;
mod search;
mod suspicion;

pub use action::{ActionType, SuspicionAction};
pub use events::{EventMeta, IdentityChangeEvent};
pub use identity::{
    AttributeChangeStatus, AttributeMergeStatus, CustomerId, Identity, IdentityAttribute,
    MergeOutcome, MergeRequest, MergeStatus,
};
pub use rule::{DuplicateRule, LimitationMode};
pub use search::{
    DuplicateSearchOutcome, DuplicateSearchRequest, QualifiedIdentitySearchResult, RuleResults,
};
pub use suspicion::{
    AuthorType, Exclusion, METADATA_RULE_CODE, NewSuspicion, RequestAuthor, SuspicionId,
    SuspicionLock, SuspicionPage, SuspiciousIdentity,
};
