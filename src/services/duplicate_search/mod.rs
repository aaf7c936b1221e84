//! Duplicate search: provider seam, gateway and retry wrapper.
//!
//! ```text
//! caller ──► ResilientDuplicateSearch ──► DuplicateSearchGateway ──► DuplicateSearchProvider
//!            (bounded retry, tagged       (validation, one entry     (pluggable matcher)
//!             Found/Empty/Unavailable)     per rule, NotFound)
//! ```

mod exact;
mod gateway;
mod retry;

pub use exact::{ExactAttributeMatcher, METADATA_PROVIDER};
pub use gateway::{DuplicateSearchGateway, DuplicateSearchProvider};
pub use retry::{Backoff, ResilientDuplicateSearch, RetryPolicy};
