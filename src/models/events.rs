//! Identity change events emitted for audit and history.

use super::{CustomerId, RequestAuthor};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Shared event metadata required for observability.
#[derive(Debug, Clone)]
pub struct EventMeta {
    /// Unique identifier for this event.
    pub event_id: String,
    /// Event source component.
    pub source: &'static str,
    /// Timestamp (Unix epoch seconds).
    pub timestamp: i64,
}

impl EventMeta {
    /// Creates new event metadata using the current timestamp.
    #[must_use]
    pub fn new(source: &'static str) -> Self {
        Self::with_timestamp(source, crate::current_timestamp())
    }

    /// Creates new event metadata with a specified timestamp.
    #[must_use]
    pub fn with_timestamp(source: &'static str, timestamp: i64) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            source,
            timestamp,
        }
    }
}

/// Identity change notifications produced when suspicions mutate.
#[derive(Debug, Clone)]
pub enum IdentityChangeEvent {
    /// An identity was marked as suspicious.
    MarkedSuspicious {
        /// Event metadata.
        meta: EventMeta,
        /// Subject of the suspicion.
        customer_id: CustomerId,
        /// Rule that raised it.
        rule_code: String,
        /// Who created it.
        author: RequestAuthor,
        /// Client application code.
        client_code: String,
        /// Suspicion metadata.
        metadata: BTreeMap<String, String>,
    },
    /// Two identities were declared distinct.
    Excluded {
        /// Event metadata.
        meta: EventMeta,
        /// Identity the event is recorded against.
        customer_id: CustomerId,
        /// The other identity of the pair.
        excluded_customer_id: CustomerId,
        /// Who excluded the pair.
        author: RequestAuthor,
        /// Client application code.
        client_code: String,
        /// Additional metadata.
        metadata: BTreeMap<String, String>,
    },
    /// A previous exclusion was withdrawn.
    ExclusionCancelled {
        /// Event metadata.
        meta: EventMeta,
        /// Identity the event is recorded against.
        customer_id: CustomerId,
        /// The other identity of the pair.
        excluded_customer_id: CustomerId,
        /// Who cancelled the exclusion.
        author: RequestAuthor,
        /// Client application code.
        client_code: String,
        /// Additional metadata.
        metadata: BTreeMap<String, String>,
    },
}

impl IdentityChangeEvent {
    /// Returns the event type name.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::MarkedSuspicious { .. } => "MARKED_SUSPICIOUS",
            Self::Excluded { .. } => "EXCLUDED",
            Self::ExclusionCancelled { .. } => "EXCLUSION_CANCELLED",
        }
    }

    /// Returns the identity the event is recorded against.
    #[must_use]
    pub const fn customer_id(&self) -> &CustomerId {
        match self {
            Self::MarkedSuspicious { customer_id, .. }
            | Self::Excluded { customer_id, .. }
            | Self::ExclusionCancelled { customer_id, .. } => customer_id,
        }
    }

    /// Returns the event metadata.
    #[must_use]
    pub const fn meta(&self) -> &EventMeta {
        match self {
            Self::MarkedSuspicious { meta, .. }
            | Self::Excluded { meta, .. }
            | Self::ExclusionCancelled { meta, .. } => meta,
        }
    }

    /// Returns the author of the change.
    #[must_use]
    pub const fn author(&self) -> &RequestAuthor {
        match self {
            Self::MarkedSuspicious { author, .. }
            | Self::Excluded { author, .. }
            | Self::ExclusionCancelled { author, .. } => author,
        }
    }
}
