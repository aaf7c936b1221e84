//! `SQLite` stores for suspicions, rules and queued actions.
//!
//! Every store wraps a single `Mutex<Connection>`. The three stores may
//! point at the same database file; WAL mode lets them share it.

mod actions;
mod connection;
mod metrics;
mod rules;
mod suspicion;

pub use actions::SqliteActionQueue;
pub use connection::{acquire_lock, configure_connection, with_transaction};
pub use metrics::record_operation_metrics;
pub use rules::SqliteRuleCatalog;
pub use suspicion::SqliteSuspicionBackend;

use chrono::{DateTime, Utc};

/// Converts a date to its stored form (Unix milliseconds).
pub(crate) fn to_millis(date: DateTime<Utc>) -> i64 {
    date.timestamp_millis()
}

/// Converts stored Unix milliseconds back to a date.
pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
