//! Storage layer.
//!
//! - **Suspicion store**: suspicions, locks and exclusions (`SQLite`)
//! - **Rule catalog** and **action queue** (`SQLite`)
//! - **Identity store** and **index channel**: adapters over the external
//!   identity systems (in-memory implementations provided)

// Dropping the connection guard a few statements early gains nothing.
#![allow(clippy::significant_drop_tightening)]

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::{InMemoryIdentityStore, InMemoryIndexActionChannel};
pub use sqlite::{SqliteActionQueue, SqliteRuleCatalog, SqliteSuspicionBackend};
pub use traits::{ActionQueue, IdentityStore, IndexActionChannel, RuleCatalog, SuspicionBackend};
