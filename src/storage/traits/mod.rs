//! Storage backend traits.

mod catalog;
mod identity;
mod suspicion;

pub use catalog::{ActionQueue, RuleCatalog};
pub use identity::{IdentityStore, IndexActionChannel};
pub use suspicion::SuspicionBackend;
