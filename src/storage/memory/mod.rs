//! In-memory adapters for the external identity systems.

mod identity;
mod index_channel;

pub use identity::InMemoryIdentityStore;
pub use index_channel::InMemoryIndexActionChannel;
