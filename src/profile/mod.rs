//! Profile Module
//!
//! User profile records and the store they are read from and written to.

pub mod memory;
pub mod store;
pub mod types;

pub use memory::{InMemoryProfileStore, StoreGate};
pub use store::ProfileStore;
pub use types::{Profile, ProfilePatch, Role};
