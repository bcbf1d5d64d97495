//! Identity Provider Module
//!
//! The seam between the session manager and whatever service issues sessions:
//! - `IdentityProvider` trait (current session, event subscription, sign-in/out)
//! - Scoped subscriptions that unsubscribe exactly once
//! - An in-memory provider for tests and local runs

pub mod memory;
pub mod provider;
pub mod types;

pub use memory::InMemoryIdentityProvider;
pub use provider::{IdentityProvider, SessionSubscription, UnsubscribeHandle};
pub use types::{Credentials, Session};
