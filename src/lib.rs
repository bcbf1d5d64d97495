//! Session lifecycle management.
//!
//! Owns "who is signed in" for a process: reconciles an identity provider's
//! session events with a cached user profile and exposes consistent snapshots
//! and operations to the rest of the application.

pub mod config;
pub mod error;
pub mod identity;
pub mod profile;
pub mod session;

pub use config::ManagerConfig;
pub use error::{AuthError, AuthResult, ConfigError, ErrorKind, StoreError, StoreResult};
pub use identity::{Credentials, IdentityProvider, InMemoryIdentityProvider, Session};
pub use profile::{InMemoryProfileStore, Profile, ProfilePatch, ProfileStore, Role};
pub use session::{ListenerHandle, ManagerState, SessionEvent, SessionManager, SessionStatus};
