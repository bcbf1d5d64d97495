//! Session Management Module
//!
//! The process-wide session lifecycle manager:
//! - Reconciliation of identity provider events in delivery order
//! - Generation-checked profile loads (last event wins)
//! - Sign-in/sign-out/profile update operations returning plain `Result`s
//! - Snapshots, ordered change listeners and a typed event feed

pub mod events;
pub mod manager;
pub mod state;
pub mod tasks;

pub use events::{ListenerHandle, SessionEvent};
pub use manager::SessionManager;
pub use state::{ManagerState, SessionStatus};
