//! Session State
//!
//! The single piece of shared mutable state the manager owns, and the status
//! machine governing it.

use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::identity::Session;
use crate::profile::Profile;

/// Lifecycle status of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Startup read of the provider has not resolved yet
    Initializing,
    /// Nobody is signed in
    Anonymous,
    /// Signed in, profile read in flight
    ProfileLoading,
    /// Signed in with a loaded profile
    Ready,
    /// Provider or profile failure; see `ManagerState::error`
    Error,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Initializing
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Anonymous => write!(f, "anonymous"),
            Self::ProfileLoading => write!(f, "profile_loading"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl SessionStatus {
    /// Allowed edges of the status machine. Re-entering `ProfileLoading`
    /// happens when a newer session arrives before the previous load lands;
    /// `Ready` is re-entered or reached from `Error` by an applied profile
    /// write.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initializing, Anonymous)
                | (Initializing, ProfileLoading)
                | (Initializing, Error)
                | (ProfileLoading, Ready)
                | (ProfileLoading, Error)
                | (ProfileLoading, Anonymous)
                | (ProfileLoading, ProfileLoading)
                | (Ready, ProfileLoading)
                | (Ready, Ready)
                | (Ready, Anonymous)
                | (Error, ProfileLoading)
                | (Error, Ready)
                | (Error, Anonymous)
                | (Anonymous, ProfileLoading)
        )
    }
}

/// Snapshot of everything the manager knows about the current user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerState {
    pub status: SessionStatus,
    pub session: Option<Session>,
    pub profile: Option<Profile>,
    /// Bumped on every session change and applied profile write; async
    /// results started under an older value are discarded
    pub generation: u64,
    /// Set iff `status == Error`
    pub error: Option<AuthError>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Initializing,
            session: None,
            profile: None,
            generation: 0,
            error: None,
        }
    }
}

impl ManagerState {
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user_id.as_str())
    }

    /// Check the structural invariants of a snapshot
    pub fn is_consistent(&self) -> bool {
        let profile_matches = match (&self.profile, &self.session) {
            (None, _) => true,
            (Some(profile), Some(session)) => profile.user_id == session.user_id,
            (Some(_), None) => false,
        };
        let anonymous_is_empty = self.status != SessionStatus::Anonymous
            || (self.session.is_none() && self.profile.is_none());
        let error_matches_status = (self.status == SessionStatus::Error) == self.error.is_some();

        profile_matches && anonymous_is_empty && error_matches_status
    }

    /// Bump the generation and return it
    pub(crate) fn advance(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub(crate) fn clear(&mut self) {
        self.status = SessionStatus::Anonymous;
        self.session = None;
        self.profile = None;
        self.error = None;
    }

    pub(crate) fn fail(&mut self, error: AuthError) {
        self.status = SessionStatus::Error;
        self.profile = None;
        self.error = Some(error);
    }
}
