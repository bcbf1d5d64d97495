//! Error Types
//!
//! Every failure the manager can report is plain data: operations return
//! `AuthError` values and reconciliation failures are recorded in the state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of authentication failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Identity provider or network unreachable
    ProviderUnavailable,
    /// Provider rejected the identifier/secret pair
    InvalidCredentials,
    /// Profile could not be read for the active session
    ProfileLoadFailed,
    /// Profile write was rejected or failed
    ProfileWriteFailed,
    /// Operation requires a signed-in user
    NoActiveSession,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProviderUnavailable => write!(f, "provider unavailable"),
            Self::InvalidCredentials => write!(f, "invalid credentials"),
            Self::ProfileLoadFailed => write!(f, "profile load failed"),
            Self::ProfileWriteFailed => write!(f, "profile write failed"),
            Self::NoActiveSession => write!(f, "no active session"),
        }
    }
}

/// Normalized error returned by manager operations and recorded on `Error` status
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AuthError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AuthError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderUnavailable, message)
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCredentials, message)
    }

    pub fn profile_load_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProfileLoadFailed, message)
    }

    pub fn profile_write_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProfileWriteFailed, message)
    }

    pub fn no_active_session() -> Self {
        Self::new(ErrorKind::NoActiveSession, "No user signed in")
    }
}

/// Errors reported by a profile store backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Normalize a failed read
    pub fn into_load_error(self) -> AuthError {
        AuthError::profile_load_failed(self.to_string())
    }

    /// Normalize a failed write
    pub fn into_write_error(self) -> AuthError {
        AuthError::profile_write_failed(self.to_string())
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for manager operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Result type alias for profile store operations
pub type StoreResult<T> = Result<T, StoreError>;
