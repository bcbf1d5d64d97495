//! Identity Provider Abstraction
//!
//! Defines the interface the session manager consumes. Implementations own
//! the sessions; the manager only ever sees clones.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{Credentials, Session};
use crate::error::AuthResult;

/// Identity provider trait - the contract the session manager relies on
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Session restored at startup, if any
    async fn current_session(&self) -> AuthResult<Option<Session>>;

    /// Register for session change events, delivered in order
    fn subscribe(&self) -> SessionSubscription;

    /// Authenticate with an identifier/secret pair
    async fn sign_in(&self, credentials: &Credentials) -> AuthResult<Session>;

    /// End the current session
    async fn sign_out(&self) -> AuthResult<()>;

    /// Get provider name for logging
    fn provider_name(&self) -> &'static str;
}

/// Releases a provider subscription. Runs at most once, on explicit
/// `unsubscribe()` or on drop.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct UnsubscribeHandle {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl UnsubscribeHandle {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Handle with nothing to release
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Release the subscription now
    pub fn unsubscribe(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for UnsubscribeHandle {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for UnsubscribeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsubscribeHandle")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// An ordered stream of session events plus the handle that ends it
pub struct SessionSubscription {
    events: mpsc::UnboundedReceiver<Option<Session>>,
    handle: UnsubscribeHandle,
}

impl SessionSubscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<Option<Session>>,
        handle: UnsubscribeHandle,
    ) -> Self {
        Self { events, handle }
    }

    /// Wait for the next event; `None` once the provider closed the stream
    pub async fn next(&mut self) -> Option<Option<Session>> {
        self.events.recv().await
    }

    /// Split into the event stream and the release handle
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Option<Session>>, UnsubscribeHandle) {
        (self.events, self.handle)
    }
}
