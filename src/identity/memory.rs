//! In-Memory Identity Provider
//!
//! A process-local provider with scripted accounts. Used by the demo binary
//! and the manager tests to drive event interleavings deterministically.

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::provider::{IdentityProvider, SessionSubscription, UnsubscribeHandle};
use super::types::{Credentials, Session};
use crate::error::{AuthError, AuthResult};

/// Registered account
#[derive(Debug, Clone)]
struct Account {
    secret: String,
    user_id: String,
}

/// In-memory identity provider
pub struct InMemoryIdentityProvider {
    /// Accounts (normalized identifier -> Account)
    accounts: DashMap<String, Account>,
    /// Session the provider currently considers active
    current: RwLock<Option<Session>>,
    /// Event subscribers (subscription id -> sender)
    subscribers: Arc<DashMap<u64, mpsc::UnboundedSender<Option<Session>>>>,
    next_subscriber_id: AtomicU64,
    /// Number of released subscriptions
    released: Arc<AtomicUsize>,
    /// When false every call fails with `ProviderUnavailable`
    available: AtomicBool,
    /// Whether a successful sign-out also emits a `None` event
    echo_sign_out: AtomicBool,
}

impl InMemoryIdentityProvider {
    /// Create a new provider with no accounts and no active session
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            current: RwLock::new(None),
            subscribers: Arc::new(DashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            released: Arc::new(AtomicUsize::new(0)),
            available: AtomicBool::new(true),
            echo_sign_out: AtomicBool::new(true),
        }
    }

    /// Register an account that can sign in
    pub fn register_account(
        &self,
        identifier: impl AsRef<str>,
        secret: impl Into<String>,
        user_id: impl Into<String>,
    ) {
        self.accounts.insert(
            normalize(identifier.as_ref()),
            Account {
                secret: secret.into(),
                user_id: user_id.into(),
            },
        );
    }

    /// Builder form of `register_account`
    pub fn with_account(
        self,
        identifier: impl AsRef<str>,
        secret: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        self.register_account(identifier, secret, user_id);
        self
    }

    /// Set the session returned by `current_session` without emitting an event
    pub fn restore_session(&self, session: Option<Session>) {
        *self.current.write() = session;
    }

    /// Simulate an outage (or recovery)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Control whether sign-out is echoed on the event stream
    pub fn set_echo_sign_out(&self, echo: bool) {
        self.echo_sign_out.store(echo, Ordering::SeqCst);
    }

    /// Emit a provider-initiated session change to every subscriber
    pub fn emit(&self, session: Option<Session>) {
        *self.current.write() = session.clone();
        self.broadcast(session);
    }

    /// Provider-side expiry of the current session
    pub fn expire(&self) {
        debug!("Expiring current session");
        self.emit(None);
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Number of subscriptions released so far
    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn broadcast(&self, session: Option<Session>) {
        // Closed receivers are pruned on the next send
        self.subscribers
            .retain(|_, tx| tx.send(session.clone()).is_ok());
    }

    fn ensure_available(&self) -> AuthResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AuthError::provider_unavailable(
                "Network error. Please try again.",
            ))
        }
    }
}

impl Default for InMemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn current_session(&self) -> AuthResult<Option<Session>> {
        self.ensure_available()?;
        Ok(self.current.read().clone())
    }

    fn subscribe(&self) -> SessionSubscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);

        let subscribers = Arc::clone(&self.subscribers);
        let released = Arc::clone(&self.released);
        let handle = UnsubscribeHandle::new(move || {
            if subscribers.remove(&id).is_some() {
                released.fetch_add(1, Ordering::SeqCst);
            }
        });

        SessionSubscription::new(rx, handle)
    }

    async fn sign_in(&self, credentials: &Credentials) -> AuthResult<Session> {
        self.ensure_available()?;

        let account = self
            .accounts
            .get(&normalize(&credentials.identifier))
            .map(|a| a.clone())
            .filter(|a| a.secret == credentials.secret)
            .ok_or_else(|| AuthError::invalid_credentials("Invalid login credentials"))?;

        let session = Session::new(account.user_id, uuid::Uuid::new_v4().to_string())
            .with_email(credentials.identifier.trim())
            .with_expiry(chrono::Utc::now() + chrono::Duration::hours(1));

        self.emit(Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> AuthResult<()> {
        self.ensure_available()?;

        if self.echo_sign_out.load(Ordering::SeqCst) {
            self.emit(None);
        } else {
            *self.current.write() = None;
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "in-memory"
    }
}

fn normalize(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}
