//! Session Manager
//!
//! Owns the process-wide authentication state and reconciles it against the
//! identity provider's event stream. Profile reads run as tracked tasks whose
//! results are applied only if no newer event has arrived since they started.

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::events::{ListenerHandle, Notification, Notifier, SessionEvent};
use super::state::{ManagerState, SessionStatus};
use super::tasks::{LoadHandle, LoadTasks};
use crate::config::ManagerConfig;
use crate::error::{AuthError, AuthResult, ConfigError, StoreError};
use crate::identity::{Credentials, IdentityProvider, Session, UnsubscribeHandle};
use crate::profile::{Profile, ProfilePatch, ProfileStore};

/// Shared core reachable from background tasks through weak references
struct Inner {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn ProfileStore>,
    config: ManagerConfig,
    state: RwLock<ManagerState>,
    /// Serializes mutation; never held while listeners run
    transition: Mutex<()>,
    notifier: Notifier,
    loads: LoadTasks,
    closed: AtomicBool,
}

impl Inner {
    /// Run `mutate` under the transition lock, then notify listeners and the
    /// broadcast feed once the lock is released. Returning `None` leaves the
    /// state untouched and notifies nobody.
    fn apply<F>(&self, mutate: F) -> Option<ManagerState>
    where
        F: FnOnce(&mut ManagerState) -> Option<Vec<SessionEvent>>,
    {
        let snapshot = self.commit(mutate);
        self.notifier.deliver();
        snapshot
    }

    fn commit<F>(&self, mutate: F) -> Option<ManagerState>
    where
        F: FnOnce(&mut ManagerState) -> Option<Vec<SessionEvent>>,
    {
        let _transition = self.transition.lock();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let mut state = self.state.write();
        let old_status = state.status;
        let extra = mutate(&mut *state)?;
        let snapshot = state.clone();
        drop(state);

        if old_status != snapshot.status && !old_status.can_transition_to(snapshot.status) {
            error!(
                "Unexpected status transition {} -> {}",
                old_status, snapshot.status
            );
        }
        if !snapshot.is_consistent() {
            error!("Inconsistent session state committed: {:?}", snapshot);
        }

        let mut events = Vec::with_capacity(extra.len() + 1);
        if old_status != snapshot.status {
            debug!(
                "Status {} -> {} (generation {})",
                old_status, snapshot.status, snapshot.generation
            );
            events.push(SessionEvent::StatusChanged {
                old_status,
                new_status: snapshot.status,
                generation: snapshot.generation,
            });
        }
        events.extend(extra);

        // Queued under the lock so delivery follows commit order
        self.notifier.enqueue(Notification {
            snapshot: Some(snapshot.clone()),
            events,
        });
        Some(snapshot)
    }

    /// Fold one provider event into the state
    fn reconcile(self: &Arc<Self>, next: Option<Session>) {
        match next {
            None => {
                self.clear_session(false);
            }
            Some(session) => {
                let user_id = session.user_id.clone();
                let committed = self.apply(|state| {
                    let generation = state.advance();
                    if state.user_id() != Some(user_id.as_str()) {
                        state.profile = None;
                    }
                    state.session = Some(session);
                    state.status = SessionStatus::ProfileLoading;
                    state.error = None;
                    Some(vec![SessionEvent::SessionChanged {
                        user_id: Some(user_id.clone()),
                        generation,
                    }])
                });

                if let Some(snapshot) = committed {
                    debug!(
                        "Session for {} accepted (generation {}), loading profile",
                        user_id, snapshot.generation
                    );
                    self.spawn_profile_load(user_id, snapshot.generation);
                }
            }
        }
    }

    /// Drop session and profile. Shared by the provider's `None` event and the
    /// local clear after sign-out; a second clear is a no-op.
    fn clear_session(&self, signed_out: bool) -> bool {
        self.apply(|state| {
            if state.status == SessionStatus::Anonymous {
                debug!("Already anonymous, ignoring clear");
                return None;
            }
            let generation = state.advance();
            state.clear();

            let mut events = vec![SessionEvent::SessionChanged {
                user_id: None,
                generation,
            }];
            if signed_out {
                events.push(SessionEvent::SignedOut { generation });
            }
            Some(events)
        })
        .is_some()
    }

    fn spawn_profile_load(self: &Arc<Self>, user_id: String, generation: u64) {
        let inner = Arc::downgrade(self);
        let store = Arc::clone(&self.store);
        let timeout = self.config.profile_load_timeout();
        let target = user_id.clone();

        let join_handle = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, store.get(&target)).await {
                Ok(result) => result.map_err(StoreError::into_load_error),
                Err(_) => Err(AuthError::profile_load_failed(format!(
                    "Profile load timed out after {}ms",
                    timeout.as_millis()
                ))),
            };

            if let Some(inner) = Weak::upgrade(&inner) {
                inner.finish_profile_load(&target, generation, result);
            }
        });

        self.loads
            .track(LoadHandle::new(generation, user_id, join_handle));
    }

    fn finish_profile_load(&self, user_id: &str, generation: u64, result: AuthResult<Profile>) {
        let mut superseded_by = None;

        self.apply(|state| {
            if state.generation != generation || state.user_id() != Some(user_id) {
                superseded_by = Some(state.generation);
                return None;
            }

            match result {
                Ok(profile) if profile.user_id == user_id => {
                    state.profile = Some(profile);
                    state.status = SessionStatus::Ready;
                    state.error = None;
                    Some(vec![SessionEvent::ProfileLoaded {
                        user_id: user_id.to_string(),
                        generation,
                    }])
                }
                Ok(profile) => {
                    warn!(
                        "Profile store returned record for {} while loading {}",
                        profile.user_id, user_id
                    );
                    state.fail(AuthError::profile_load_failed(format!(
                        "Profile store returned a record for another user ({})",
                        profile.user_id
                    )));
                    Some(Vec::new())
                }
                Err(err) => {
                    warn!("Profile load for {} failed: {}", user_id, err);
                    state.fail(err);
                    Some(Vec::new())
                }
            }
        });

        if let Some(current_generation) = superseded_by {
            debug!(
                "Discarding profile load for {} (generation {}, current {})",
                user_id, generation, current_generation
            );
            self.notifier.enqueue(Notification {
                snapshot: None,
                events: vec![SessionEvent::ProfileLoadDiscarded {
                    user_id: user_id.to_string(),
                    generation,
                    current_generation,
                }],
            });
            self.notifier.deliver();
        }
    }

    /// Apply a completed write if the session it was made for is still current
    fn finish_profile_write(&self, user_id: &str, profile: Profile) -> bool {
        self.apply(|state| {
            if state.user_id() != Some(user_id) {
                debug!(
                    "Session changed during profile write for {}, not applying",
                    user_id
                );
                return None;
            }
            // Supersede reads that started before this write
            state.advance();
            state.profile = Some(profile);
            state.status = SessionStatus::Ready;
            state.error = None;
            Some(vec![SessionEvent::ProfileUpdated {
                user_id: user_id.to_string(),
            }])
        })
        .is_some()
    }

    fn fail_startup(&self, err: AuthError) {
        self.apply(|state| {
            state.session = None;
            state.fail(AuthError::provider_unavailable(err.message));
            Some(Vec::new())
        });
    }
}

/// Session Manager - single owner of the authentication state
pub struct SessionManager {
    inner: Arc<Inner>,
    /// Provider subscription, released exactly once on teardown
    subscription: Mutex<Option<UnsubscribeHandle>>,
    /// Task feeding provider events into reconciliation
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Initialize against a provider and store.
    ///
    /// The subscription is registered before the startup read so that no
    /// event is lost in between; buffered events are applied after the
    /// startup result, in delivery order. An already expired restored session
    /// counts as nobody signed in.
    pub async fn start(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn ProfileStore>,
        config: ManagerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let inner = Arc::new(Inner {
            provider,
            store,
            notifier: Notifier::new(config.event_capacity),
            config,
            state: RwLock::new(ManagerState::default()),
            transition: Mutex::new(()),
            loads: LoadTasks::new(),
            closed: AtomicBool::new(false),
        });

        info!(
            "Starting session manager (provider: {}, store: {})",
            inner.provider.provider_name(),
            inner.store.store_name()
        );

        let (events, handle) = inner.provider.subscribe().into_parts();

        let timeout = inner.config.operation_timeout();
        match tokio::time::timeout(timeout, inner.provider.current_session()).await {
            Ok(Ok(Some(session))) if session.is_expired() => {
                info!("Restored session for {} has expired", session.user_id);
                inner.reconcile(None);
            }
            Ok(Ok(session)) => {
                debug!(
                    "Startup session: {}",
                    session.as_ref().map(|s| s.user_id.as_str()).unwrap_or("<none>")
                );
                inner.reconcile(session);
            }
            Ok(Err(err)) => {
                warn!("Could not read current session: {}", err);
                inner.fail_startup(err);
            }
            Err(_) => {
                warn!("Timed out reading current session");
                inner.fail_startup(AuthError::provider_unavailable(format!(
                    "Current session read timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        }

        let pump = tokio::spawn(run_event_pump(Arc::downgrade(&inner), events));

        Ok(Self {
            inner,
            subscription: Mutex::new(Some(handle)),
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Current state. Never waits on I/O.
    pub fn snapshot(&self) -> ManagerState {
        self.inner.state.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.read().is_authenticated()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Register a listener called with the new snapshot after every
    /// transition. Listeners run in registration order and in commit order,
    /// with no manager lock held, so they may call back into the manager.
    /// They must not block; a panic is logged and does not reach the manager.
    pub fn on_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ManagerState) + Send + Sync + 'static,
    {
        self.inner.notifier.listeners().register(Arc::new(listener))
    }

    pub fn listener_count(&self) -> usize {
        self.inner.notifier.listeners().len()
    }

    /// Subscribe to typed session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.notifier.subscribe()
    }

    /// Resolve with the first snapshot satisfying `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> ManagerState
    where
        F: FnMut(&ManagerState) -> bool,
    {
        let mut events = self.inner.notifier.subscribe();
        loop {
            let snapshot = self.snapshot();
            if predicate(&snapshot) {
                return snapshot;
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return self.snapshot(),
            }
        }
    }

    /// Authenticate with the provider.
    ///
    /// State is not touched here: the provider's event for the new session
    /// drives reconciliation like any other event.
    pub async fn sign_in(&self, identifier: &str, secret: &str) -> AuthResult<Session> {
        let credentials = Credentials::new(identifier, secret);
        if !credentials.is_complete() {
            return Err(AuthError::invalid_credentials(
                "Identifier and secret are required",
            ));
        }

        info!("Signing in {}", credentials.identifier);
        let timeout = self.inner.config.operation_timeout();
        let sign_in = self.inner.provider.sign_in(&credentials);
        let result = match tokio::time::timeout(timeout, sign_in).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::provider_unavailable(format!(
                "Sign-in timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        match &result {
            Ok(session) => info!("Signed in as {}", session.user_id),
            Err(err) => warn!("Sign-in for {} failed: {}", credentials.identifier, err),
        }
        result
    }

    /// End the session with the provider, then clear local state without
    /// waiting for the provider's echo
    pub async fn sign_out(&self) -> AuthResult<()> {
        let timeout = self.inner.config.operation_timeout();
        let result = match tokio::time::timeout(timeout, self.inner.provider.sign_out()).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::provider_unavailable(format!(
                "Sign-out timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        if let Err(err) = result {
            warn!("Sign-out failed: {}", err);
            return Err(err);
        }

        if self.inner.clear_session(true) {
            info!("Signed out");
        }
        Ok(())
    }

    /// Write a patch for the signed-in user and return the stored record
    pub async fn update_profile(&self, patch: ProfilePatch) -> AuthResult<Profile> {
        let user_id = self
            .inner
            .state
            .read()
            .user_id()
            .map(str::to_owned)
            .ok_or_else(AuthError::no_active_session)?;

        if patch.is_empty() {
            return Err(AuthError::profile_write_failed("Nothing to update"));
        }

        let timeout = self.inner.config.operation_timeout();
        let update = self.inner.store.update(&user_id, &patch);
        let result = match tokio::time::timeout(timeout, update).await {
            Ok(result) => result.map_err(StoreError::into_write_error),
            Err(_) => Err(AuthError::profile_write_failed(format!(
                "Profile write timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        let profile = match result {
            Ok(profile) if profile.user_id == user_id => profile,
            Ok(profile) => {
                return Err(AuthError::profile_write_failed(format!(
                    "Profile store returned a record for another user ({})",
                    profile.user_id
                )));
            }
            Err(err) => {
                warn!("Profile write for {} failed: {}", user_id, err);
                return Err(err);
            }
        };

        if self.inner.finish_profile_write(&user_id, profile.clone()) {
            debug!("Profile for {} updated", user_id);
        }
        Ok(profile)
    }

    /// Reload the profile of the current session, e.g. after `Error`
    pub fn refresh_profile(&self) -> AuthResult<()> {
        let session = self
            .inner
            .state
            .read()
            .session
            .clone()
            .ok_or_else(AuthError::no_active_session)?;

        info!("Refreshing profile for {}", session.user_id);
        self.inner.reconcile(Some(session));
        Ok(())
    }

    /// Profile loads still running, superseded ones included
    pub fn loads_in_flight(&self) -> usize {
        self.inner.loads.in_flight()
    }

    /// Release the provider subscription and stop background work.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down session manager");

        if let Some(handle) = self.subscription.lock().take() {
            handle.unsubscribe();
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.inner.loads.abort_all();
        self.inner.notifier.listeners().clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Feed provider events into reconciliation until the stream ends or the
/// manager goes away
async fn run_event_pump(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<Option<Session>>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.reconcile(event);
    }
    debug!("Session event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::identity::InMemoryIdentityProvider;
    use crate::profile::{InMemoryProfileStore, Role};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        provider: Arc<InMemoryIdentityProvider>,
        store: Arc<InMemoryProfileStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let provider = InMemoryIdentityProvider::new()
                .with_account("a@b.com", "pw", "u1")
                .with_account("b@b.com", "pw", "u2");
            let store = InMemoryProfileStore::new()
                .with_profile(Profile::new("u1", "Ada").with_role(Role::Student))
                .with_profile(Profile::new("u2", "Bob").with_role(Role::Instructor));
            Self {
                provider: Arc::new(provider),
                store: Arc::new(store),
            }
        }

        async fn start(&self) -> SessionManager {
            self.start_with(ManagerConfig::default()).await
        }

        async fn start_with(&self, config: ManagerConfig) -> SessionManager {
            SessionManager::start(self.provider.clone(), self.store.clone(), config)
                .await
                .expect("valid config")
        }
    }

    async fn wait_status(manager: &SessionManager, status: SessionStatus) -> ManagerState {
        tokio::time::timeout(WAIT, manager.wait_for(|s| s.status == status))
            .await
            .expect("timed out waiting for status")
    }

    async fn next_matching<F>(
        events: &mut broadcast::Receiver<SessionEvent>,
        mut matches: F,
    ) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_end_to_end_sign_in() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        assert_eq!(manager.snapshot().status, SessionStatus::Anonymous);
        assert!(!manager.is_authenticated());

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let _listener = {
            let statuses = statuses.clone();
            manager.on_change(move |state| statuses.lock().push(state.status))
        };

        let session = manager.sign_in("a@b.com", "pw").await.unwrap();
        assert_eq!(session.user_id, "u1");

        let state = wait_status(&manager, SessionStatus::Ready).await;
        assert_eq!(state.profile.as_ref().unwrap().user_id, "u1");
        assert_eq!(state.session.as_ref().unwrap(), &session);
        assert!(manager.is_authenticated());
        assert_eq!(
            *statuses.lock(),
            vec![SessionStatus::ProfileLoading, SessionStatus::Ready]
        );
    }

    #[tokio::test]
    async fn test_restored_session_loads_profile() {
        let fixture = Fixture::new();
        fixture.provider.restore_session(Some(Session::new("u2", "tok")));

        let manager = fixture.start().await;
        let state = wait_status(&manager, SessionStatus::Ready).await;
        assert_eq!(state.profile.unwrap().display_name, "Bob");
        assert_eq!(state.generation, 1);
    }

    #[tokio::test]
    async fn test_stale_profile_load_discarded() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        let mut events = manager.subscribe();

        let slow = fixture.store.hold_reads("u1");
        fixture.provider.emit(Some(Session::new("u1", "t1")));
        fixture.provider.emit(Some(Session::new("u2", "t2")));

        let state = wait_status(&manager, SessionStatus::Ready).await;
        assert_eq!(state.profile.as_ref().unwrap().user_id, "u2");

        slow.release();
        let discarded = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::ProfileLoadDiscarded { .. })
        })
        .await;
        assert_eq!(
            discarded,
            SessionEvent::ProfileLoadDiscarded {
                user_id: "u1".to_string(),
                generation: 2,
                current_generation: 3,
            }
        );

        let state = manager.snapshot();
        assert_eq!(state.session.as_ref().unwrap().user_id, "u2");
        assert_eq!(state.profile.as_ref().unwrap().user_id, "u2");
        assert!(state.is_consistent());
    }

    #[tokio::test]
    async fn test_sign_out_clears_without_echo() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        manager.sign_in("a@b.com", "pw").await.unwrap();
        wait_status(&manager, SessionStatus::Ready).await;

        fixture.provider.set_echo_sign_out(false);
        manager.sign_out().await.unwrap();

        let state = manager.snapshot();
        assert_eq!(state.status, SessionStatus::Anonymous);
        assert!(state.profile.is_none());
        assert!(state.session.is_none());

        // A late echo changes nothing and notifies nobody
        let calls = Arc::new(Mutex::new(0usize));
        let _listener = {
            let calls = calls.clone();
            manager.on_change(move |_| *calls.lock() += 1)
        };
        let _gate = fixture.store.hold_reads("u2");
        let mut events = manager.subscribe();
        fixture.provider.emit(None);
        fixture.provider.emit(Some(Session::new("u2", "t2")));

        next_matching(&mut events, |e| matches!(e, SessionEvent::SessionChanged { .. })).await;
        let after = manager.snapshot();
        assert_eq!(after.user_id(), Some("u2"));
        assert_eq!(after.generation, state.generation + 1);
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_failure_keeps_state() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        manager.sign_in("a@b.com", "pw").await.unwrap();
        let before = wait_status(&manager, SessionStatus::Ready).await;

        fixture.provider.set_available(false);
        let err = manager.sign_out().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderUnavailable);
        assert_eq!(manager.snapshot(), before);
    }

    #[tokio::test]
    async fn test_update_without_session() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;

        let err = manager
            .update_profile(ProfilePatch::new().display_name("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoActiveSession);
        assert_eq!(fixture.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_update_profile_replaces_local_copy() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        manager.sign_in("a@b.com", "pw").await.unwrap();
        wait_status(&manager, SessionStatus::Ready).await;

        let updated = manager
            .update_profile(ProfilePatch::new().display_name("Ada L.").set("bio", "hi"))
            .await
            .unwrap();
        assert_eq!(updated.display_name, "Ada L.");

        let state = manager.snapshot();
        assert_eq!(state.profile, Some(updated));
        assert_eq!(state.status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn test_update_failure_leaves_state() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        manager.sign_in("a@b.com", "pw").await.unwrap();
        let before = wait_status(&manager, SessionStatus::Ready).await;

        fixture
            .store
            .fail_writes("u1", StoreError::Unavailable("maintenance".into()));
        let err = manager
            .update_profile(ProfilePatch::new().display_name("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProfileWriteFailed);
        assert_eq!(manager.snapshot(), before);
    }

    #[tokio::test]
    async fn test_sign_out_during_update_write() {
        let fixture = Fixture::new();
        let manager = Arc::new(fixture.start().await);
        manager.sign_in("a@b.com", "pw").await.unwrap();
        wait_status(&manager, SessionStatus::Ready).await;

        let gate = fixture.store.hold_writes("u1");
        let update = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .update_profile(ProfilePatch::new().display_name("Late"))
                    .await
            })
        };
        while fixture.store.write_count() == 0 {
            tokio::task::yield_now().await;
        }

        manager.sign_out().await.unwrap();
        gate.release();

        let written = update.await.unwrap().unwrap();
        assert_eq!(written.display_name, "Late");

        let state = manager.snapshot();
        assert_eq!(state.status, SessionStatus::Anonymous);
        assert!(state.profile.is_none());
    }

    #[tokio::test]
    async fn test_listener_fan_out() {
        let fixture = Fixture::new();
        fixture.provider.restore_session(Some(Session::new("u1", "tok")));
        let manager = fixture.start().await;
        wait_status(&manager, SessionStatus::Ready).await;

        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let calls = calls.clone();
            manager.on_change(move |state| calls.lock().push(("first", state.clone())))
        };
        let _second = {
            let calls = calls.clone();
            manager.on_change(move |state| calls.lock().push(("second", state.clone())))
        };

        fixture.provider.expire();
        wait_status(&manager, SessionStatus::Anonymous).await;

        {
            let calls = calls.lock();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0].0, "first");
            assert_eq!(calls[1].0, "second");
            assert_eq!(calls[0].1, calls[1].1);
            assert_eq!(calls[0].1.status, SessionStatus::Anonymous);
        }

        first.unsubscribe();
        calls.lock().clear();
        fixture.provider.emit(Some(Session::new("u2", "t2")));
        wait_status(&manager, SessionStatus::Ready).await;

        let calls = calls.lock();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|(name, _)| *name == "second"));
    }

    #[tokio::test]
    async fn test_startup_provider_unavailable() {
        let fixture = Fixture::new();
        fixture.provider.set_available(false);

        let manager = fixture.start().await;
        let state = manager.snapshot();
        assert_eq!(state.status, SessionStatus::Error);
        assert!(state.session.is_none());
        assert_eq!(state.error.unwrap().kind, ErrorKind::ProviderUnavailable);

        // The stream still recovers the manager
        fixture.provider.emit(Some(Session::new("u1", "tok")));
        let state = wait_status(&manager, SessionStatus::Ready).await;
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_profile_load_failure_and_retry() {
        let fixture = Fixture::new();
        fixture
            .store
            .fail_reads("u1", StoreError::Unavailable("db down".into()));
        let manager = fixture.start().await;
        manager.sign_in("a@b.com", "pw").await.unwrap();

        let state = wait_status(&manager, SessionStatus::Error).await;
        assert_eq!(state.user_id(), Some("u1"));
        assert!(state.profile.is_none());
        assert_eq!(state.error.unwrap().kind, ErrorKind::ProfileLoadFailed);

        fixture.store.clear_faults();
        manager.refresh_profile().unwrap();
        let state = wait_status(&manager, SessionStatus::Ready).await;
        assert_eq!(state.profile.unwrap().display_name, "Ada");
    }

    #[tokio::test]
    async fn test_missing_profile_is_load_failure() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        fixture.provider.emit(Some(Session::new("ghost", "tok")));

        let state = wait_status(&manager, SessionStatus::Error).await;
        assert_eq!(state.error.unwrap().kind, ErrorKind::ProfileLoadFailed);
    }

    #[tokio::test]
    async fn test_profile_load_timeout() {
        let fixture = Fixture::new();
        let _gate = fixture.store.hold_reads("u1");
        let config =
            ManagerConfig::default().with_profile_load_timeout(Duration::from_millis(20));
        let manager = fixture.start_with(config).await;

        fixture.provider.emit(Some(Session::new("u1", "tok")));
        let state = wait_status(&manager, SessionStatus::Error).await;
        assert!(state.error.unwrap().message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_refresh_without_session() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        let err = manager.refresh_profile().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoActiveSession);
    }

    #[tokio::test]
    async fn test_sign_in_errors_do_not_touch_state() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        let before = manager.snapshot();

        let err = manager.sign_in("a@b.com", "wrong").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidCredentials);

        let err = manager.sign_in("", "pw").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidCredentials);

        fixture.provider.set_available(false);
        let err = manager.sign_in("a@b.com", "pw").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderUnavailable);

        assert_eq!(manager.snapshot(), before);
    }

    #[tokio::test]
    async fn test_shutdown_releases_subscription_once() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        assert_eq!(fixture.provider.subscriber_count(), 1);

        let _listener = manager.on_change(|_| {});
        assert_eq!(manager.listener_count(), 1);

        manager.shutdown();
        manager.shutdown();
        assert_eq!(manager.listener_count(), 0);
        drop(manager);

        assert_eq!(fixture.provider.subscriber_count(), 0);
        assert_eq!(fixture.provider.released_count(), 1);
    }

    #[tokio::test]
    async fn test_no_mutation_after_shutdown() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        let _gate = fixture.store.hold_reads("u1");
        manager.sign_in("a@b.com", "pw").await.unwrap();
        wait_status(&manager, SessionStatus::ProfileLoading).await;

        manager.shutdown();
        assert!(manager.is_shut_down());
        assert_eq!(manager.loads_in_flight(), 0);

        let before = manager.snapshot();
        fixture.provider.emit(Some(Session::new("u2", "tok")));
        tokio::task::yield_now().await;
        assert_eq!(manager.snapshot(), before);
    }

    #[tokio::test]
    async fn test_every_observed_state_is_consistent() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;

        let violations = Arc::new(Mutex::new(0usize));
        let _listener = {
            let violations = violations.clone();
            manager.on_change(move |state| {
                if !state.is_consistent() {
                    *violations.lock() += 1;
                }
            })
        };

        fixture.provider.emit(Some(Session::new("u1", "t1")));
        fixture.provider.emit(Some(Session::new("u2", "t2")));
        fixture.provider.emit(None);
        fixture.provider.emit(Some(Session::new("u1", "t3")));
        let state = wait_status(&manager, SessionStatus::Ready).await;

        assert_eq!(state.user_id(), Some("u1"));
        assert_eq!(state.generation, 5);
        assert_eq!(*violations.lock(), 0);
    }

    #[tokio::test]
    async fn test_listener_can_call_back_into_manager() {
        let fixture = Fixture::new();
        let manager = Arc::new(fixture.start().await);

        let refreshed = Arc::new(AtomicBool::new(false));
        let _listener = {
            let weak = Arc::downgrade(&manager);
            let refreshed = refreshed.clone();
            manager.on_change(move |state| {
                if state.status != SessionStatus::ProfileLoading
                    || refreshed.swap(true, Ordering::SeqCst)
                {
                    return;
                }
                if let Some(manager) = weak.upgrade() {
                    manager.refresh_profile().unwrap();
                }
            })
        };

        manager.sign_in("a@b.com", "pw").await.unwrap();
        let state = wait_status(&manager, SessionStatus::Ready).await;
        assert!(refreshed.load(Ordering::SeqCst));
        // startup clear, sign-in, refresh from inside the listener
        assert_eq!(state.generation, 3);
        assert_eq!(state.profile.unwrap().display_name, "Ada");

        // The transition lock is free for everyone else afterwards
        manager.refresh_profile().unwrap();
        assert_eq!(manager.snapshot().status, SessionStatus::ProfileLoading);
        let state = wait_status(&manager, SessionStatus::Ready).await;
        assert_eq!(state.generation, 4);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_reconciliation() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        let _listener = manager.on_change(|state| {
            if state.user_id() == Some("boom") {
                panic!("listener bug");
            }
        });

        fixture.provider.emit(Some(Session::new("boom", "tok")));
        let state = wait_status(&manager, SessionStatus::Error).await;
        assert_eq!(state.user_id(), Some("boom"));

        fixture.provider.emit(Some(Session::new("u1", "tok")));
        let state = wait_status(&manager, SessionStatus::Ready).await;
        assert_eq!(state.user_id(), Some("u1"));
        assert_eq!(state.profile.unwrap().display_name, "Ada");
        assert_eq!(manager.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_update_during_profile_load_supersedes_read() {
        let fixture = Fixture::new();
        let manager = fixture.start().await;
        let mut events = manager.subscribe();

        let gate = fixture.store.hold_reads("u1");
        manager.sign_in("a@b.com", "pw").await.unwrap();
        let loading = wait_status(&manager, SessionStatus::ProfileLoading).await;
        while fixture.store.read_count() == 0 {
            tokio::task::yield_now().await;
        }

        let written = manager
            .update_profile(ProfilePatch::new().display_name("Written"))
            .await
            .unwrap();
        let state = manager.snapshot();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.profile.as_ref(), Some(&written));
        assert_eq!(state.generation, loading.generation + 1);

        gate.release();
        let discarded = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::ProfileLoadDiscarded { .. })
        })
        .await;
        assert_eq!(
            discarded,
            SessionEvent::ProfileLoadDiscarded {
                user_id: "u1".to_string(),
                generation: loading.generation,
                current_generation: loading.generation + 1,
            }
        );

        let state = manager.snapshot();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.profile.unwrap().display_name, "Written");
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let fixture = Fixture::new();
        let config = ManagerConfig::default().with_event_capacity(0);

        let result =
            SessionManager::start(fixture.provider.clone(), fixture.store.clone(), config).await;
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        assert_eq!(fixture.provider.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_restored_session_is_anonymous() {
        let fixture = Fixture::new();
        let expired = Session::new("u1", "tok")
            .with_expiry(chrono::Utc::now() - chrono::Duration::minutes(5));
        fixture.provider.restore_session(Some(expired));

        let manager = fixture.start().await;
        let state = manager.snapshot();
        assert_eq!(state.status, SessionStatus::Anonymous);
        assert!(!manager.is_authenticated());
        assert_eq!(fixture.store.read_count(), 0);
    }
}
