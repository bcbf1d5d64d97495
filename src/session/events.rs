//! Session Events
//!
//! Change notification for consumers: ordered synchronous listeners that
//! receive the full snapshot, and a typed broadcast feed.

use log::error;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

use super::state::{ManagerState, SessionStatus};

/// Events broadcast by the session manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Status changed
    StatusChanged {
        old_status: SessionStatus,
        new_status: SessionStatus,
        generation: u64,
    },

    /// The active session was replaced or cleared
    SessionChanged {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        generation: u64,
    },

    /// Profile load applied
    ProfileLoaded { user_id: String, generation: u64 },

    /// Profile load finished after a newer session event and was dropped
    ProfileLoadDiscarded {
        user_id: String,
        generation: u64,
        current_generation: u64,
    },

    /// Profile write applied to local state
    ProfileUpdated { user_id: String },

    /// Local state cleared after a successful sign-out
    SignedOut { generation: u64 },
}

impl SessionEvent {
    /// Get the event name
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "session-status",
            Self::SessionChanged { .. } => "session-changed",
            Self::ProfileLoaded { .. } => "profile-loaded",
            Self::ProfileLoadDiscarded { .. } => "profile-load-discarded",
            Self::ProfileUpdated { .. } => "profile-updated",
            Self::SignedOut { .. } => "signed-out",
        }
    }
}

type Listener = Arc<dyn Fn(&ManagerState) + Send + Sync>;

/// Ordered set of change listeners
#[derive(Default)]
pub(crate) struct Listeners {
    entries: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub(crate) fn register(self: &Arc<Self>, listener: Listener) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.write().push((id, listener));
        ListenerHandle {
            id,
            listeners: Arc::downgrade(self),
            active: true,
        }
    }

    fn remove(&self, id: u64) {
        self.entries.write().retain(|(entry_id, _)| *entry_id != id);
    }

    /// Invoke every listener in registration order. A panicking listener is
    /// logged and skipped; the rest still run.
    pub(crate) fn notify(&self, snapshot: &ManagerState) {
        // Clone out so a listener may register or unsubscribe while being called
        let listeners: Vec<Listener> = self
            .entries
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                error!(
                    "Session listener panicked on {} (generation {})",
                    snapshot.status, snapshot.generation
                );
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn clear(&self) {
        self.entries.write().clear();
    }
}

/// A committed transition waiting for delivery
pub(crate) struct Notification {
    /// New snapshot for listeners; `None` for broadcast-only events
    pub(crate) snapshot: Option<ManagerState>,
    pub(crate) events: Vec<SessionEvent>,
}

/// Delivers committed transitions to listeners and the broadcast feed in
/// commit order.
///
/// Transitions are queued while the transition lock is held and delivered
/// after it is released. Only one caller drains at a time; a listener that
/// calls back into the manager queues its own transition, which the active
/// drainer delivers once the current listener returns.
pub(crate) struct Notifier {
    listeners: Arc<Listeners>,
    event_tx: broadcast::Sender<SessionEvent>,
    queue: Mutex<VecDeque<Notification>>,
    draining: AtomicBool,
}

impl Notifier {
    /// `capacity` must be non-zero
    pub(crate) fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self {
            listeners: Arc::new(Listeners::default()),
            event_tx,
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub(crate) fn listeners(&self) -> &Arc<Listeners> {
        &self.listeners
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn enqueue(&self, notification: Notification) {
        self.queue.lock().push_back(notification);
    }

    /// Deliver everything queued, unless another caller is already draining
    pub(crate) fn deliver(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            while let Some(notification) = self.next_queued() {
                if let Some(snapshot) = &notification.snapshot {
                    self.listeners.notify(snapshot);
                }
                for event in notification.events {
                    let _ = self.event_tx.send(event);
                }
            }

            self.draining.store(false, Ordering::Release);
            // Something may have been queued after the last pop but before
            // the flag was cleared
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn next_queued(&self) -> Option<Notification> {
        self.queue.lock().pop_front()
    }
}

/// Registration returned by `SessionManager::on_change`; dropping it unsubscribes
#[must_use = "dropping the handle unsubscribes the listener"]
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<Listeners>,
    active: bool,
}

impl ListenerHandle {
    /// Stop receiving notifications
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.release();
    }
}
