//! Profile Load Tasks
//!
//! Every profile read spawned by reconciliation is tracked here with the
//! generation it was started for, so teardown can abort whatever is still
//! in flight.

use log::debug;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Handle for a spawned profile load
pub struct LoadHandle {
    /// Generation captured when the load started
    pub generation: u64,
    /// User whose profile is being read
    pub user_id: String,
    join_handle: JoinHandle<()>,
}

impl LoadHandle {
    pub fn new(generation: u64, user_id: impl Into<String>, join_handle: JoinHandle<()>) -> Self {
        Self {
            generation,
            user_id: user_id.into(),
            join_handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Abort the task immediately
    pub fn abort(&self) {
        self.join_handle.abort();
    }
}

/// Set of in-flight profile loads
#[derive(Default)]
pub struct LoadTasks {
    handles: Mutex<Vec<LoadHandle>>,
}

impl LoadTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new load, dropping handles of loads that already finished
    pub fn track(&self, handle: LoadHandle) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Loads still running, superseded ones included
    pub fn in_flight(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Abort everything still running
    pub fn abort_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles.iter().filter(|h| !h.is_finished()) {
            debug!(
                "Aborting profile load for {} (generation {})",
                handle.user_id, handle.generation
            );
            handle.abort();
        }
    }
}
