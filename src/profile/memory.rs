//! In-Memory Profile Store
//!
//! DashMap-backed store with hooks for scripting slow or failing calls.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::debug;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::store::ProfileStore;
use super::types::{Profile, ProfilePatch};
use crate::error::{StoreError, StoreResult};

/// Holds back operations on one user until released
#[derive(Debug, Clone)]
pub struct StoreGate {
    permits: Arc<Semaphore>,
}

impl StoreGate {
    fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let exactly one waiting (or future) operation through
    pub fn release(&self) {
        self.permits.add_permits(1);
    }

    async fn pass(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

/// In-memory profile store
pub struct InMemoryProfileStore {
    /// Stored profiles (user_id -> Profile)
    profiles: DashMap<String, Profile>,
    read_gates: DashMap<String, StoreGate>,
    write_gates: DashMap<String, StoreGate>,
    read_failures: DashMap<String, StoreError>,
    write_failures: DashMap<String, StoreError>,
    /// Artificial delay applied to every call
    latency: RwLock<Option<Duration>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryProfileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
            read_gates: DashMap::new(),
            write_gates: DashMap::new(),
            read_failures: DashMap::new(),
            write_failures: DashMap::new(),
            latency: RwLock::new(None),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Insert or replace a profile
    pub fn insert(&self, profile: Profile) {
        self.profiles.insert(profile.user_id.clone(), profile);
    }

    /// Builder form of `insert`
    pub fn with_profile(self, profile: Profile) -> Self {
        self.insert(profile);
        self
    }

    /// Stored record, bypassing gates and failures
    pub fn peek(&self, user_id: &str) -> Option<Profile> {
        self.profiles.get(user_id).map(|p| p.clone())
    }

    /// Block reads of `user_id` until the returned gate is released
    pub fn hold_reads(&self, user_id: impl Into<String>) -> StoreGate {
        let gate = StoreGate::new();
        self.read_gates.insert(user_id.into(), gate.clone());
        gate
    }

    /// Block writes to `user_id` until the returned gate is released
    pub fn hold_writes(&self, user_id: impl Into<String>) -> StoreGate {
        let gate = StoreGate::new();
        self.write_gates.insert(user_id.into(), gate.clone());
        gate
    }

    /// Make reads of `user_id` fail until cleared
    pub fn fail_reads(&self, user_id: impl Into<String>, error: StoreError) {
        self.read_failures.insert(user_id.into(), error);
    }

    /// Make writes to `user_id` fail until cleared
    pub fn fail_writes(&self, user_id: impl Into<String>, error: StoreError) {
        self.write_failures.insert(user_id.into(), error);
    }

    /// Remove all gates and injected failures
    pub fn clear_faults(&self) {
        self.read_gates.clear();
        self.write_gates.clear();
        self.read_failures.clear();
        self.write_failures.clear();
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of `get` calls received
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `update` calls received
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for InMemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get(&self, user_id: &str) -> StoreResult<Profile> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        let gate = self.read_gates.get(user_id).map(|g| g.clone());
        if let Some(gate) = gate {
            gate.pass().await;
        }
        self.delay().await;

        if let Some(error) = self.read_failures.get(user_id).map(|e| e.clone()) {
            return Err(error);
        }

        self.peek(user_id)
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))
    }

    async fn update(&self, user_id: &str, patch: &ProfilePatch) -> StoreResult<Profile> {
        self.writes.fetch_add(1, Ordering::SeqCst);

        let gate = self.write_gates.get(user_id).map(|g| g.clone());
        if let Some(gate) = gate {
            gate.pass().await;
        }
        self.delay().await;

        if let Some(error) = self.write_failures.get(user_id).map(|e| e.clone()) {
            return Err(error);
        }

        let mut entry = self
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        patch.apply_to(entry.value_mut());
        entry.updated_at = Some(Utc::now());

        debug!("Updated profile for {}", user_id);
        Ok(entry.clone())
    }

    fn store_name(&self) -> &'static str {
        "in-memory"
    }
}
