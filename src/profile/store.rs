//! Profile Store Abstraction

use async_trait::async_trait;

use super::types::{Profile, ProfilePatch};
use crate::error::StoreResult;

/// Key-value profile store keyed by user id
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Read the profile of a user
    async fn get(&self, user_id: &str) -> StoreResult<Profile>;

    /// Apply a patch and return the stored record
    async fn update(&self, user_id: &str, patch: &ProfilePatch) -> StoreResult<Profile>;

    /// Get store name for logging
    fn store_name(&self) -> &'static str;
}
