use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Set holding the serialized fuzzlet records for the campaign.
pub const FUZZLETS_KEY: &str = "swarmfuzz:fuzzlets";

pub fn task_status_key(task_id: &str) -> String {
    format!("global:task_status:{task_id}")
}

pub fn task_metadata_key(task_id: &str) -> String {
    format!("global:task_metadata:{task_id}")
}

pub fn task_trace_key(task_id: &str) -> String {
    format!("global:trace_context:{task_id}")
}

pub fn build_trace_key(task_id: &str) -> String {
    format!("artifacts:trace_context:{task_id}")
}

pub fn legacy_cmin_key(task_id: &str, harness: &str) -> String {
    format!("cmin:{task_id}:{harness}")
}

/// Set of dictionary file paths registered for a (task, harness) pair.
pub fn dicts_key(task_id: &str, harness: &str) -> String {
    format!("artifacts:{task_id}:{harness}:dicts")
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("shared state unavailable: {0}")]
    Unavailable(String),
}

/// Key/value + set store shared with the rest of the campaign.
///
/// The scheduler reads fuzzlet records, task statuses and task metadata
/// through this capability and may remove canceled fuzzlets from the set.
#[async_trait]
pub trait SharedState: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StateError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StateError>;
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StateError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StateError>;
}

/// In-process shared state, used by the mock binary and tests.
#[derive(Default)]
pub struct MemoryState {
    values: RwLock<HashMap<String, String>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedState for MemoryState {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StateError> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StateError> {
        Ok(self
            .sets
            .read()
            .await
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StateError> {
        self.sets
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StateError> {
        if let Some(set) = self.sets.write().await.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }
}
