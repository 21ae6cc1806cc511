use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Fuzzer-origin category recorded with every seed row. The corpus chain
/// uses it to prioritize curated seeds over general fuzzing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedOrigin {
    SeedGen,
    Minimized,
    Corpus,
    General,
    Directed,
}

#[derive(Debug, Clone)]
pub struct SeedRecord {
    pub task_id: String,
    pub harness: String,
    pub path: PathBuf,
    pub origin: SeedOrigin,
    pub instance: String,
    pub coverage: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CrashRecord {
    pub task_id: String,
    pub harness: String,
    pub sanitizer: String,
    pub poc_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

/// Relational store capability: seed and crash rows inserted by the core,
/// seed rows read back by the corpus chain's datastore source.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn insert_seed(&self, seed: SeedRecord) -> Result<(), StoreError>;
    async fn insert_crash(&self, crash: CrashRecord) -> Result<(), StoreError>;

    /// All seed rows for `task_id` whose harness matches `harness` or the
    /// wildcard `"*"`.
    async fn seeds(&self, task_id: &str, harness: &str) -> Result<Vec<SeedRecord>, StoreError>;
}

/// In-process datastore, used by the mock binary and tests.
#[derive(Default)]
pub struct MemoryDatastore {
    seeds: Mutex<Vec<SeedRecord>>,
    crashes: Mutex<Vec<CrashRecord>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_rows(&self) -> Vec<SeedRecord> {
        self.seeds.lock().await.clone()
    }

    pub async fn crash_rows(&self) -> Vec<CrashRecord> {
        self.crashes.lock().await.clone()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn insert_seed(&self, seed: SeedRecord) -> Result<(), StoreError> {
        self.seeds.lock().await.push(seed);
        Ok(())
    }

    async fn insert_crash(&self, crash: CrashRecord) -> Result<(), StoreError> {
        self.crashes.lock().await.push(crash);
        Ok(())
    }

    async fn seeds(&self, task_id: &str, harness: &str) -> Result<Vec<SeedRecord>, StoreError> {
        Ok(self
            .seeds
            .lock()
            .await
            .iter()
            .filter(|s| s.task_id == task_id && (s.harness == harness || s.harness == "*"))
            .cloned()
            .collect())
    }
}
