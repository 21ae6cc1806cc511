use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Small, self-contained fuzzing unit: one (task, harness, sanitizer, engine)
/// combination plus the path to its built harness artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fuzzlet {
    pub task_id: String,
    pub harness: String,
    pub sanitizer: String,
    pub fuzz_engine: String,
    pub artifact_path: String,
}

/// Task status as stored in shared state, keyed by task id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Processing,
    Canceled,
    Other(String),
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "processing" => TaskStatus::Processing,
            "canceled" => TaskStatus::Canceled,
            other => TaskStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Processing => "processing",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Other(s) => s,
        }
    }
}

/// A seed discovered by a running fuzzer, consumed once by the seed manager.
#[derive(Debug, Clone)]
pub struct SeedMessage {
    pub seed_file: PathBuf,
    pub fuzzlet: Arc<Fuzzlet>,
}

/// A crash discovered by a running fuzzer, consumed by the crash sink.
#[derive(Debug, Clone)]
pub struct CrashMessage {
    pub crash_file: PathBuf,
    pub fuzzlet: Arc<Fuzzlet>,
}

/// Message published to the downstream minimization queue for each seed bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CminMessage {
    pub task_id: String,
    pub harness: String,
    #[serde(rename = "seeds")]
    pub seed_blob_path: String,
}
