use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{CorpusError, CorpusSource};
use crate::archive;
use crate::state::{SharedState, legacy_cmin_key};

/// Legacy corpus source: the minimizer's predecessor left archive paths
/// under `cmin:{task}:{harness}` in shared state. The referenced blob is
/// validated for existence, non-emptiness and archive format before use.
pub struct LegacySource {
    state: Arc<dyn SharedState>,
}

impl LegacySource {
    pub fn new(state: Arc<dyn SharedState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CorpusSource for LegacySource {
    fn name(&self) -> &'static str {
        "legacy-cmin"
    }

    async fn grab_corpus_blob(
        &self,
        task_id: &str,
        harness: &str,
    ) -> Result<PathBuf, CorpusError> {
        let key = legacy_cmin_key(task_id, harness);
        let seed_path = self
            .state
            .get(&key)
            .await?
            .ok_or_else(|| CorpusError::NoSeeds("legacy-cmin".to_string()))?;
        let seed_path = PathBuf::from(seed_path);

        info!(task_id, harness, path = %seed_path.display(), "got seed blob from legacy cmin");

        let metadata = tokio::fs::metadata(&seed_path)
            .await
            .map_err(|_| CorpusError::InvalidBlob(seed_path.clone(), "does not exist".into()))?;
        if metadata.len() == 0 {
            return Err(CorpusError::InvalidBlob(seed_path, "empty file".into()));
        }
        if !archive::is_tar_gz(&seed_path) {
            return Err(CorpusError::InvalidBlob(
                seed_path,
                "not a valid tar.gz file".into(),
            ));
        }

        Ok(seed_path)
    }
}
