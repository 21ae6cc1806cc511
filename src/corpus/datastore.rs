use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{CorpusError, CorpusSource};
use crate::archive;
use crate::store::{Datastore, SeedOrigin, SeedRecord};

/// How many of the newest general-fuzz bundles to mix in next to the
/// curated origin categories.
const GENERAL_LIMIT: usize = 10;

/// Corpus source over the relational store: curated seed bundles (seedgen,
/// minimized, corpus, directed origins) plus the most recent general-fuzz
/// bundles, re-packed into one flat archive.
pub struct DatastoreSource {
    store: Arc<dyn Datastore>,
    scratch_dir: PathBuf,
}

impl DatastoreSource {
    pub fn new(store: Arc<dyn Datastore>, scratch_dir: PathBuf) -> Self {
        Self { store, scratch_dir }
    }

    fn select_paths(mut rows: Vec<SeedRecord>) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = rows
            .iter()
            .filter(|r| {
                matches!(
                    r.origin,
                    SeedOrigin::SeedGen
                        | SeedOrigin::Minimized
                        | SeedOrigin::Corpus
                        | SeedOrigin::Directed
                )
            })
            .map(|r| r.path.clone())
            .collect();

        rows.retain(|r| r.origin == SeedOrigin::General);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        paths.extend(rows.into_iter().take(GENERAL_LIMIT).map(|r| r.path));
        paths
    }
}

#[async_trait]
impl CorpusSource for DatastoreSource {
    fn name(&self) -> &'static str {
        "datastore"
    }

    async fn grab_corpus_blob(
        &self,
        task_id: &str,
        harness: &str,
    ) -> Result<PathBuf, CorpusError> {
        let rows = self.store.seeds(task_id, harness).await?;
        let paths = Self::select_paths(rows);
        if paths.is_empty() {
            info!(task_id, harness, "no seeds found in datastore");
            return Err(CorpusError::NoSeeds("datastore".to_string()));
        }

        let whole_blob = self.scratch_dir.join("dbseeds").join(task_id).join(harness);
        let tar_path = self
            .scratch_dir
            .join("dbseeds")
            .join(format!("{task_id}_{harness}_seeds.tar.gz"));
        tokio::fs::create_dir_all(&whole_blob).await?;

        // merge every bundle into one flat directory, then re-pack
        for path in &paths {
            if let Err(err) = archive::unpack_flat(path, &whole_blob) {
                warn!(path = %path.display(), error = %err, "failed to unpack seed bundle");
            }
        }
        archive::pack_dir(&whole_blob, &tar_path)?;

        info!(task_id, harness, bundles = paths.len(), "merged seeds from datastore");
        Ok(tar_path)
    }
}
