use std::path::PathBuf;

use async_trait::async_trait;
use rand::RngCore;

use super::{CorpusError, CorpusSource};
use crate::archive;

const SEED_COUNT: usize = 30;
const SEED_SIZE: usize = 1024;

/// Last-resort corpus source: synthesizes a batch of random seed files so
/// the fallback chain can always terminate in success.
pub struct RandomSource {
    scratch_dir: PathBuf,
}

impl RandomSource {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self { scratch_dir }
    }
}

#[async_trait]
impl CorpusSource for RandomSource {
    fn name(&self) -> &'static str {
        "random-synth"
    }

    async fn grab_corpus_blob(
        &self,
        task_id: &str,
        harness: &str,
    ) -> Result<PathBuf, CorpusError> {
        let seed_folder = self.scratch_dir.join("fakeseeds").join(task_id).join(harness);
        let tar_path = self
            .scratch_dir
            .join("fakeseeds")
            .join(format!("{task_id}_{harness}_seeds.tar.gz"));
        tokio::fs::create_dir_all(&seed_folder).await?;

        for i in 0..SEED_COUNT {
            let mut data = vec![0u8; SEED_SIZE];
            rand::rng().fill_bytes(&mut data);
            tokio::fs::write(seed_folder.join(format!("seed{i}.bin")), data).await?;
        }

        archive::pack_dir(&seed_folder, &tar_path)?;
        Ok(tar_path)
    }
}
