mod cmin_http;
mod datastore;
mod legacy;
mod random;

pub use cmin_http::CminHttpSource;
pub use datastore::DatastoreSource;
pub use legacy::LegacySource;
pub use random::RandomSource;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::archive;
use crate::telemetry::Span;

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("no seeds available from {0}")]
    NoSeeds(String),
    #[error("corpus blob {0} is invalid: {1}")]
    InvalidBlob(PathBuf, String),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("corpus directory missing: {0}")]
    MissingDirectory(PathBuf),
    #[error("every corpus source was exhausted")]
    Exhausted,
    #[error(transparent)]
    Archive(#[from] archive::ArchiveError),
    #[error(transparent)]
    State(#[from] crate::state::StateError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One seed-acquisition source. Must return a path to a tar.gz archive for
/// the given (task, harness) pair.
#[async_trait]
pub trait CorpusSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn grab_corpus_blob(&self, task_id: &str, harness: &str)
    -> Result<PathBuf, CorpusError>;
}

/// Ordered fallback chain over corpus sources. The chain is assembled at
/// bootstrap in fixed priority order; sources that are not configured are
/// simply never registered. The last registered source (random synthesis)
/// cannot fail, so the chain terminates in success whenever it is present.
pub struct CorpusGrabber {
    sources: Vec<Arc<dyn CorpusSource>>,
}

impl CorpusGrabber {
    pub fn new(sources: Vec<Arc<dyn CorpusSource>>) -> Self {
        Self { sources }
    }

    async fn grab_corpus_blob(
        &self,
        span: &dyn Span,
        task_id: &str,
        harness: &str,
    ) -> Result<PathBuf, CorpusError> {
        for source in &self.sources {
            let source_span = span.child(&format!("syncing corpus from {}", source.name()));
            match source.grab_corpus_blob(task_id, harness).await {
                Ok(blob) => {
                    info!(source = source.name(), task_id, harness, "grabbed corpus");
                    return Ok(blob);
                }
                Err(err) => {
                    warn!(
                        source = source.name(),
                        task_id,
                        harness,
                        error = %err,
                        "failed to grab corpus"
                    );
                    source_span.add_event("failed_to_grab_corpus");
                }
            }
        }
        Err(CorpusError::Exhausted)
    }

    /// Resolve a corpus blob through the chain and extract it flat into
    /// `dir`. Fails only if `dir` is missing or the whole chain is exhausted.
    pub async fn collect_corpus_to_dir(
        &self,
        span: &dyn Span,
        task_id: &str,
        harness: &str,
        dir: &Path,
    ) -> Result<(), CorpusError> {
        if !dir.is_dir() {
            return Err(CorpusError::MissingDirectory(dir.to_path_buf()));
        }

        let sync_span = span.child("syncing corpus");
        let blob = self.grab_corpus_blob(sync_span.as_ref(), task_id, harness).await?;
        let seed_count = archive::unpack_flat(&blob, dir)?;

        info!(task_id, harness, dir = %dir.display(), seed_count, "corpus ready for fuzzing");
        sync_span.set_attribute("corpus_size", &seed_count.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{NoopTracer, Tracer};

    struct FailingSource(&'static str);

    #[async_trait]
    impl CorpusSource for FailingSource {
        fn name(&self) -> &'static str {
            self.0
        }
        async fn grab_corpus_blob(&self, _: &str, _: &str) -> Result<PathBuf, CorpusError> {
            Err(CorpusError::NoSeeds(self.0.to_string()))
        }
    }

    /// Source 3 in the chain scenario: claims success but points at a path
    /// that does not exist, so validation fails.
    struct BogusPathSource;

    #[async_trait]
    impl CorpusSource for BogusPathSource {
        fn name(&self) -> &'static str {
            "bogus"
        }
        async fn grab_corpus_blob(&self, _: &str, _: &str) -> Result<PathBuf, CorpusError> {
            let path = PathBuf::from("/nonexistent/corpus.tar.gz");
            Err(CorpusError::InvalidBlob(path, "missing".to_string()))
        }
    }

    #[tokio::test]
    async fn chain_falls_through_to_guaranteed_source() {
        let scratch = tempfile::tempdir().unwrap();
        let grabber = CorpusGrabber::new(vec![
            Arc::new(FailingSource("cmin-http")),
            Arc::new(FailingSource("datastore")),
            Arc::new(BogusPathSource),
            Arc::new(RandomSource::new(scratch.path().to_path_buf())),
        ]);

        let tracer = NoopTracer;
        let span = tracer.span("test");
        let dir = tempfile::tempdir().unwrap();
        grabber
            .collect_corpus_to_dir(span.as_ref(), "t1", "h1", dir.path())
            .await
            .unwrap();
        // the random synthesizer produced its fixed batch of seed files
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 30);
    }

    #[tokio::test]
    async fn missing_target_dir_fails_fast() {
        let scratch = tempfile::tempdir().unwrap();
        let grabber =
            CorpusGrabber::new(vec![Arc::new(RandomSource::new(scratch.path().to_path_buf()))]);
        let tracer = NoopTracer;
        let span = tracer.span("test");
        let err = grabber
            .collect_corpus_to_dir(span.as_ref(), "t1", "h1", Path::new("/no/such/dir"))
            .await
            .unwrap_err();
        assert!(matches!(err, CorpusError::MissingDirectory(_)));
    }

    #[tokio::test]
    async fn exhausted_chain_surfaces_error() {
        let grabber = CorpusGrabber::new(vec![Arc::new(FailingSource("only"))]);
        let tracer = NoopTracer;
        let span = tracer.span("test");
        let dir = tempfile::tempdir().unwrap();
        let err = grabber
            .collect_corpus_to_dir(span.as_ref(), "t1", "h1", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CorpusError::Exhausted));
    }
}
