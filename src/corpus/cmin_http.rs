use std::path::PathBuf;

use async_trait::async_trait;

use super::{CorpusError, CorpusSource};

/// Corpus source backed by the external minimization service:
/// `GET /cmin/{task}/{harness}` returns the path of a minimized archive.
pub struct CminHttpSource {
    client: reqwest::Client,
    host: String,
}

impl CminHttpSource {
    pub fn new(host: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            host,
        }
    }
}

#[async_trait]
impl CorpusSource for CminHttpSource {
    fn name(&self) -> &'static str {
        "cmin-http"
    }

    async fn grab_corpus_blob(
        &self,
        task_id: &str,
        harness: &str,
    ) -> Result<PathBuf, CorpusError> {
        let endpoint = format!("http://{}/cmin/{}/{}", self.host, task_id, harness);
        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| CorpusError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CorpusError::Http(format!(
                "unexpected status {} from {endpoint}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CorpusError::Http(e.to_string()))?;
        Ok(PathBuf::from(body.trim()))
    }
}
