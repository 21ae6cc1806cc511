use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::store::{CrashRecord, Datastore, StoreError};
use crate::telemetry::Span;
use crate::types::CrashMessage;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum CrashError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Downstream consumer of crash channels produced by fuzz runs.
#[async_trait]
pub trait CrashSink: Send + Sync {
    async fn register_crash_chan(&self, span: &dyn Span, rx: mpsc::Receiver<CrashMessage>);
}

/// Stores each crash under a content-addressed path and records it in the
/// datastore for triage. Fan-in and shutdown follow the same protocol as
/// the seed manager: forwarders hold sender clones, the channel closes only
/// after every run has drained.
pub struct FsCrashSink {
    crash_tx: Mutex<Option<mpsc::Sender<CrashMessage>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl FsCrashSink {
    pub async fn start(
        store: Arc<dyn Datastore>,
        crash_folder: PathBuf,
    ) -> Result<Self, CrashError> {
        tokio::fs::create_dir_all(&crash_folder).await?;
        let (crash_tx, mut crash_rx) = mpsc::channel::<CrashMessage>(CHANNEL_CAPACITY);
        let consumer = tokio::spawn(async move {
            while let Some(crash) = crash_rx.recv().await {
                if let Err(err) = process_crash(&store, &crash_folder, &crash).await {
                    error!(error = %err, "failed to process crash file");
                }
            }
        });
        Ok(Self {
            crash_tx: Mutex::new(Some(crash_tx)),
            consumer: Mutex::new(Some(consumer)),
        })
    }

    pub async fn shutdown(&self) {
        self.crash_tx.lock().await.take();
        if let Some(consumer) = self.consumer.lock().await.take() {
            if let Err(err) = consumer.await {
                error!(error = %err, "crash consumer panicked");
            }
        }
    }
}

#[async_trait]
impl CrashSink for FsCrashSink {
    async fn register_crash_chan(&self, span: &dyn Span, mut rx: mpsc::Receiver<CrashMessage>) {
        let Some(tx) = self.crash_tx.lock().await.clone() else {
            debug!("crash sink is shutting down, dropping crash channel");
            return;
        };
        let pov_span = span.child("POV manager");
        tokio::spawn(async move {
            let mut pov_counter = 0usize;
            while let Some(crash) = rx.recv().await {
                pov_counter += 1;
                debug!(crash = %crash.crash_file.display(), "new crash message received");
                if tx.send(crash).await.is_err() {
                    break;
                }
            }
            pov_span.set_attribute("pov_found", &pov_counter.to_string());
        });
    }
}

async fn process_crash(
    store: &Arc<dyn Datastore>,
    crash_folder: &std::path::Path,
    msg: &CrashMessage,
) -> Result<(), CrashError> {
    let crash_store = crash_folder
        .join(&msg.fuzzlet.task_id)
        .join(&msg.fuzzlet.harness)
        .join(&msg.fuzzlet.sanitizer);
    tokio::fs::create_dir_all(&crash_store).await?;

    // content-addressed name deduplicates identical crashing inputs
    let data = tokio::fs::read(&msg.crash_file).await?;
    let digest = md5::compute(&data);
    let crash_path = crash_store.join(format!("{digest:x}"));
    tokio::fs::write(&crash_path, &data).await?;

    store
        .insert_crash(CrashRecord {
            task_id: msg.fuzzlet.task_id.clone(),
            harness: msg.fuzzlet.harness.clone(),
            sanitizer: msg.fuzzlet.sanitizer.clone(),
            poc_path: crash_path,
            created_at: chrono::Utc::now(),
        })
        .await?;
    Ok(())
}
