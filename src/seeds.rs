use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::archive::{self, ArchiveError};
use crate::broker::{BrokerError, ConnectionPool};
use crate::store::{Datastore, SeedOrigin, SeedRecord, StoreError};
use crate::types::{CminMessage, SeedMessage};

pub const CMIN_QUEUE: &str = "cmin_queue";

const BATCH_SIZE: usize = 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode bundle message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Fan-in aggregator for seeds discovered by fuzz runs.
///
/// N per-run forwarding tasks feed one bounded channel; a single consumer
/// batches messages and bundles each batch per (task, harness). The batch is
/// owned exclusively by the consumer loop, so no lock guards it.
pub struct SeedManager {
    seed_tx: Mutex<Option<mpsc::Sender<SeedMessage>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

struct Bundler {
    pool: Arc<ConnectionPool>,
    store: Arc<dyn Datastore>,
    seed_folder: PathBuf,
}

impl SeedManager {
    /// Start the consumer loop. Declares the downstream queue and creates
    /// the bundle folder first; failure of either is fatal to startup.
    pub async fn start(
        pool: Arc<ConnectionPool>,
        store: Arc<dyn Datastore>,
        seed_folder: PathBuf,
    ) -> Result<Self, BundleError> {
        Self::start_inner(pool, store, seed_folder, BATCH_SIZE, FLUSH_INTERVAL).await
    }

    async fn start_inner(
        pool: Arc<ConnectionPool>,
        store: Arc<dyn Datastore>,
        seed_folder: PathBuf,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Result<Self, BundleError> {
        tokio::fs::create_dir_all(&seed_folder).await?;
        pool.channel().await?.declare_queue(CMIN_QUEUE).await?;

        let (seed_tx, seed_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let bundler = Bundler {
            pool,
            store,
            seed_folder,
        };
        let consumer = tokio::spawn(consume(seed_rx, bundler, batch_size, flush_interval));

        Ok(Self {
            seed_tx: Mutex::new(Some(seed_tx)),
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Route one run's seed channel into the fan-in channel. The forwarding
    /// task holds a sender clone, so the fan-in channel cannot close before
    /// every registered run has drained.
    pub async fn register_seed_chan(&self, mut rx: mpsc::Receiver<SeedMessage>) {
        let Some(tx) = self.seed_tx.lock().await.clone() else {
            warn!("seed manager is shutting down, dropping seed channel");
            return;
        };
        tokio::spawn(async move {
            while let Some(seed) = rx.recv().await {
                if tx.send(seed).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Close the fan-in channel once all forwarders are done and wait for
    /// the final partial batch to be flushed.
    pub async fn shutdown(&self) {
        debug!("stopping seed manager");
        self.seed_tx.lock().await.take();
        if let Some(consumer) = self.consumer.lock().await.take() {
            if let Err(err) = consumer.await {
                error!(error = %err, "seed consumer panicked");
            }
        }
    }
}

async fn consume(
    mut seed_rx: mpsc::Receiver<SeedMessage>,
    bundler: Bundler,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<SeedMessage> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset(); // skip the immediate first tick

    loop {
        tokio::select! {
            seed = seed_rx.recv() => {
                match seed {
                    Some(seed) => {
                        batch.push(seed);
                        if batch.len() >= batch_size {
                            bundler.flush(std::mem::take(&mut batch)).await;
                        }
                    }
                    None => {
                        // channel closed: flush the final partial batch, then exit
                        if !batch.is_empty() {
                            bundler.flush(std::mem::take(&mut batch)).await;
                        }
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    bundler.flush(std::mem::take(&mut batch)).await;
                }
            }
        }
    }
}

impl Bundler {
    /// Bundle one batch. Groups are processed concurrently; the call returns
    /// only when every group of this batch has finished. A group failure is
    /// logged and aborts only that group.
    async fn flush(&self, batch: Vec<SeedMessage>) {
        let mut groups: HashMap<(String, String), Vec<PathBuf>> = HashMap::new();
        for msg in batch {
            groups
                .entry((msg.fuzzlet.task_id.clone(), msg.fuzzlet.harness.clone()))
                .or_default()
                .push(msg.seed_file);
        }

        let mut set = JoinSet::new();
        for ((task_id, harness), seeds) in groups {
            let bundler = Bundler {
                pool: Arc::clone(&self.pool),
                store: Arc::clone(&self.store),
                seed_folder: self.seed_folder.clone(),
            };
            set.spawn(async move {
                debug!(task_id, harness, seeds = seeds.len(), "bundling seed group");
                if let Err(err) = bundler.process_group(&task_id, &harness, seeds).await {
                    error!(task_id, harness, error = %err, "failed to bundle seed group");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    async fn process_group(
        &self,
        task_id: &str,
        harness: &str,
        seeds: Vec<PathBuf>,
    ) -> Result<(), BundleError> {
        // collision-free staging area; dropped (and removed) when done
        let tmp_dir = tempfile::tempdir()?;
        for seed in &seeds {
            if let Err(err) =
                tokio::fs::copy(seed, tmp_dir.path().join(Uuid::new_v4().to_string())).await
            {
                warn!(seed = %seed.display(), error = %err, "failed to stage seed file");
            }
        }

        let bundle_path = self
            .seed_folder
            .join(format!("{harness}-{}.tar.gz", Uuid::new_v4()));
        archive::pack_dir(tmp_dir.path(), &bundle_path)?;

        let msg = CminMessage {
            task_id: task_id.to_string(),
            harness: harness.to_string(),
            seed_blob_path: bundle_path.display().to_string(),
        };
        let payload = serde_json::to_vec(&msg)?;
        self.pool.channel().await?.publish(CMIN_QUEUE, &payload).await?;

        self.store
            .insert_seed(SeedRecord {
                task_id: task_id.to_string(),
                harness: harness.to_string(),
                path: bundle_path,
                origin: SeedOrigin::General,
                instance: instance_name(),
                coverage: 0.0,
                created_at: chrono::Utc::now(),
            })
            .await?;
        Ok(())
    }
}

fn instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
