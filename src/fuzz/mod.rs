mod command;

pub use command::{CommandEngine, CommandEngineConfig};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crash::CrashSink;
use crate::scheduler::FuzzDispatch;
use crate::seeds::SeedManager;
use crate::state::{SharedState, build_trace_key, task_metadata_key, task_trace_key};
use crate::telemetry::{Span, Tracer};
use crate::types::{CrashMessage, Fuzzlet, SeedMessage};

#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("no engine registered for {0}")]
    UnknownEngine(String),
    #[error("failed to prepare fuzzing workspace: {0}")]
    Prepare(#[from] std::io::Error),
    #[error("crash channel already consumed")]
    CrashesTaken,
    #[error("seed channel already consumed")]
    SeedsTaken,
    #[error("engine failed: {0}")]
    Engine(String),
    #[error(transparent)]
    State(#[from] crate::state::StateError),
}

/// One fuzzing engine adapter (AFL-style command runner, libFuzzer, ...).
#[async_trait]
pub trait FuzzEngine: Send + Sync {
    fn supported_engines(&self) -> &[&'static str];

    /// Start a run. Fuzzing must wind down before `budget` elapses and must
    /// be killed once `token` is cancelled.
    async fn run(
        &self,
        span: &dyn Span,
        fuzzlet: Arc<Fuzzlet>,
        budget: Duration,
        token: CancellationToken,
    ) -> Result<Box<dyn FuzzHandle>, FuzzError>;
}

/// Live fuzz run. The crash/seed channels are owned by the handle and close
/// when no more output is expected or the run is cancelled.
#[async_trait]
pub trait FuzzHandle: Send {
    fn take_crashes(&mut self) -> Result<mpsc::Receiver<CrashMessage>, FuzzError>;
    fn take_seeds(&mut self) -> Result<mpsc::Receiver<SeedMessage>, FuzzError>;

    /// Block until the run's resources are shut down or it is cancelled.
    async fn wait(self: Box<Self>);
}

/// Orchestrates one fuzz run: resolves trace/metadata context, starts the
/// engine and wires its output into the seed manager and crash sink.
pub struct FuzzRunner {
    engines: HashMap<&'static str, Arc<dyn FuzzEngine>>,
    seed_manager: Arc<SeedManager>,
    crash_sink: Arc<dyn CrashSink>,
    state: Arc<dyn SharedState>,
    tracer: Arc<dyn Tracer>,
    lifecycle: CancellationToken,
}

impl FuzzRunner {
    /// Build the static engine registry at startup.
    pub fn new(
        engines: Vec<Arc<dyn FuzzEngine>>,
        seed_manager: Arc<SeedManager>,
        crash_sink: Arc<dyn CrashSink>,
        state: Arc<dyn SharedState>,
        tracer: Arc<dyn Tracer>,
        lifecycle: CancellationToken,
    ) -> Self {
        let mut registry: HashMap<&'static str, Arc<dyn FuzzEngine>> = HashMap::new();
        for engine in engines {
            for name in engine.supported_engines().iter().copied() {
                debug!(engine = name, "fuzz engine registered");
                registry.insert(name, Arc::clone(&engine));
            }
        }
        Self {
            engines: registry,
            seed_manager,
            crash_sink,
            state,
            tracer,
            lifecycle,
        }
    }

    async fn state_value(&self, key: &str, what: &str) -> Option<String> {
        match self.state.get(key).await {
            Ok(Some(value)) => Some(value),
            Ok(None) => {
                warn!(key, "{what} not present in shared state");
                None
            }
            Err(err) => {
                warn!(key, error = %err, "failed to read {what} from shared state");
                None
            }
        }
    }

    async fn run(&self, fuzzlet: Arc<Fuzzlet>, budget: Duration) -> Result<(), FuzzError> {
        info!(
            task_id = %fuzzlet.task_id,
            harness = %fuzzlet.harness,
            sanitizer = %fuzzlet.sanitizer,
            engine = %fuzzlet.fuzz_engine,
            "running fuzzlet"
        );

        let metadata = self
            .state_value(&task_metadata_key(&fuzzlet.task_id), "task metadata")
            .await
            .and_then(|raw| serde_json::from_str::<HashMap<String, serde_json::Value>>(&raw).ok())
            .unwrap_or_default();
        let task_token = self
            .state_value(&task_trace_key(&fuzzlet.task_id), "task trace context")
            .await
            .unwrap_or_default();
        let build_token = self
            .state_value(&build_trace_key(&fuzzlet.task_id), "build trace context")
            .await;

        // spawn from the global task span; link the build span by token
        let span = self
            .tracer
            .import(&task_token, &format!("fuzzing {}", fuzzlet.task_id));
        span.set_attribute("harness", &fuzzlet.harness);
        if let Some(build_token) = build_token {
            span.set_attribute("link.build", &build_token);
        }
        for (key, value) in &metadata {
            span.set_attribute(key, &value.to_string());
        }

        let engine = self
            .engines
            .get(fuzzlet.fuzz_engine.as_str())
            .ok_or_else(|| FuzzError::UnknownEngine(fuzzlet.fuzz_engine.clone()))?;

        // run-scoped cancellation: budget expiry or process shutdown
        let run_token = self.lifecycle.child_token();
        let deadline = run_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(budget) => deadline.cancel(),
                _ = deadline.cancelled() => {}
            }
        });

        let mut handle = engine
            .run(span.as_ref(), Arc::clone(&fuzzlet), budget, run_token.clone())
            .await?;

        self.crash_sink
            .register_crash_chan(span.as_ref(), handle.take_crashes()?)
            .await;
        self.seed_manager
            .register_seed_chan(handle.take_seeds()?)
            .await;

        handle.wait().await;
        run_token.cancel();
        Ok(())
    }
}

#[async_trait]
impl FuzzDispatch for FuzzRunner {
    async fn run_fuzz(&self, fuzzlet: Arc<Fuzzlet>, budget: Duration) -> anyhow::Result<()> {
        self.run(fuzzlet, budget).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnectionPool, MemoryBroker};
    use crate::crash::FsCrashSink;
    use crate::store::{Datastore, MemoryDatastore};
    use crate::telemetry::NoopTracer;
    use std::path::PathBuf;

    /// Engine that emits a fixed set of seeds and one crash, then finishes.
    struct ScriptedEngine {
        seed_files: Vec<PathBuf>,
        crash_file: PathBuf,
    }

    struct ScriptedHandle {
        crashes: Option<mpsc::Receiver<CrashMessage>>,
        seeds: Option<mpsc::Receiver<SeedMessage>>,
        done: tokio::task::JoinHandle<()>,
    }

    #[async_trait]
    impl FuzzHandle for ScriptedHandle {
        fn take_crashes(&mut self) -> Result<mpsc::Receiver<CrashMessage>, FuzzError> {
            self.crashes.take().ok_or(FuzzError::CrashesTaken)
        }
        fn take_seeds(&mut self) -> Result<mpsc::Receiver<SeedMessage>, FuzzError> {
            self.seeds.take().ok_or(FuzzError::SeedsTaken)
        }
        async fn wait(self: Box<Self>) {
            let _ = self.done.await;
        }
    }

    #[async_trait]
    impl FuzzEngine for ScriptedEngine {
        fn supported_engines(&self) -> &[&'static str] {
            &["scripted"]
        }

        async fn run(
            &self,
            _span: &dyn Span,
            fuzzlet: Arc<Fuzzlet>,
            _budget: Duration,
            _token: CancellationToken,
        ) -> Result<Box<dyn FuzzHandle>, FuzzError> {
            let (crash_tx, crash_rx) = mpsc::channel(8);
            let (seed_tx, seed_rx) = mpsc::channel(8);
            let seeds = self.seed_files.clone();
            let crash = self.crash_file.clone();
            let done = tokio::spawn(async move {
                for seed_file in seeds {
                    let _ = seed_tx
                        .send(SeedMessage {
                            seed_file,
                            fuzzlet: Arc::clone(&fuzzlet),
                        })
                        .await;
                }
                let _ = crash_tx
                    .send(CrashMessage {
                        crash_file: crash,
                        fuzzlet: Arc::clone(&fuzzlet),
                    })
                    .await;
            });
            Ok(Box::new(ScriptedHandle {
                crashes: Some(crash_rx),
                seeds: Some(seed_rx),
                done,
            }))
        }
    }

    #[tokio::test]
    async fn run_wires_engine_output_to_seed_manager_and_crash_sink() {
        let broker = Arc::new(MemoryBroker::new());
        let pool = Arc::new(ConnectionPool::connect(broker, 1).await.unwrap());
        let store = Arc::new(MemoryDatastore::new());
        let seed_dir = tempfile::tempdir().unwrap();
        let crash_dir = tempfile::tempdir().unwrap();

        let seed_manager = Arc::new(
            SeedManager::start(
                Arc::clone(&pool),
                store.clone() as Arc<dyn Datastore>,
                seed_dir.path().to_path_buf(),
            )
            .await
            .unwrap(),
        );
        let crash_sink = Arc::new(
            FsCrashSink::start(store.clone() as Arc<dyn Datastore>, crash_dir.path().into())
                .await
                .unwrap(),
        );

        let work = tempfile::tempdir().unwrap();
        let seed_file = work.path().join("s1");
        let crash_file = work.path().join("c1");
        tokio::fs::write(&seed_file, b"seed").await.unwrap();
        tokio::fs::write(&crash_file, b"crash").await.unwrap();

        let runner = FuzzRunner::new(
            vec![Arc::new(ScriptedEngine {
                seed_files: vec![seed_file],
                crash_file,
            })],
            Arc::clone(&seed_manager),
            crash_sink.clone(),
            Arc::new(crate::state::MemoryState::new()),
            Arc::new(NoopTracer),
            CancellationToken::new(),
        );

        let fuzzlet = Arc::new(Fuzzlet {
            task_id: "t1".into(),
            harness: "h1".into(),
            sanitizer: "address".into(),
            fuzz_engine: "scripted".into(),
            artifact_path: "/x".into(),
        });
        runner
            .run_fuzz(fuzzlet, Duration::from_secs(5))
            .await
            .unwrap();

        seed_manager.shutdown().await;
        crash_sink.shutdown().await;

        assert_eq!(store.crash_rows().await.len(), 1);
        assert_eq!(store.seed_rows().await.len(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_engine_is_an_error() {
        let broker = Arc::new(MemoryBroker::new());
        let pool = Arc::new(ConnectionPool::connect(broker, 1).await.unwrap());
        let store = Arc::new(MemoryDatastore::new());
        let seed_dir = tempfile::tempdir().unwrap();
        let crash_dir = tempfile::tempdir().unwrap();
        let seed_manager = Arc::new(
            SeedManager::start(
                Arc::clone(&pool),
                store.clone() as Arc<dyn Datastore>,
                seed_dir.path().to_path_buf(),
            )
            .await
            .unwrap(),
        );
        let crash_sink = Arc::new(
            FsCrashSink::start(store as Arc<dyn Datastore>, crash_dir.path().into())
                .await
                .unwrap(),
        );

        let runner = FuzzRunner::new(
            vec![],
            seed_manager,
            crash_sink,
            Arc::new(crate::state::MemoryState::new()),
            Arc::new(NoopTracer),
            CancellationToken::new(),
        );
        let fuzzlet = Arc::new(Fuzzlet {
            task_id: "t1".into(),
            harness: "h1".into(),
            sanitizer: "address".into(),
            fuzz_engine: "nope".into(),
            artifact_path: "/x".into(),
        });
        let err = runner.run(fuzzlet, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, FuzzError::UnknownEngine(_)));
        pool.shutdown().await;
    }
}
