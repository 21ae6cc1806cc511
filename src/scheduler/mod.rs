mod factors;
mod picker;

pub use factors::{SanitizerPriorityFactor, ScoreFactor, TaskBalanceFactor};
pub use picker::Picker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::state::{FUZZLETS_KEY, SharedState, StateError, task_status_key};
use crate::types::{Fuzzlet, TaskStatus};

const EPOCH_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no fuzzlets available")]
    NoFuzzlets,
    #[error(transparent)]
    State(#[from] StateError),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// Seam between the scheduler and the fuzz-run orchestrator: dispatch one
/// fuzzlet with a fixed time budget and block until the run returns.
#[async_trait]
pub trait FuzzDispatch: Send + Sync {
    async fn run_fuzz(&self, fuzzlet: Arc<Fuzzlet>, budget: Duration) -> anyhow::Result<()>;
}

/// Epoch loop: fetch eligible fuzzlets, score, weighted-random select,
/// dispatch (blocking), repeat. One epoch completes before the next begins.
pub struct Scheduler {
    state: Arc<dyn SharedState>,
    dispatch: Arc<dyn FuzzDispatch>,
    picker: Picker,
}

/// Handle for cooperative shutdown; `stop` waits for the loop to exit.
pub struct SchedulerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            error!(error = %err, "scheduler task panicked");
        }
    }
}

impl Scheduler {
    pub fn new(
        state: Arc<dyn SharedState>,
        dispatch: Arc<dyn FuzzDispatch>,
        picker: Picker,
    ) -> Self {
        Self {
            state,
            dispatch,
            picker,
        }
    }

    pub fn spawn(self, token: CancellationToken) -> SchedulerHandle {
        let loop_token = token.clone();
        let task = tokio::spawn(async move { self.run(loop_token).await });
        SchedulerHandle { token, task }
    }

    async fn run(self, token: CancellationToken) {
        let mut backoff = Duration::ZERO;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("scheduler cancelled, stopping");
                    return;
                }
                _ = tokio::time::sleep(backoff) => {
                    backoff = match self.step_epoch().await {
                        Ok(()) => Duration::ZERO,
                        Err(err) => {
                            warn!(error = %err, "epoch failed, backing off");
                            EPOCH_BACKOFF
                        }
                    };
                }
            }
        }
    }

    /// Run one epoch (blocking for the whole fuzz run).
    async fn step_epoch(&self) -> Result<(), ScheduleError> {
        let fuzzlets = self.fetch_fuzzlets().await?;
        if fuzzlets.is_empty() {
            return Err(ScheduleError::NoFuzzlets);
        }

        let (fuzzlet, budget) = self.picker.pick(&fuzzlets, &mut rand::rng());
        info!(
            task_id = %fuzzlet.task_id,
            harness = %fuzzlet.harness,
            sanitizer = %fuzzlet.sanitizer,
            engine = %fuzzlet.fuzz_engine,
            "dispatching fuzzlet"
        );
        self.dispatch
            .run_fuzz(fuzzlet, budget)
            .await
            .map_err(|err| ScheduleError::Dispatch(err.to_string()))
    }

    /// Read all fuzzlet records from shared state and keep only those whose
    /// task is actively processing. Canceled fuzzlets are also removed from
    /// the shared set; a failed status lookup is presumed transient and the
    /// fuzzlet is skipped without removal.
    async fn fetch_fuzzlets(&self) -> Result<Vec<Arc<Fuzzlet>>, ScheduleError> {
        let records = self.state.set_members(FUZZLETS_KEY).await?;
        let mut fuzzlets = Vec::with_capacity(records.len());

        for record in records {
            let fuzzlet: Fuzzlet = match serde_json::from_str(&record) {
                Ok(f) => f,
                Err(err) => {
                    warn!(error = %err, "skipping undecodable fuzzlet record");
                    continue;
                }
            };

            let status = match self.state.get(&task_status_key(&fuzzlet.task_id)).await {
                Ok(Some(raw)) => TaskStatus::parse(&raw),
                Ok(None) | Err(_) => {
                    warn!(task_id = %fuzzlet.task_id, "failed to get task status, skipping");
                    continue;
                }
            };

            match status {
                TaskStatus::Processing => fuzzlets.push(Arc::new(fuzzlet)),
                TaskStatus::Canceled => {
                    debug!(task_id = %fuzzlet.task_id, "removing canceled fuzzlet");
                    if let Err(err) = self.state.set_remove(FUZZLETS_KEY, &record).await {
                        error!(task_id = %fuzzlet.task_id, error = %err, "failed to remove fuzzlet");
                    }
                }
                TaskStatus::Other(other) => {
                    debug!(task_id = %fuzzlet.task_id, status = %other, "task not processing, skipping");
                }
            }
        }

        info!(count = fuzzlets.len(), "got fuzzlets from shared state");
        Ok(fuzzlets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryState;
    use tokio::sync::Mutex;

    struct RecordingDispatch {
        runs: Mutex<Vec<Arc<Fuzzlet>>>,
    }

    #[async_trait]
    impl FuzzDispatch for RecordingDispatch {
        async fn run_fuzz(&self, fuzzlet: Arc<Fuzzlet>, _budget: Duration) -> anyhow::Result<()> {
            self.runs.lock().await.push(fuzzlet);
            Ok(())
        }
    }

    fn fuzzlet(task: &str) -> Fuzzlet {
        Fuzzlet {
            task_id: task.to_string(),
            harness: "h1".to_string(),
            sanitizer: "address".to_string(),
            fuzz_engine: "aflpp".to_string(),
            artifact_path: "/artifacts/x".to_string(),
        }
    }

    async fn seed_state(state: &MemoryState, fuzzlet: &Fuzzlet, status: &str) {
        state
            .set_add(FUZZLETS_KEY, &serde_json::to_string(fuzzlet).unwrap())
            .await
            .unwrap();
        state
            .put(&task_status_key(&fuzzlet.task_id), status)
            .await
            .unwrap();
    }

    fn scheduler(state: Arc<MemoryState>, dispatch: Arc<RecordingDispatch>) -> Scheduler {
        Scheduler::new(
            state,
            dispatch,
            Picker::new(Duration::from_secs(600)),
        )
    }

    #[tokio::test]
    async fn fetch_keeps_processing_removes_canceled_skips_unknown() {
        let state = Arc::new(MemoryState::new());
        seed_state(&state, &fuzzlet("running"), "processing").await;
        seed_state(&state, &fuzzlet("canceled"), "canceled").await;
        seed_state(&state, &fuzzlet("errored"), "errored").await;
        // status lookup failure: fuzzlet present, no status key at all
        state
            .set_add(FUZZLETS_KEY, &serde_json::to_string(&fuzzlet("limbo")).unwrap())
            .await
            .unwrap();

        let dispatch = Arc::new(RecordingDispatch {
            runs: Mutex::new(Vec::new()),
        });
        let sched = scheduler(Arc::clone(&state), dispatch);

        let fuzzlets = sched.fetch_fuzzlets().await.unwrap();
        assert_eq!(fuzzlets.len(), 1);
        assert_eq!(fuzzlets[0].task_id, "running");

        // only the canceled record was removed from shared state
        let remaining = state.set_members(FUZZLETS_KEY).await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(!remaining.iter().any(|r| r.contains("canceled")));
    }

    #[tokio::test]
    async fn empty_candidate_set_is_an_epoch_error() {
        let state = Arc::new(MemoryState::new());
        let dispatch = Arc::new(RecordingDispatch {
            runs: Mutex::new(Vec::new()),
        });
        let sched = scheduler(state, dispatch);
        assert!(matches!(
            sched.step_epoch().await.unwrap_err(),
            ScheduleError::NoFuzzlets
        ));
    }

    #[tokio::test]
    async fn epoch_dispatches_the_picked_fuzzlet_and_stop_waits_for_exit() {
        let state = Arc::new(MemoryState::new());
        seed_state(&state, &fuzzlet("only"), "processing").await;
        let dispatch = Arc::new(RecordingDispatch {
            runs: Mutex::new(Vec::new()),
        });
        let sched = scheduler(state, Arc::clone(&dispatch));

        let handle = sched.spawn(CancellationToken::new());
        // the loop dispatches immediately on success; give it a few epochs
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        let runs = dispatch.runs.lock().await;
        assert!(!runs.is_empty());
        assert!(runs.iter().all(|f| f.task_id == "only"));
    }
}
