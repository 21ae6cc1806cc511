use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{FuzzEngine, FuzzError, FuzzHandle};
use crate::corpus::CorpusGrabber;
use crate::state::{SharedState, dicts_key};
use crate::telemetry::Span;
use crate::types::{CrashMessage, Fuzzlet, SeedMessage};
use crate::watchdog::{PathFilter, PollingEventSource, WatchDog};

const NOTIFY_CAPACITY: usize = 1024;

/// Configuration for an external AFL-style fuzzer binary.
///
/// `args` is rendered per instance with `{seeds}`, `{output}`, `{harness}`,
/// `{instance}` and `{mode_flag}` placeholders, so the same adapter drives
/// any engine with a comparable command line.
#[derive(Debug, Clone)]
pub struct CommandEngineConfig {
    pub engines: Vec<&'static str>,
    pub program: String,
    pub args: Vec<String>,
    /// Appended to `args` only when a merged dictionary is available;
    /// `{dict}` expands to its path.
    pub dict_args: Vec<String>,
    pub scratch_dir: PathBuf,
    pub core_count: usize,
    pub watch_poll: Duration,
    pub monitor_poll: Duration,
}

impl CommandEngineConfig {
    pub fn aflpp(scratch_dir: PathBuf, core_count: usize) -> Self {
        Self {
            engines: vec!["afl", "aflpp", "directed"],
            program: "afl-fuzz".to_string(),
            args: [
                "-i", "{seeds}", "-o", "{output}", "{mode_flag}", "{instance}", "-t", "5000",
                "--", "{harness}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            dict_args: vec!["-x".to_string(), "{dict}".to_string()],
            scratch_dir,
            core_count: core_count.max(1),
            watch_poll: Duration::from_secs(1),
            monitor_poll: Duration::from_secs(10),
        }
    }
}

/// Engine adapter that runs one master and N-1 secondary instances of an
/// external fuzzer, discovering their crash and queue output through
/// watchdogs.
pub struct CommandEngine {
    config: CommandEngineConfig,
    corpus: Arc<CorpusGrabber>,
    state: Arc<dyn SharedState>,
}

impl CommandEngine {
    pub fn new(
        config: CommandEngineConfig,
        corpus: Arc<CorpusGrabber>,
        state: Arc<dyn SharedState>,
    ) -> Self {
        Self {
            config,
            corpus,
            state,
        }
    }

    /// Merge every dictionary registered for the pair into one local file,
    /// dropping blank lines, comments and duplicate entries.
    async fn grab_dict(&self, fuzzlet: &Fuzzlet) -> Result<PathBuf, FuzzError> {
        let paths = self
            .state
            .set_members(&dicts_key(&fuzzlet.task_id, &fuzzlet.harness))
            .await?;
        if paths.is_empty() {
            return Err(FuzzError::Engine(format!(
                "no dictionaries for harness {}",
                fuzzlet.harness
            )));
        }

        let mut seen = std::collections::HashSet::new();
        let mut merged = Vec::new();
        for path in &paths {
            let content = tokio::fs::read_to_string(path).await?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if seen.insert(line.to_string()) {
                    merged.push(line.to_string());
                }
            }
        }

        let dict_path = self
            .config
            .scratch_dir
            .join(&fuzzlet.task_id)
            .join(&fuzzlet.harness)
            .join("merged.dict");
        tokio::fs::write(&dict_path, merged.join("\n")).await?;
        debug!(dicts = paths.len(), entries = merged.len(), "merged dictionaries");
        Ok(dict_path)
    }

    /// Copy the harness binary off the shared artifact store; fuzzing I/O
    /// should hit the local disk.
    async fn prepare_local_harness(&self, fuzzlet: &Fuzzlet) -> Result<PathBuf, FuzzError> {
        let shared = PathBuf::from(&fuzzlet.artifact_path);
        let binary_name = shared
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "harness".into());
        let local = self
            .config
            .scratch_dir
            .join("artifacts")
            .join(&fuzzlet.task_id)
            .join(&fuzzlet.harness)
            .join(&fuzzlet.sanitizer)
            .join(binary_name);
        tokio::fs::create_dir_all(local.parent().expect("harness path has a parent")).await?;
        tokio::fs::copy(&shared, &local).await?;
        Ok(local)
    }

    async fn prepare_dirs(&self, fuzzlet: &Fuzzlet) -> Result<(PathBuf, PathBuf), FuzzError> {
        let base = self
            .config
            .scratch_dir
            .join(&fuzzlet.task_id)
            .join(&fuzzlet.harness);
        let seeds = base.join("seeds");
        let output = base.join(&fuzzlet.sanitizer).join("output");
        for dir in [&seeds, &output] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok((seeds, output))
    }

    fn render_args(
        &self,
        seeds: &Path,
        output: &Path,
        harness: &Path,
        dict: Option<&Path>,
        instance: &str,
        mode_flag: &str,
    ) -> Vec<String> {
        let base = self.config.args.iter();
        let dict_extra = dict.map(|_| self.config.dict_args.iter()).into_iter().flatten();
        base.chain(dict_extra)
            .map(|arg| {
                arg.replace("{seeds}", &seeds.display().to_string())
                    .replace("{output}", &output.display().to_string())
                    .replace("{harness}", &harness.display().to_string())
                    .replace("{dict}", &dict.map(|d| d.display().to_string()).unwrap_or_default())
                    .replace("{instance}", instance)
                    .replace("{mode_flag}", mode_flag)
            })
            .collect()
    }

    fn spawn_instance(
        &self,
        instances: &mut JoinSet<()>,
        args: Vec<String>,
        instance: String,
        token: CancellationToken,
        graceful: Duration,
    ) {
        let program = self.config.program.clone();
        instances.spawn(async move {
            let mut cmd = Command::new(&program);
            cmd.args(&args).kill_on_drop(true);
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(err) => {
                    error!(instance, error = %err, "failed to spawn fuzzer instance");
                    return;
                }
            };
            debug!(instance, "fuzzer instance started");
            tokio::select! {
                status = child.wait() => {
                    info!(instance, ?status, "fuzzer instance exited");
                }
                _ = token.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    info!(instance, "fuzzer instance cancelled");
                }
                _ = tokio::time::sleep(graceful) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    info!(instance, "fuzzer instance reached graceful deadline");
                }
            }
        });
    }
}

#[async_trait]
impl FuzzEngine for CommandEngine {
    fn supported_engines(&self) -> &[&'static str] {
        &self.config.engines
    }

    async fn run(
        &self,
        span: &dyn Span,
        fuzzlet: Arc<Fuzzlet>,
        budget: Duration,
        token: CancellationToken,
    ) -> Result<Box<dyn FuzzHandle>, FuzzError> {
        span.add_event("engine.prepare_harness");
        let harness = self.prepare_local_harness(&fuzzlet).await?;
        let (seeds, output) = self.prepare_dirs(&fuzzlet).await?;

        span.add_event("engine.prepare_seeds");
        if let Err(err) = self
            .corpus
            .collect_corpus_to_dir(span, &fuzzlet.task_id, &fuzzlet.harness, &seeds)
            .await
        {
            // the run can still make progress on whatever is already there
            error!(task_id = %fuzzlet.task_id, error = %err, "failed to grab seeds");
        }

        span.add_event("engine.prepare_dicts");
        let dict = match self.grab_dict(&fuzzlet).await {
            Ok(path) => Some(path),
            Err(err) => {
                error!(harness = %fuzzlet.harness, error = %err, "failed to grab dict, will not use it");
                None
            }
        };

        // leave the engine 10% of the budget to wind down before the kill
        let graceful = budget.mul_f64(0.9);

        span.add_event("engine.start");
        let mut instances = JoinSet::new();
        let master_args =
            self.render_args(&seeds, &output, &harness, dict.as_deref(), "master", "-M");
        self.spawn_instance(
            &mut instances,
            master_args,
            "master".to_string(),
            token.clone(),
            graceful,
        );
        for idx in 0..self.config.core_count.saturating_sub(1) {
            let name = format!("slave_{idx}");
            let args = self.render_args(&seeds, &output, &harness, dict.as_deref(), &name, "-S");
            self.spawn_instance(&mut instances, args, name, token.clone(), graceful);
        }

        // crash discovery: per-instance crashes/ dirs appear lazily
        let (crash_notify_tx, crash_notify_rx) = mpsc::channel(NOTIFY_CAPACITY);
        let (crash_tx, crash_rx) = mpsc::channel(NOTIFY_CAPACITY);
        let crash_filter: PathFilter =
            Arc::new(|p: &Path| p.file_name().is_none_or(|n| n != "README.txt"));
        let crash_dog = WatchDog::spawn(
            PollingEventSource::new(self.config.watch_poll),
            token.clone(),
            crash_notify_tx,
            Some(crash_filter),
        );
        tokio::spawn(crash_monitor(
            output.clone(),
            crash_dog,
            self.config.core_count,
            token.clone(),
            self.config.monitor_poll,
        ));
        tokio::spawn(crash_proxy(
            span.child("crash proxy"),
            Arc::clone(&fuzzlet),
            crash_notify_rx,
            crash_tx,
        ));

        // seed discovery: the master's shared queue/ dir
        let (seed_notify_tx, seed_notify_rx) = mpsc::channel(NOTIFY_CAPACITY);
        let (seed_tx, seed_rx) = mpsc::channel(NOTIFY_CAPACITY);
        let seed_filter: PathFilter = Arc::new(|p: &Path| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_none_or(|n| !n.contains("orig:"))
        });
        let queue_dog = WatchDog::spawn(
            PollingEventSource::new(self.config.watch_poll),
            token.clone(),
            seed_notify_tx,
            Some(seed_filter),
        );
        tokio::spawn(queue_monitor(
            output.join("master").join("queue"),
            queue_dog,
            token.clone(),
            self.config.monitor_poll,
        ));
        tokio::spawn(seed_proxy(Arc::clone(&fuzzlet), seed_notify_rx, seed_tx));

        Ok(Box::new(CommandHandle {
            crashes: Some(crash_rx),
            seeds: Some(seed_rx),
            instances,
        }))
    }
}

struct CommandHandle {
    crashes: Option<mpsc::Receiver<CrashMessage>>,
    seeds: Option<mpsc::Receiver<SeedMessage>>,
    instances: JoinSet<()>,
}

#[async_trait]
impl FuzzHandle for CommandHandle {
    fn take_crashes(&mut self) -> Result<mpsc::Receiver<CrashMessage>, FuzzError> {
        self.crashes.take().ok_or(FuzzError::CrashesTaken)
    }

    fn take_seeds(&mut self) -> Result<mpsc::Receiver<SeedMessage>, FuzzError> {
        self.seeds.take().ok_or(FuzzError::SeedsTaken)
    }

    async fn wait(self: Box<Self>) {
        let mut instances = self.instances;
        while instances.join_next().await.is_some() {}
    }
}

/// Register each instance's `crashes/` directory with the watchdog as it
/// appears; "not yet created" is not a watch failure. Stops once every
/// expected instance is covered or the run ends.
async fn crash_monitor(
    output: PathBuf,
    dog: WatchDog,
    instance_count: usize,
    token: CancellationToken,
    poll: Duration,
) {
    let mut watched = std::collections::HashSet::new();
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                let Ok(mut entries) = tokio::fs::read_dir(&output).await else { continue };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let crash_dir = entry.path().join("crashes");
                    if crash_dir.is_dir() && watched.insert(crash_dir.clone()) {
                        debug!(dir = %crash_dir.display(), "watching instance crash folder");
                        dog.add_dir(crash_dir);
                    }
                }
                if watched.len() == instance_count {
                    debug!("all crash directories watched");
                    return;
                }
            }
        }
    }
}

/// Wait for the master queue directory to exist, then register it.
async fn queue_monitor(queue_dir: PathBuf, dog: WatchDog, token: CancellationToken, poll: Duration) {
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if queue_dir.is_dir() {
                    debug!(dir = %queue_dir.display(), "watching queue folder");
                    dog.add_dir(queue_dir);
                    return;
                }
            }
        }
    }
}

async fn crash_proxy(
    span: Box<dyn Span>,
    fuzzlet: Arc<Fuzzlet>,
    mut notify_rx: mpsc::Receiver<PathBuf>,
    crash_tx: mpsc::Sender<CrashMessage>,
) {
    let mut ever_found = false;
    while let Some(crash_file) = notify_rx.recv().await {
        if !ever_found {
            span.add_event("first_pov_found");
            span.set_attribute(
                "pov_name",
                &crash_file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
            ever_found = true;
        }
        if crash_tx
            .send(CrashMessage {
                crash_file,
                fuzzlet: Arc::clone(&fuzzlet),
            })
            .await
            .is_err()
        {
            warn!("crash consumer went away");
            return;
        }
    }
}

async fn seed_proxy(
    fuzzlet: Arc<Fuzzlet>,
    mut notify_rx: mpsc::Receiver<PathBuf>,
    seed_tx: mpsc::Sender<SeedMessage>,
) {
    while let Some(seed_file) = notify_rx.recv().await {
        if seed_tx
            .send(SeedMessage {
                seed_file,
                fuzzlet: Arc::clone(&fuzzlet),
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryState;
    use crate::telemetry::{NoopTracer, Tracer};

    fn fuzzlet(artifact: &Path) -> Arc<Fuzzlet> {
        Arc::new(Fuzzlet {
            task_id: "t1".into(),
            harness: "h1".into(),
            sanitizer: "address".into(),
            fuzz_engine: "shell".into(),
            artifact_path: artifact.display().to_string(),
        })
    }

    #[test]
    fn args_render_all_placeholders() {
        let scratch = tempfile::tempdir().unwrap();
        let config = CommandEngineConfig::aflpp(scratch.path().into(), 2);
        let engine = CommandEngine::new(
            config,
            Arc::new(CorpusGrabber::new(vec![])),
            Arc::new(MemoryState::new()),
        );
        let args = engine.render_args(
            Path::new("/w/seeds"),
            Path::new("/w/out"),
            Path::new("/w/bin"),
            None,
            "slave_0",
            "-S",
        );
        assert!(args.contains(&"/w/seeds".to_string()));
        assert!(args.contains(&"-S".to_string()));
        assert!(args.contains(&"slave_0".to_string()));
        assert!(!args.contains(&"-x".to_string()));
        assert!(args.iter().all(|a| !a.contains('{')));

        let with_dict = engine.render_args(
            Path::new("/w/seeds"),
            Path::new("/w/out"),
            Path::new("/w/bin"),
            Some(Path::new("/w/merged.dict")),
            "master",
            "-M",
        );
        assert!(with_dict.contains(&"-x".to_string()));
        assert!(with_dict.contains(&"/w/merged.dict".to_string()));
    }

    #[tokio::test]
    async fn dictionaries_merge_and_dedup() {
        let scratch = tempfile::tempdir().unwrap();
        let dict_a = scratch.path().join("a.dict");
        let dict_b = scratch.path().join("b.dict");
        tokio::fs::write(&dict_a, "\"GET\"\n# comment\n\"POST\"\n\n")
            .await
            .unwrap();
        tokio::fs::write(&dict_b, "\"POST\"\n\"PUT\"\n").await.unwrap();

        let state = Arc::new(MemoryState::new());
        let artifact = scratch.path().join("harness-bin");
        tokio::fs::write(&artifact, b"bin").await.unwrap();
        let fz = fuzzlet(&artifact);
        let key = dicts_key(&fz.task_id, &fz.harness);
        for dict in [&dict_a, &dict_b] {
            state.set_add(&key, dict.to_str().unwrap()).await.unwrap();
        }

        let engine = CommandEngine::new(
            CommandEngineConfig::aflpp(scratch.path().join("work"), 1),
            Arc::new(CorpusGrabber::new(vec![])),
            state.clone(),
        );
        tokio::fs::create_dir_all(scratch.path().join("work").join("t1").join("h1"))
            .await
            .unwrap();

        let merged = engine.grab_dict(&fz).await.unwrap();
        let content = tokio::fs::read_to_string(&merged).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["\"GET\"", "\"POST\"", "\"PUT\""]);

        // no registered dicts is an error the caller downgrades to a log line
        let empty = CommandEngine::new(
            CommandEngineConfig::aflpp(scratch.path().join("work"), 1),
            Arc::new(CorpusGrabber::new(vec![])),
            Arc::new(MemoryState::new()),
        );
        assert!(empty.grab_dict(&fz).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shell_engine_run_discovers_crashes_and_seeds() {
        let scratch = tempfile::tempdir().unwrap();
        // fake harness artifact to copy around
        let artifact = scratch.path().join("harness-bin");
        tokio::fs::write(&artifact, b"#!/bin/sh\n").await.unwrap();

        // a "fuzzer" that creates its output layout, waits for the monitors
        // to register the directories, then drops one crash and one seed
        let script = "mkdir -p {output}/{instance}/crashes {output}/master/queue; \
                      sleep 1; \
                      echo boom > {output}/{instance}/crashes/id-0; \
                      echo readme > {output}/{instance}/crashes/README.txt; \
                      echo seed > {output}/master/queue/id-1; \
                      sleep 1"
            .to_string();
        let config = CommandEngineConfig {
            engines: vec!["shell"],
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script],
            dict_args: vec![],
            scratch_dir: scratch.path().join("work"),
            core_count: 1,
            watch_poll: Duration::from_millis(50),
            monitor_poll: Duration::from_millis(100),
        };
        // no dicts registered: the run logs the miss and proceeds
        let engine = CommandEngine::new(
            config,
            Arc::new(CorpusGrabber::new(vec![])),
            Arc::new(MemoryState::new()),
        );

        let tracer = NoopTracer;
        let span = tracer.span("run");
        let token = CancellationToken::new();
        let mut handle = engine
            .run(
                span.as_ref(),
                fuzzlet(&artifact),
                Duration::from_secs(30),
                token.clone(),
            )
            .await
            .unwrap();

        let mut crashes = handle.take_crashes().unwrap();
        let mut seeds = handle.take_seeds().unwrap();

        let crash = tokio::time::timeout(Duration::from_secs(10), crashes.recv())
            .await
            .expect("crash within poll bound")
            .expect("crash channel open");
        assert_eq!(crash.crash_file.file_name().unwrap(), "id-0");

        let seed = tokio::time::timeout(Duration::from_secs(10), seeds.recv())
            .await
            .expect("seed within poll bound")
            .expect("seed channel open");
        assert_eq!(seed.seed_file.file_name().unwrap(), "id-1");

        handle.wait().await;
        token.cancel();
    }
}
