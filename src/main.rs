use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swarmfuzz::broker::{Broker, ConnectionPool, MemoryBroker};
use swarmfuzz::config::AppConfig;
use swarmfuzz::corpus::{
    CminHttpSource, CorpusGrabber, CorpusSource, DatastoreSource, LegacySource, RandomSource,
};
use swarmfuzz::crash::{CrashSink, FsCrashSink};
use swarmfuzz::fuzz::{CommandEngine, CommandEngineConfig, FuzzEngine, FuzzRunner};
use swarmfuzz::scheduler::{FuzzDispatch, Picker, Scheduler};
use swarmfuzz::seeds::SeedManager;
use swarmfuzz::state::{MemoryState, SharedState};
use swarmfuzz::store::{Datastore, MemoryDatastore};
use swarmfuzz::telemetry::{LogTracer, Tracer};

#[derive(Parser, Debug)]
#[command(name = "swarmfuzz", about = "distributed fuzzing campaign node")]
struct Args {
    /// Path to the node config file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => AppConfig::load(path).context("loading config")?,
        None => AppConfig::default(),
    };
    info!(?config, "starting campaign node");

    // Standalone backends. A deployment swaps these for implementations
    // backed by the cluster's broker, shared state and database.
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let state: Arc<dyn SharedState> = Arc::new(MemoryState::new());
    let store: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
    let tracer: Arc<dyn Tracer> = Arc::new(LogTracer::new());

    let pool = Arc::new(
        ConnectionPool::connect(broker, config.pool_size)
            .await
            .context("filling broker connection pool")?,
    );

    let seed_manager = Arc::new(
        SeedManager::start(Arc::clone(&pool), Arc::clone(&store), config.seed_dir.clone())
            .await
            .context("starting seed manager")?,
    );
    let crash_sink = Arc::new(
        FsCrashSink::start(Arc::clone(&store), config.crash_dir.clone())
            .await
            .context("starting crash sink")?,
    );

    // corpus fallback chain, most specific source first
    let mut sources: Vec<Arc<dyn CorpusSource>> = Vec::new();
    if let Some(host) = &config.cmin_host {
        sources.push(Arc::new(CminHttpSource::new(host.clone())));
    }
    sources.push(Arc::new(DatastoreSource::new(
        Arc::clone(&store),
        config.scratch_dir.clone(),
    )));
    sources.push(Arc::new(LegacySource::new(Arc::clone(&state))));
    sources.push(Arc::new(RandomSource::new(config.scratch_dir.clone())));
    let corpus = Arc::new(CorpusGrabber::new(sources));

    let lifecycle = CancellationToken::new();

    let mut engine_config =
        CommandEngineConfig::aflpp(config.scratch_dir.clone(), config.core_count);
    engine_config.watch_poll = config.watch_poll();
    let engines: Vec<Arc<dyn FuzzEngine>> = vec![Arc::new(CommandEngine::new(
        engine_config,
        Arc::clone(&corpus),
        Arc::clone(&state),
    ))];

    let runner: Arc<dyn FuzzDispatch> = Arc::new(FuzzRunner::new(
        engines,
        Arc::clone(&seed_manager),
        crash_sink.clone() as Arc<dyn CrashSink>,
        Arc::clone(&state),
        tracer,
        lifecycle.clone(),
    ));

    let scheduler = Scheduler::new(
        Arc::clone(&state),
        runner,
        Picker::new(config.scheduling_interval()),
    );
    let handle = scheduler.spawn(lifecycle.child_token());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    // reverse construction order: stop producing, then drain, then disconnect
    lifecycle.cancel();
    handle.stop().await;
    seed_manager.shutdown().await;
    crash_sink.shutdown().await;
    pool.shutdown().await;
    info!("campaign node stopped");
    Ok(())
}
