//! Lattice demo runner entry point.

mod config;
mod demo;

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lattice_engine::{
    BatchJobRun, InMemoryBatchPersistence, LiveDataSnapshotProvider, ViewCycleState,
    ViewProcessOptions, ViewProcessor, ViewProcessorBuilder, ViewProcessorEvent,
};
use lattice_traits::{BatchId, SnapshotId, UserPrincipal};

use crate::config::{RunMode, RunnerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,lattice=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Lattice Runner v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/lattice.toml".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        info!("Loading configuration from {}", config_path);
        RunnerConfig::from_file(&config_path)
            .with_context(|| format!("failed to load {}", config_path))?
    } else {
        info!("Using default configuration");
        RunnerConfig::default()
    };

    let processor = ViewProcessorBuilder::new()
        .with_config(config.engine.clone())
        .with_function_registry(Arc::new(demo::demo_repository()?))
        .build()?;

    let mut events = processor.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ViewProcessorEvent::ViewProcessAdded(id) => info!(process = %id, "Process added"),
                ViewProcessorEvent::ViewProcessRemoved(id) => info!(process = %id, "Process removed"),
                other => tracing::debug!(event = ?other, "Processor event"),
            }
        }
    });

    processor.start();
    let outcome = match config.mode {
        RunMode::Live => run_live(&processor, &config).await,
        RunMode::Batch => run_batch(&processor, &config).await,
    };
    processor.stop();
    outcome
}

/// Cycle a live process on an interval while a feed bumps rates.
async fn run_live(processor: &ViewProcessor, config: &RunnerConfig) -> anyhow::Result<()> {
    let live = Arc::new(LiveDataSnapshotProvider::default());
    live.publish_many(demo::demo_market_data(config.positions, 0.0));

    let options = ViewProcessOptions::manual()
        .with_interval(config.interval())
        .with_max_cycles(config.cycles);
    let process = processor.register_process(
        demo::demo_definition(config.positions),
        live.clone(),
        options,
    )?;
    let client = processor.register_client(UserPrincipal::local(config.user.clone()));
    processor.attach_client(client.id(), process.id())?;

    let mut notices = process.subscribe();
    let feed = {
        let live = live.clone();
        let positions = config.positions;
        let period = config.interval() / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut bump = 0.0;
            loop {
                ticker.tick().await;
                bump += 0.0001;
                for (key, value) in demo::demo_market_data(positions, bump)
                    .into_iter()
                    .filter(|(key, _)| key.field == "Rate")
                {
                    live.publish(key, value);
                }
            }
        })
    };

    let mut seen = 0;
    while seen < config.cycles {
        match notices.recv().await {
            Ok(notice) => {
                seen += 1;
                if notice.state != ViewCycleState::Executed {
                    let cycle = processor.cycle(&notice.cycle_id)?;
                    warn!(cycle = %notice.cycle_id, failure = ?cycle.failure(), "Cycle did not execute");
                    continue;
                }
                if let Some(model) = processor.client_result(client.id(), &notice.cycle_id)? {
                    println!("{}", serde_json::to_string_pretty(&model.to_json())?);
                }
            }
            Err(RecvError::Lagged(n)) => warn!("Missed {} cycle notices", n),
            Err(RecvError::Closed) => break,
        }
    }

    feed.abort();
    process.stopped().await;
    info!(cycles = process.cycles_run(), "Live run finished");
    Ok(())
}

/// Populate and seal a snapshot, run one batch cycle and persist it.
async fn run_batch(processor: &ViewProcessor, config: &RunnerConfig) -> anyhow::Result<()> {
    let store = Arc::new(InMemoryBatchPersistence::new());
    let batches = processor.batch_manager(store);

    let today = Utc::now().date_naive();
    let snapshot_id = SnapshotId::new(today, "CLOSE");
    let batch_id = BatchId::new(format!("EOD-{}", today));

    batches.start_batch(BatchJobRun::new(batch_id.clone(), snapshot_id.clone()))?;
    batches.create_snapshot(snapshot_id.clone());
    batches.add_values_to_snapshot(&snapshot_id, demo::demo_market_data(config.positions, 0.0))?;
    batches.fix_snapshot_time(&snapshot_id, Utc::now())?;
    batches.mark_snapshot_complete(&snapshot_id)?;

    let cycle = batches.run_batch(&batch_id, &demo::demo_definition(config.positions))?;
    if cycle.state() != ViewCycleState::Executed {
        bail!("batch cycle {} failed: {:?}", cycle.id(), cycle.failure());
    }

    let record = batches.end_batch(&batch_id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    info!(
        batch = %batch_id,
        results = record.results.len(),
        failures = record.failures.len(),
        "Batch run finished"
    );
    Ok(())
}
