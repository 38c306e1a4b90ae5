//! Brain Hub trainer binary
//!
//! Environment:
//! - `BRAINHUB_CONFIG`: optional config file (toml/json/yaml)
//! - `BRAINHUB_MODE`: `once` (default), `loop`, `predict` or `backtest`
//! - `BRAINHUB_BACKTEST_STEPS`: step budget for backtest mode
//! - `BRAINHUB__SECTION__KEY`: overrides any config field

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};

use brain_hub::{
    BacktestConfig, BacktestEngine, BrainHub, BrainRegistry, BrainStateStore, EngineConfig,
    FileDrawHistory, FileStateStore, IncrementalTrainer, JournalSink, StepBudget, TracingSink,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting Brain Hub...");

    let config_path = std::env::var("BRAINHUB_CONFIG").ok().map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;
    let workspace = workspace_dir(&config);
    info!("Workspace: {}", workspace.display());

    let history = Arc::new(
        FileDrawHistory::open(workspace.join("draws.json"), config.rules.clone()).await?,
    );
    let store = Arc::new(FileStateStore::open(&workspace).await?);
    let registry = BrainRegistry::from_config(&config)?;
    let hub = Arc::new(BrainHub::new(config)?);

    let mode = std::env::var("BRAINHUB_MODE").unwrap_or_else(|_| "once".to_string());
    match mode.as_str() {
        "backtest" => {
            let steps = std::env::var("BRAINHUB_BACKTEST_STEPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(250);
            // Start from the checkpointed production states; the backtest
            // itself only ever reads them
            let checkpoint = store.load_checkpoint().await?;
            let mut trainer =
                IncrementalTrainer::new(Arc::clone(&hub), registry, history.clone(), store);
            trainer.restore_states(&checkpoint).await?;
            let engine = BacktestEngine::new(hub, history);
            let summary = engine
                .run(
                    trainer.registry(),
                    &BacktestConfig {
                        budget: StepBudget::Steps(steps),
                        ..Default::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        "predict" => {
            let journal = Arc::new(JournalSink::new(&workspace));
            journal.init().await?;
            let mut trainer = IncrementalTrainer::new(hub, registry, history, store)
                .with_sink(Arc::new(TracingSink))
                .with_sink(journal);
            let report = trainer.predict_next().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "loop" => {
            let journal = Arc::new(JournalSink::new(&workspace));
            journal.init().await?;
            let mut trainer = IncrementalTrainer::new(hub, registry, history, store)
                .with_sink(Arc::new(TracingSink))
                .with_sink(journal);

            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested, finishing current round");
                    let _ = tx.send(true);
                }
            });
            trainer.run_loop(rx).await?;
        }
        other => {
            if other != "once" {
                warn!("Unknown BRAINHUB_MODE '{}', running once", other);
            }
            let journal = Arc::new(JournalSink::new(&workspace));
            journal.init().await?;
            let mut trainer = IncrementalTrainer::new(hub, registry, history, store)
                .with_sink(Arc::new(TracingSink))
                .with_sink(journal);
            let summary = trainer.run_once().await?;
            info!(
                checkpoint = ?summary.checkpoint,
                remaining = summary.remaining,
                "Processed {} contests",
                summary.processed.len()
            );
        }
    }

    Ok(())
}

fn workspace_dir(config: &EngineConfig) -> PathBuf {
    config
        .trainer
        .workspace_dir
        .clone()
        .or_else(|| dirs::data_local_dir().map(|d| d.join("brain-hub")))
        .unwrap_or_else(|| PathBuf::from("brain-hub"))
}
