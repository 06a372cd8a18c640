use anyhow::Context;
use std::sync::Arc;
use tmtc::{Archive, Config, JsonLinesArchive, MemoryArchive, ProcessingModel, SchedulerService};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tmtc::init();

    info!("TMTC v{} starting", tmtc::VERSION);

    let config_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            error!("Usage: tmtc <config.yaml>");
            std::process::exit(1);
        }
    };

    let config = Config::from_file(&config_path).with_context(|| format!("loading {}", config_path))?;
    info!(
        "Loaded {} parameters, {} events, {} activities",
        config.definition.parameters.len(),
        config.definition.events.len(),
        config.definition.activities.len()
    );

    let archive: Arc<dyn Archive> = match &config.archive {
        Some(path) => Arc::new(
            JsonLinesArchive::open(path)
                .await
                .with_context(|| format!("opening archive {}", path.display()))?,
        ),
        None => Arc::new(MemoryArchive::new()),
    };

    let model = ProcessingModel::builder(config.definition.clone())
        .engine(config.engine.clone())
        .archive(archive)
        .build()
        .context("building processing model")?;
    let scheduler = SchedulerService::for_model(&config.scheduler, model.clone());

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Received shutdown signal");

    scheduler.shutdown().await;
    model.shutdown().await;

    let stats = model.stats();
    info!(
        "Final stats: {} batches, {} operations, {} failures, {} items",
        stats.batches_processed, stats.operations_processed, stats.operation_failures, stats.items_produced
    );

    Ok(())
}
