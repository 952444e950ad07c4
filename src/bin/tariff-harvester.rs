//! Runs one WITS tariff harvest and prints the report as JSON.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tariff_harvester::{
    HarvestConfig, HarvestPipeline, HarvestReport, HttpTransport, MemoryTariffStore,
    PgTariffStore, TariffStore,
};
use tracing::{error, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = HarvestConfig::parse();
    match run(config).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Could not serialize report");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!(error = %e, "Harvest failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: HarvestConfig) -> Result<HarvestReport, BoxError> {
    config.validate()?;
    let transport = HttpTransport::new(config.request_timeout())?;

    if config.dry_run {
        info!("Dry run: reconciling into memory");
        let store = Arc::new(MemoryTariffStore::new());
        let report = harvest(transport, Arc::clone(&store), config).await?;
        info!(rows = store.len(), links = store.link_count(), "Dry run finished");
        return Ok(report);
    }

    let database_url = config.database_url.clone().unwrap_or_default();
    let store = Arc::new(PgTariffStore::connect(&database_url, config.max_db_connections()).await?);
    let result = harvest(transport, Arc::clone(&store), config).await;
    store.close().await;
    result
}

async fn harvest<S>(
    transport: HttpTransport,
    store: Arc<S>,
    config: HarvestConfig,
) -> Result<HarvestReport, BoxError>
where
    S: TariffStore + 'static,
{
    let pipeline = HarvestPipeline::new(transport, store, config)?;
    Ok(pipeline.run().await?)
}
