//! Harvest run coordinator.
//!
//! This module provides the [`HarvestPipeline`] coordinator that runs one
//! full harvest:
//! - Country list fetched once through the shared [`Fetcher`]
//! - One `tokio` task per ordered country pair (Fetch → Extract → Consolidate)
//! - Per-pair hand-off to the [`PairBuffer`], which flushes to the store
//! - Structured progress logging via `tracing`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, HarvestConfig};
use crate::executor::Fetcher;
use crate::harvest::buffer::PairBuffer;
use crate::harvest::consolidate::Consolidator;
use crate::harvest::formats::sdmx::{parse_country_codes, FetchedPayload, SdmxExtractor};
use crate::harvest::gate::RunGate;
use crate::harvest::traits::HarvestStage;
use crate::model::{CountryPair, HarvestReport, PairBatch};
use crate::store::{StoreError, TariffStore};
use crate::traits::{FetchError, Transport};

/// Reserved "world" aggregate; never used as a destination.
pub const WORLD_CODE: &str = "000";

// ============================================================================
// Pipeline Errors
// ============================================================================

/// Errors that end a harvest run.
///
/// Fetch and parse failures of single pairs never show up here; they are
/// logged and the pair contributes an empty batch.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Another run holds the gate
    #[error("A harvest run is already in progress")]
    AlreadyRunning,

    /// Country codelist could not be fetched or parsed
    #[error("Country list unavailable: {0}")]
    CountryList(String),

    /// Codelist parsed but contained no usable country
    #[error("No countries found")]
    NoCountries,

    /// A flush transaction failed; its batch was not persisted
    #[error("Reconciliation failed: {0}")]
    Reconciliation(#[from] StoreError),

    /// The flush worker stopped accepting batches
    #[error("Flush worker is no longer running")]
    FlushWorkerGone,

    /// A pair task panicked or was cancelled
    #[error("Pair task failed: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

// ============================================================================
// Pipeline Executor
// ============================================================================

/// Full-run coordinator over a [`Transport`] and a [`TariffStore`].
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tariff_harvester::{HarvestConfig, HarvestPipeline, HttpTransport, MemoryTariffStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///     let config = HarvestConfig { dry_run: true, ..Default::default() };
///     let transport = HttpTransport::new(config.request_timeout())?;
///     let pipeline = HarvestPipeline::new(transport, Arc::new(MemoryTariffStore::new()), config)?;
///
///     let report = pipeline.run().await?;
///     println!("{} pairs, {} tariffs", report.pairs_processed, report.tariffs_saved);
///     Ok(())
/// }
/// ```
pub struct HarvestPipeline<T, S> {
    fetcher: Arc<Fetcher<T>>,
    store: Arc<S>,
    config: Arc<HarvestConfig>,
    gate: RunGate,
}

impl<T, S> HarvestPipeline<T, S>
where
    T: Transport + 'static,
    S: TariffStore + 'static,
{
    /// Validates `config` and wires the fetcher.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] before any network or store activity.
    pub fn new(transport: T, store: Arc<S>, config: HarvestConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let fetcher = Fetcher::new(transport, config.concurrency, config.retry_policy());
        Ok(Self {
            fetcher: Arc::new(fetcher),
            store,
            config: Arc::new(config),
            gate: RunGate::new(),
        })
    }

    /// Shares an admission flag with an outer control layer.
    pub fn with_gate(mut self, gate: RunGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn gate(&self) -> &RunGate {
        &self.gate
    }

    /// Fetches the country codelist, code → name.
    pub async fn fetch_countries(&self) -> Result<BTreeMap<String, String>, PipelineError> {
        let body = self
            .fetcher
            .fetch(&self.config.codelist_url)
            .await
            .map_err(|e| PipelineError::CountryList(e.to_string()))?;
        parse_country_codes(&body).map_err(|e| PipelineError::CountryList(e.to_string()))
    }

    /// Executes one complete harvest.
    ///
    /// Runs to completion of every pair task; there is no cancellation.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::AlreadyRunning`] if another run is active
    /// - [`PipelineError::CountryList`] / [`PipelineError::NoCountries`]
    /// - [`PipelineError::Reconciliation`] if any flush fails; remaining
    ///   pair tasks are aborted
    pub async fn run(&self) -> Result<HarvestReport, PipelineError> {
        let _guard = self.gate.try_acquire().ok_or(PipelineError::AlreadyRunning)?;
        let start = Instant::now();

        info!("Fetching country codes");
        let countries = self.fetch_countries().await?;
        if countries.is_empty() {
            return Err(PipelineError::NoCountries);
        }

        let pairs = build_pairs(countries.keys());
        info!(
            countries = countries.len(),
            pairs = pairs.len(),
            concurrency = self.config.concurrency,
            pairs_per_flush = self.config.pairs_per_flush,
            "Dispatching pair tasks"
        );

        let buffer = Arc::new(
            PairBuffer::new(Arc::clone(&self.store), self.config.pairs_per_flush)
                .with_expected_pairs(pairs.len() as u64),
        );

        let mut tasks = JoinSet::new();
        for pair in pairs {
            let fetcher = Arc::clone(&self.fetcher);
            let config = Arc::clone(&self.config);
            let buffer = Arc::clone(&buffer);
            tasks.spawn(async move {
                let batch = harvest_pair(&fetcher, &config, pair).await;
                buffer.add_pair(batch).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| PipelineError::Task(e.to_string()))
                .and_then(|added| added);
            if let Err(e) = outcome {
                error!(error = %e, "Aborting harvest");
                tasks.shutdown().await;
                return Err(surface_store_error(&buffer, e).await);
            }
        }

        if let Err(e) = buffer.drain_remainder().await {
            return Err(surface_store_error(&buffer, e).await);
        }
        let totals = buffer.finish().await?;

        let report = HarvestReport {
            pairs_processed: buffer.pairs_processed().await,
            tariffs_saved: totals.tariffs_saved,
            inserted: totals.inserted,
            updated: totals.updated,
            flushes: totals.flushes,
            elapsed_seconds: start.elapsed().as_secs_f64(),
        };
        info!(
            pairs = report.pairs_processed,
            tariffs = report.tariffs_saved,
            inserted = report.inserted,
            updated = report.updated,
            elapsed_s = format!("{:.1}", report.elapsed_seconds),
            "Harvest complete"
        );
        Ok(report)
    }
}

/// Ordered pairs with distinct countries, excluding the world aggregate as
/// destination.
pub fn build_pairs<'a, I>(codes: I) -> Vec<CountryPair>
where
    I: IntoIterator<Item = &'a String>,
    I::IntoIter: Clone,
{
    let codes = codes.into_iter();
    let mut pairs = Vec::new();
    for origin in codes.clone() {
        for destination in codes.clone() {
            if origin != destination && destination != WORLD_CODE {
                pairs.push(CountryPair::new(origin.clone(), destination.clone()));
            }
        }
    }
    pairs
}

/// Fetch → extract → consolidate for one pair. Never fails: any fetch or
/// parse problem yields an empty batch.
async fn harvest_pair<T: Transport>(
    fetcher: &Fetcher<T>,
    config: &HarvestConfig,
    pair: CountryPair,
) -> PairBatch {
    let url = config.tariff_url(&pair);
    let body = match fetcher.fetch(&url).await {
        Ok(body) => body,
        Err(FetchError::NotFound) => {
            debug!(origin = %pair.origin, destination = %pair.destination, "No tariff data");
            return PairBatch::empty(pair);
        }
        Err(e) => {
            warn!(
                origin = %pair.origin,
                destination = %pair.destination,
                error = %e,
                "Tariff fetch failed, skipping pair"
            );
            return PairBatch::empty(pair);
        }
    };

    let extractor = SdmxExtractor;
    let by_product = match extractor.execute(FetchedPayload {
        pair: pair.clone(),
        body,
    }) {
        Ok(by_product) => by_product,
        Err(e) => {
            warn!(
                origin = %pair.origin,
                destination = %pair.destination,
                stage = extractor.stage_name(),
                error = %e,
                "Unparseable tariff payload, skipping pair"
            );
            return PairBatch::empty(pair);
        }
    };

    let consolidator = Consolidator;
    let mut batch = PairBatch::empty(pair);
    for (product_code, observations) in by_product {
        let records = match consolidator.execute(observations) {
            Ok(records) => records,
            Err(never) => match never {},
        };
        batch.push_product(&product_code, records);
    }
    batch
}

/// Prefers the flush worker's store error over the secondary error that
/// revealed it.
async fn surface_store_error(buffer: &PairBuffer, observed: PipelineError) -> PipelineError {
    match buffer.finish().await {
        Err(e @ PipelineError::Reconciliation(_)) => e,
        _ => observed,
    }
}

// ============================================================================
// Tests
// ============================================================================
