//! Harvest module - the per-pair pipeline and its run coordinator.
//!
//! - **Stages**: [`HarvestStage`] implemented by [`SdmxExtractor`] and [`Consolidator`]
//! - **Buffering**: atomic per-pair accumulation via [`PairBuffer`]
//! - **Admission**: at most one run at a time via [`RunGate`]
//! - **Pipeline**: async coordinator via [`pipeline::HarvestPipeline`]

pub mod buffer;
pub mod consolidate;
pub mod formats;
pub mod gate;
pub mod pipeline;
pub mod traits;

// Re-export commonly used types
pub use buffer::{AddOutcome, FlushTotals, PairBuffer};
pub use consolidate::{consolidate, Consolidator};
pub use formats::{extract, parse_country_codes, FetchedPayload, ObservationsByProduct, SdmxExtractor};
pub use gate::{RunGate, RunGuard, RunState};
pub use pipeline::{build_pairs, HarvestPipeline, PipelineError, WORLD_CODE};
pub use traits::HarvestStage;
