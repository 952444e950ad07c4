pub mod config;
pub mod executor;
pub mod harvest;
pub mod model;
pub mod store;
pub mod traits;
pub mod transport;

// Re-export common types for convenience
pub use config::{ConfigError, HarvestConfig};
pub use executor::*;
pub use harvest::{HarvestPipeline, PipelineError, RunGate};
pub use model::*;
pub use store::{MemoryTariffStore, PgTariffStore, ReconcileSummary, StoreError, TariffStore};
pub use traits::*;
pub use transport::HttpTransport;
