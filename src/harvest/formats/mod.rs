//! Source payload formats.
//!
//! - [`sdmx`] - SDMX 2.1 generic-data tariff series and structure codelists (WITS)

pub mod sdmx;

pub use sdmx::{extract, parse_country_codes, FetchedPayload, ObservationsByProduct, SdmxExtractor};
