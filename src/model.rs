use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Relative tolerance used when comparing two rates.
pub const RATE_TOLERANCE: f64 = 1e-9;

/// Returns `true` when two rates are the same rate for consolidation and
/// reconciliation purposes.
///
/// Relative tolerance of [`RATE_TOLERANCE`] with an absolute floor of the same
/// magnitude, so rates that differ only past the ninth decimal collapse.
pub fn rates_match(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    let scale = a.abs().max(b.abs());
    diff <= (RATE_TOLERANCE * scale).max(RATE_TOLERANCE)
}

/// Ordered (origin, destination) combination; the unit of atomic buffering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CountryPair {
    pub origin: String,
    pub destination: String,
}

impl CountryPair {
    pub fn new(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
        }
    }
}

impl std::fmt::Display for CountryPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.origin, self.destination)
    }
}

/// One yearly tariff observation as reported by the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub origin: String,
    pub destination: String,
    pub product_code: String,
    pub effective_year: i32,
    /// Reported rate in percent (e.g. `5.0` for 5 %)
    pub ad_valorem_percent: f64,
}

impl RawObservation {
    /// Ad valorem rate as a decimal fraction.
    pub fn ad_valorem_rate(&self) -> f64 {
        self.ad_valorem_percent * 0.01
    }
}

/// A date-ranged tariff regime for one (origin, destination, product).
///
/// `expiry_date == None` means the record stays in effect until superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedTariffRecord {
    pub id: Uuid,
    pub origin: String,
    pub destination: String,
    pub effective_date: NaiveDate,
    pub expiry_date: Option<NaiveDate>,
    pub ad_valorem_rate: f64,
    pub specific_rate: f64,
    pub min_quantity: i32,
    pub max_quantity: i32,
    pub user_defined: bool,
    pub enabled: bool,
}

impl ConsolidatedTariffRecord {
    /// Creates an open-ended record with the default specific rate, quantity
    /// bounds and flags.
    pub fn open_ended(
        origin: impl Into<String>,
        destination: impl Into<String>,
        effective_date: NaiveDate,
        ad_valorem_rate: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.into(),
            destination: destination.into(),
            effective_date,
            expiry_date: None,
            ad_valorem_rate,
            specific_rate: 0.0,
            min_quantity: 0,
            max_quantity: 0,
            user_defined: false,
            enabled: true,
        }
    }

    /// Whether `other` carries the same rate regime (rates within tolerance,
    /// identical quantity bounds).
    pub fn same_regime(&self, other: &Self) -> bool {
        rates_match(self.ad_valorem_rate, other.ad_valorem_rate)
            && rates_match(self.specific_rate, other.specific_rate)
            && self.min_quantity == other.min_quantity
            && self.max_quantity == other.max_quantity
    }
}

/// Everything one country pair contributed to a run.
///
/// Built by a single task and never mutated after it reaches the buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairBatch {
    pub pair: CountryPair,
    pub records: Vec<ConsolidatedTariffRecord>,
    /// Record id → product code
    pub product_links: HashMap<Uuid, String>,
}

impl PairBatch {
    /// A pair that produced no data. Still counts as processed.
    pub fn empty(pair: CountryPair) -> Self {
        Self {
            pair,
            records: Vec::new(),
            product_links: HashMap::new(),
        }
    }

    /// Appends the consolidated records of one product.
    pub fn push_product(&mut self, product_code: &str, records: Vec<ConsolidatedTariffRecord>) {
        for record in records {
            self.product_links
                .insert(record.id, product_code.to_string());
            self.records.push(record);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Drained buffer contents handed to the reconciler in one transaction.
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    pub records: Vec<ConsolidatedTariffRecord>,
    pub product_links: HashMap<Uuid, String>,
    /// Number of complete pairs contained in this snapshot
    pub pairs: usize,
}

/// Final totals of a harvest run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestReport {
    /// Pairs whose task completed, with or without data
    pub pairs_processed: u64,

    /// Records handed to committed reconciliation transactions
    pub tariffs_saved: u64,

    /// Rows newly inserted into the store
    pub inserted: u64,

    /// Existing rows whose rates changed
    pub updated: u64,

    /// Committed flush transactions
    pub flushes: u64,

    /// Wall-clock duration of the run
    pub elapsed_seconds: f64,
}
