//! Persisted tariff store and batch reconciliation.
//!
//! A flush hands the reconciler a batch of consolidated records plus their
//! product links. The store matches each candidate against existing rows by
//! natural key, never by generated id, and applies the resulting inserts and
//! updates in one transaction:
//!
//! - [`PgTariffStore`] - PostgreSQL via `sqlx`
//! - [`MemoryTariffStore`] - in-process store with the same semantics

pub mod memory;
pub mod postgres;

pub use memory::MemoryTariffStore;
pub use postgres::PgTariffStore;

use crate::model::ConsolidatedTariffRecord;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Outcome of one committed reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub inserted: u64,
    pub updated: u64,
    /// Matched rows whose rates were already within tolerance
    pub unchanged: u64,
}

/// Errors that abort a reconciliation. Nothing of the batch is applied.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row with the same primary key already exists under another natural key
    #[error("Conflicting tariff id {0}")]
    Conflict(Uuid),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Expiry stored in the natural key of open-ended records.
pub fn open_expiry_sentinel() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX)
}

/// Business identity of a persisted tariff row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub origin: String,
    pub destination: String,
    pub effective_date: NaiveDate,
    /// Expiry with open-ended records coalesced to [`open_expiry_sentinel`]
    pub expiry: NaiveDate,
    pub product_code: String,
}

impl NaturalKey {
    pub fn of(record: &ConsolidatedTariffRecord, product_code: &str) -> Self {
        Self {
            origin: record.origin.clone(),
            destination: record.destination.clone(),
            effective_date: record.effective_date,
            expiry: record.expiry_date.unwrap_or_else(open_expiry_sentinel),
            product_code: product_code.to_string(),
        }
    }
}

/// Reconciliation target for flushed batches.
#[async_trait]
pub trait TariffStore: Send + Sync {
    /// Diffs `records` against persisted rows and applies inserts/updates
    /// atomically.
    ///
    /// Records without an entry in `product_links` are not staged.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the transaction cannot be committed; in that
    /// case none of the batch's changes are visible.
    async fn reconcile(
        &self,
        records: &[ConsolidatedTariffRecord],
        product_links: &HashMap<Uuid, String>,
    ) -> Result<ReconcileSummary, StoreError>;

    /// Short backend identifier for log fields.
    fn backend_name(&self) -> &'static str;
}

/// Pairs each record with its product code, dropping unlinked records.
pub(crate) fn linked_candidates<'a>(
    records: &'a [ConsolidatedTariffRecord],
    product_links: &'a HashMap<Uuid, String>,
) -> Vec<(&'a ConsolidatedTariffRecord, &'a str)> {
    let mut candidates = Vec::with_capacity(records.len());
    for record in records {
        match product_links.get(&record.id) {
            Some(code) => candidates.push((record, code.as_str())),
            None => warn!(
                id = %record.id,
                origin = %record.origin,
                destination = %record.destination,
                "Record has no product link, not staged"
            ),
        }
    }
    candidates
}

/// Whether a matched row must be rewritten with the candidate's rates.
pub(crate) fn rates_changed(
    existing_ad_valorem: f64,
    existing_specific: f64,
    candidate: &ConsolidatedTariffRecord,
) -> bool {
    use crate::model::rates_match;
    !rates_match(existing_ad_valorem, candidate.ad_valorem_rate)
        || !rates_match(existing_specific, candidate.specific_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expiry: Option<NaiveDate>) -> ConsolidatedTariffRecord {
        let mut r = ConsolidatedTariffRecord::open_ended(
            "004",
            "840",
            NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
            0.1,
        );
        r.expiry_date = expiry;
        r
    }

    #[test]
    fn test_natural_key_coalesces_open_expiry() {
        let open = NaturalKey::of(&record(None), "847330");
        assert_eq!(open.expiry, NaiveDate::from_ymd_opt(9999, 12, 31).unwrap());

        let closed = NaturalKey::of(
            &record(NaiveDate::from_ymd_opt(2001, 12, 31)),
            "847330",
        );
        assert_ne!(open, closed);
    }

    #[test]
    fn test_natural_key_ignores_generated_id() {
        let a = record(None);
        let b = record(None);
        assert_ne!(a.id, b.id);
        assert_eq!(NaturalKey::of(&a, "847330"), NaturalKey::of(&b, "847330"));
        assert_ne!(NaturalKey::of(&a, "847330"), NaturalKey::of(&a, "851712"));
    }

    #[test]
    fn test_unlinked_records_are_dropped() {
        let linked = record(None);
        let unlinked = record(None);
        let links = HashMap::from([(linked.id, "847330".to_string())]);
        let records = vec![linked.clone(), unlinked];

        let candidates = linked_candidates(&records, &links);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.id, linked.id);
        assert_eq!(candidates[0].1, "847330");
    }

    #[test]
    fn test_rates_changed_uses_tolerance() {
        let mut r = record(None);
        r.ad_valorem_rate = 0.100000001;
        assert!(!rates_changed(0.1, 0.0, &r));
        assert!(rates_changed(0.12, 0.0, &r));
        assert!(rates_changed(0.1, 1.5, &r));
    }
}
