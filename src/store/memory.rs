use super::{
    linked_candidates, rates_changed, NaturalKey, ReconcileSummary, StoreError, TariffStore,
};
use crate::model::ConsolidatedTariffRecord;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    rows: HashMap<Uuid, ConsolidatedTariffRecord>,
    links: BTreeSet<(Uuid, String)>,
    by_key: HashMap<NaturalKey, Uuid>,
}

/// In-process [`TariffStore`].
///
/// Each reconciliation works on a copy of the current state and replaces it
/// only when every candidate was applied, so a failed batch leaves no trace.
#[derive(Debug, Default)]
pub struct MemoryTariffStore {
    state: Mutex<MemoryState>,
}

impl MemoryTariffStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a persisted row with its product link, bypassing reconciliation.
    pub fn seed(&self, record: ConsolidatedTariffRecord, product_code: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .by_key
                .insert(NaturalKey::of(&record, product_code), record.id);
            state.links.insert((record.id, product_code.to_string()));
            state.rows.insert(record.id, record);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().map(|s| s.links.len()).unwrap_or(0)
    }

    /// Row persisted under `key`, if any.
    pub fn find(&self, key: &NaturalKey) -> Option<ConsolidatedTariffRecord> {
        let state = self.state.lock().ok()?;
        state.by_key.get(key).and_then(|id| state.rows.get(id)).cloned()
    }
}

#[async_trait]
impl TariffStore for MemoryTariffStore {
    async fn reconcile(
        &self,
        records: &[ConsolidatedTariffRecord],
        product_links: &HashMap<Uuid, String>,
    ) -> Result<ReconcileSummary, StoreError> {
        let candidates = linked_candidates(records, product_links);
        let mut state = self
            .state
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut next = state.clone();
        let mut summary = ReconcileSummary::default();

        for (record, product_code) in candidates {
            let key = NaturalKey::of(record, product_code);
            match next.by_key.get(&key).copied() {
                Some(existing_id) => {
                    let Some(row) = next.rows.get_mut(&existing_id) else {
                        return Err(StoreError::Unavailable(format!(
                            "index points at missing row {existing_id}"
                        )));
                    };
                    if rates_changed(row.ad_valorem_rate, row.specific_rate, record) {
                        row.ad_valorem_rate = record.ad_valorem_rate;
                        row.specific_rate = record.specific_rate;
                        row.min_quantity = record.min_quantity;
                        row.max_quantity = record.max_quantity;
                        row.user_defined = record.user_defined;
                        summary.updated += 1;
                    } else {
                        summary.unchanged += 1;
                    }
                }
                None => {
                    if next.rows.contains_key(&record.id) {
                        return Err(StoreError::Conflict(record.id));
                    }
                    next.rows.insert(record.id, record.clone());
                    next.links.insert((record.id, product_code.to_string()));
                    next.by_key.insert(key, record.id);
                    summary.inserted += 1;
                }
            }
        }

        *state = next;
        Ok(summary)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
