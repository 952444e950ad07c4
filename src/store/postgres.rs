use super::{
    linked_candidates, rates_changed, ReconcileSummary, StoreError, TariffStore,
};
use crate::model::ConsolidatedTariffRecord;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

/// Rows per staging INSERT; 12 binds each stays under the 65535 parameter cap.
const STAGING_CHUNK: usize = 4000;

const CREATE_STAGING_SQL: &str = r#"
CREATE TEMP TABLE incoming_tariffs (
    temp_id UUID PRIMARY KEY,
    origin_country_code TEXT NOT NULL,
    dest_country_code TEXT NOT NULL,
    effective_date DATE NOT NULL,
    expiry_date DATE,
    ad_valorem_rate DOUBLE PRECISION NOT NULL,
    specific_rate DOUBLE PRECISION NOT NULL,
    min_quantity INTEGER NOT NULL,
    max_quantity INTEGER NOT NULL,
    user_defined BOOLEAN NOT NULL,
    enabled BOOLEAN NOT NULL,
    hts_code TEXT NOT NULL
) ON COMMIT DROP
"#;

const STAGING_INSERT_PREFIX: &str = "INSERT INTO incoming_tariffs (temp_id, origin_country_code, \
    dest_country_code, effective_date, expiry_date, ad_valorem_rate, specific_rate, \
    min_quantity, max_quantity, user_defined, enabled, hts_code) ";

const SELECT_EXISTING_SQL: &str = r#"
SELECT
    i.temp_id,
    t.id AS existing_id,
    COALESCE(t.ad_valorem_rate, 0)::float8 AS existing_ad_valorem,
    COALESCE(t.specific_rate, 0)::float8 AS existing_specific
FROM incoming_tariffs i
INNER JOIN tariff t
    ON t.origin_country_code = i.origin_country_code
    AND t.dest_country_code = i.dest_country_code
    AND t.effective_date = i.effective_date
    AND COALESCE(t.expiry_date, '9999-12-31'::date) = COALESCE(i.expiry_date, '9999-12-31'::date)
INNER JOIN tariff_product tp
    ON tp.tariff_id = t.id
    AND tp.hts_code = i.hts_code
"#;

const UPDATE_EXISTING_SQL: &str = r#"
UPDATE tariff t
SET ad_valorem_rate = i.ad_valorem_rate,
    specific_rate = i.specific_rate,
    min_quantity = i.min_quantity,
    max_quantity = i.max_quantity,
    user_defined = i.user_defined
FROM UNNEST($1::uuid[], $2::uuid[]) AS m(existing_id, temp_id)
INNER JOIN incoming_tariffs i ON i.temp_id = m.temp_id
WHERE t.id = m.existing_id
"#;

const TARIFF_INSERT_SQL: &str = r#"
INSERT INTO tariff (
    id, origin_country_code, dest_country_code, effective_date, expiry_date,
    ad_valorem_rate, specific_rate, min_quantity, max_quantity, user_defined, enabled
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
RETURNING id
"#;

const TARIFF_PRODUCT_INSERT_SQL: &str = r#"
INSERT INTO tariff_product (tariff_id, hts_code)
SELECT * FROM UNNEST($1::uuid[], $2::text[])
ON CONFLICT (tariff_id, hts_code) DO NOTHING
"#;

#[derive(Debug, FromRow)]
struct ExistingMatch {
    temp_id: Uuid,
    existing_id: Uuid,
    existing_ad_valorem: f64,
    existing_specific: f64,
}

/// [`TariffStore`] backed by the `tariff` and `tariff_product` tables.
#[derive(Clone)]
pub struct PgTariffStore {
    pool: PgPool,
}

impl PgTariffStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TariffStore for PgTariffStore {
    async fn reconcile(
        &self,
        records: &[ConsolidatedTariffRecord],
        product_links: &HashMap<Uuid, String>,
    ) -> Result<ReconcileSummary, StoreError> {
        let candidates = linked_candidates(records, product_links);
        if candidates.is_empty() {
            return Ok(ReconcileSummary::default());
        }

        // Dropping `tx` on any early return rolls the whole batch back.
        let mut tx = self.pool.begin().await?;

        // 1. Stage
        sqlx::query(CREATE_STAGING_SQL).execute(&mut *tx).await?;
        for chunk in candidates.chunks(STAGING_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(STAGING_INSERT_PREFIX);
            builder.push_values(chunk, |mut row, (record, product_code)| {
                row.push_bind(record.id)
                    .push_bind(record.origin.clone())
                    .push_bind(record.destination.clone())
                    .push_bind(record.effective_date)
                    .push_bind(record.expiry_date)
                    .push_bind(record.ad_valorem_rate)
                    .push_bind(record.specific_rate)
                    .push_bind(record.min_quantity)
                    .push_bind(record.max_quantity)
                    .push_bind(record.user_defined)
                    .push_bind(record.enabled)
                    .push_bind(product_code.to_string());
            });
            builder.build().execute(&mut *tx).await?;
        }

        // 2. Diff by natural key in one join
        let matches: Vec<ExistingMatch> = sqlx::query_as(SELECT_EXISTING_SQL)
            .fetch_all(&mut *tx)
            .await?;

        let by_temp_id: HashMap<Uuid, &ConsolidatedTariffRecord> =
            candidates.iter().map(|(r, _)| (r.id, *r)).collect();

        let mut summary = ReconcileSummary::default();
        let mut matched: HashSet<Uuid> = HashSet::with_capacity(matches.len());
        let mut update_existing = Vec::new();
        let mut update_temp = Vec::new();

        for m in &matches {
            matched.insert(m.temp_id);
            let Some(candidate) = by_temp_id.get(&m.temp_id) else {
                continue;
            };
            if rates_changed(m.existing_ad_valorem, m.existing_specific, candidate) {
                update_existing.push(m.existing_id);
                update_temp.push(m.temp_id);
            } else {
                summary.unchanged += 1;
            }
        }

        // 3. Bulk update of drifted rows
        if !update_existing.is_empty() {
            let result = sqlx::query(UPDATE_EXISTING_SQL)
                .bind(&update_existing)
                .bind(&update_temp)
                .execute(&mut *tx)
                .await?;
            summary.updated = result.rows_affected();
        }

        // 4. Insert unmatched candidates, then their links
        let mut link_ids = Vec::new();
        let mut link_codes = Vec::new();
        for (record, product_code) in candidates.iter().filter(|(r, _)| !matched.contains(&r.id)) {
            let id: Uuid = sqlx::query_scalar(TARIFF_INSERT_SQL)
                .bind(record.id)
                .bind(&record.origin)
                .bind(&record.destination)
                .bind(record.effective_date)
                .bind(record.expiry_date)
                .bind(record.ad_valorem_rate)
                .bind(record.specific_rate)
                .bind(record.min_quantity)
                .bind(record.max_quantity)
                .bind(record.user_defined)
                .bind(record.enabled)
                .fetch_one(&mut *tx)
                .await?;
            link_ids.push(id);
            link_codes.push(product_code.to_string());
        }
        summary.inserted = link_ids.len() as u64;

        if !link_ids.is_empty() {
            sqlx::query(TARIFF_PRODUCT_INSERT_SQL)
                .bind(&link_ids)
                .bind(&link_codes)
                .execute(&mut *tx)
                .await?;
        }

        // 5. Commit
        tx.commit().await?;
        debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            "Reconciliation committed"
        );
        Ok(summary)
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
