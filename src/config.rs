//! Run configuration, read from command-line flags or the environment.

use crate::executor::RetryPolicy;
use crate::model::CountryPair;
use clap::Parser;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CODELIST_URL: &str =
    "https://wits.worldbank.org/API/V1/SDMX/V21/rest/codelist/all/";

pub const DEFAULT_TARIFF_URL_BASE: &str =
    "https://wits.worldbank.org/API/V1/SDMX/V21/rest/data/DF_WITS_Tariff_TRAINS";

pub const DEFAULT_PRODUCTS: [&str; 5] = ["847330", "847170", "851712", "847130", "854231"];

fn default_products() -> Vec<String> {
    DEFAULT_PRODUCTS.iter().map(|p| p.to_string()).collect()
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Parser)]
#[command(name = "tariff-harvester", version, about = "Harvest WITS tariffs into PostgreSQL")]
pub struct HarvestConfig {
    /// Maximum requests in flight
    #[arg(long, env = "CONCURRENCY", default_value_t = 50)]
    pub concurrency: usize,

    /// Complete pairs accumulated before a flush
    #[arg(long, env = "PAIRS_PER_FLUSH", default_value_t = 10)]
    pub pairs_per_flush: usize,

    /// Total attempts per request
    #[arg(long, env = "MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// Base backoff in seconds
    #[arg(long, env = "RETRY_BASE", default_value_t = 0.5)]
    pub retry_base_secs: f64,

    /// Per-request timeout in seconds
    #[arg(long, env = "API_TIMEOUT", default_value_t = 30)]
    pub api_timeout_secs: u64,

    /// HS product codes requested for every pair
    #[arg(long, env = "PRODUCTS", value_delimiter = ',', default_values_t = default_products())]
    pub products: Vec<String>,

    /// First year requested from the tariff source
    #[arg(long, env = "START_PERIOD", default_value_t = 1988)]
    pub start_period: i32,

    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "DB_MAX_CONNECTIONS")]
    pub db_max_connections: Option<u32>,

    #[arg(long, env = "CODELIST_URL", default_value = DEFAULT_CODELIST_URL)]
    pub codelist_url: String,

    #[arg(long, env = "TARIFF_URL_BASE", default_value = DEFAULT_TARIFF_URL_BASE)]
    pub tariff_url_base: String,

    /// Reconcile into an in-memory store instead of PostgreSQL
    #[arg(long)]
    pub dry_run: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            pairs_per_flush: 10,
            max_retries: 5,
            retry_base_secs: 0.5,
            api_timeout_secs: 30,
            products: default_products(),
            start_period: 1988,
            database_url: None,
            db_max_connections: None,
            codelist_url: DEFAULT_CODELIST_URL.to_string(),
            tariff_url_base: DEFAULT_TARIFF_URL_BASE.to_string(),
            dry_run: false,
        }
    }
}

impl HarvestConfig {
    /// Rejects settings that would make a run meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for zero limits, a non-positive retry base, an
    /// empty product list, or a missing database URL outside dry-run mode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.pairs_per_flush == 0 {
            return Err(invalid("pairs_per_flush", "must be at least 1"));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries", "must be at least 1"));
        }
        if !self.retry_base_secs.is_finite() || self.retry_base_secs <= 0.0 {
            return Err(invalid("retry_base_secs", "must be a positive number"));
        }
        if self.api_timeout_secs == 0 {
            return Err(invalid("api_timeout_secs", "must be at least 1"));
        }
        if self.products.iter().all(|p| p.trim().is_empty()) {
            return Err(invalid("products", "at least one product code is required"));
        }
        if !self.dry_run && self.database_url.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs_f64(self.retry_base_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Pool size: explicit setting, else a quarter of the request concurrency.
    pub fn max_db_connections(&self) -> u32 {
        self.db_max_connections
            .unwrap_or_else(|| (self.concurrency / 4 + 1).max(2) as u32)
    }

    /// Product codes joined the way the tariff source expects them.
    pub fn product_query(&self) -> String {
        self.products
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// URL returning every configured product for one pair.
    pub fn tariff_url(&self, pair: &CountryPair) -> String {
        format!(
            "{}/A.{}.{}.{}.reported/?startperiod={}&detail=dataOnly",
            self.tariff_url_base.trim_end_matches('/'),
            pair.destination,
            pair.origin,
            self.product_query(),
            self.start_period
        )
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> HarvestConfig {
        HarvestConfig {
            database_url: Some("postgres://localhost/tariffs".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(valid().validate().is_ok());
        assert_eq!(valid().retry_policy().base_delay, Duration::from_millis(500));
        assert_eq!(valid().max_db_connections(), 13);
    }

    #[test]
    fn test_missing_database_url() {
        let config = HarvestConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::Missing("DATABASE_URL")));

        let dry = HarvestConfig {
            dry_run: true,
            ..Default::default()
        };
        assert!(dry.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_tuning() {
        let zero_concurrency = HarvestConfig {
            concurrency: 0,
            ..valid()
        };
        assert!(zero_concurrency.validate().is_err());

        let bad_base = HarvestConfig {
            retry_base_secs: f64::NAN,
            ..valid()
        };
        assert!(bad_base.validate().is_err());

        let no_products = HarvestConfig {
            products: vec![" ".into()],
            ..valid()
        };
        assert!(no_products.validate().is_err());
    }

    #[test]
    fn test_tariff_url_layout() {
        let config = HarvestConfig {
            products: vec!["847330".into(), "851712".into()],
            ..valid()
        };
        let url = config.tariff_url(&CountryPair::new("004", "840"));
        assert_eq!(
            url,
            "https://wits.worldbank.org/API/V1/SDMX/V21/rest/data/DF_WITS_Tariff_TRAINS/\
             A.840.004.847330+851712.reported/?startperiod=1988&detail=dataOnly"
        );
    }

    #[test]
    fn test_parse_from_flags() {
        let config = HarvestConfig::parse_from([
            "tariff-harvester",
            "--concurrency",
            "8",
            "--products",
            "111111,222222",
            "--dry-run",
        ]);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.products, vec!["111111", "222222"]);
        assert!(config.dry_run);
    }
}
