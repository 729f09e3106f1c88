//! Configuration for the ingestion service

use serde::Deserialize;
use std::time::Duration;

use crate::error::{IngestionError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Upstream API
    pub neynar_api_key: Option<String>,
    #[serde(default = "default_neynar_api_url")]
    pub neynar_api_url: String,

    // Trigger auth
    #[serde(default)]
    pub ingest_token: String,

    // Storage
    pub database_url: Option<String>,
    #[serde(default = "default_storage_type")]
    pub storage_type: String,

    // Rate limiting (requests per minute) and retries
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    // Per-run request budgets
    #[serde(default = "default_max_search_requests")]
    pub max_search_requests: u32,
    #[serde(default = "default_max_bulk_requests")]
    pub max_bulk_requests: u32,
    #[serde(default = "default_bulk_batch_size")]
    pub bulk_batch_size: usize,
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    // Page ceilings
    #[serde(default = "default_incremental_pages")]
    pub incremental_pages: u32,
    #[serde(default = "default_backfill_pages")]
    pub backfill_pages: u32,

    // Sliced backfill
    #[serde(default = "default_slice_hours")]
    pub slice_hours: u32,
    #[serde(default = "default_slice_pages")]
    pub slice_pages: u32,
    #[serde(default = "default_max_empty_slices")]
    pub max_empty_slices: u32,

    // Windowing and throttle
    #[serde(default = "default_lookback_buffer_minutes")]
    pub lookback_buffer_minutes: i64,
    #[serde(default = "default_min_interval_minutes")]
    pub min_interval_minutes: i64,

    // Search
    #[serde(default = "default_search_query")]
    pub search_query: String,
    #[serde(default = "default_search_language")]
    pub search_language: String,

    // HTTP server
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_neynar_api_url() -> String {
    "https://api.neynar.com/v2/farcaster".to_string()
}

fn default_storage_type() -> String {
    "postgres".to_string()
}

fn default_rate_limit_rpm() -> u32 {
    45 // Neynar starter plan leaves headroom under 60
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_ms() -> u64 {
    1200
}

fn default_page_delay_ms() -> u64 {
    1800
}

fn default_max_search_requests() -> u32 {
    60
}

fn default_max_bulk_requests() -> u32 {
    30
}

fn default_bulk_batch_size() -> usize {
    100
}

fn default_page_size() -> u32 {
    100
}

fn default_incremental_pages() -> u32 {
    5
}

fn default_backfill_pages() -> u32 {
    20
}

fn default_slice_hours() -> u32 {
    2
}

fn default_slice_pages() -> u32 {
    2
}

fn default_max_empty_slices() -> u32 {
    3
}

fn default_lookback_buffer_minutes() -> i64 {
    5
}

fn default_min_interval_minutes() -> i64 {
    10
}

fn default_search_query() -> String {
    "*".to_string()
}

fn default_search_language() -> String {
    "en".to_string()
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Validates the configuration before any network activity happens
    pub fn validate(&self) -> Result<()> {
        if self.neynar_api_key.as_deref().map_or(true, str::is_empty) {
            return Err(IngestionError::MissingConfig("NEYNAR_API_KEY".to_string()));
        }

        url::Url::parse(&self.neynar_api_url).map_err(|e| {
            IngestionError::MissingConfig(format!("NEYNAR_API_URL is not a valid URL: {e}"))
        })?;

        match self.storage_type.as_str() {
            "postgres" => {
                if self.database_url.is_none() {
                    return Err(IngestionError::MissingConfig("DATABASE_URL".to_string()));
                }
            }
            "memory" => {}
            other => {
                return Err(IngestionError::MissingConfig(format!(
                    "unknown STORAGE_TYPE: {other}"
                )))
            }
        }

        if self.rate_limit_rpm == 0
            || self.max_search_requests == 0
            || self.max_bulk_requests == 0
            || self.bulk_batch_size == 0
            || self.slice_hours == 0
        {
            return Err(IngestionError::MissingConfig(
                "rate limit, budgets, batch size and slice width must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks if the upstream API key is configured
    pub fn has_api_key(&self) -> bool {
        self.neynar_api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}
