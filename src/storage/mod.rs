//! Storage layer for the leaderboard
//!
//! The [`Store`] trait covers everything the ingestion run and the
//! leaderboard read path need. Every write is a merge-upsert, so replaying a
//! run against the same data is harmless:
//! - content counters only grow (`max`)
//! - author fields are coalesced (nulls never clobber)
//! - the watermark is only ever advanced

pub mod memory;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::{IngestionError, Result};
use crate::models::{
    AuthorProfile, ContentItem, IngestState, IngestStateUpdate, LeaderboardEntry, LeaderboardMetric,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Hard bounds on the leaderboard page size
pub const MIN_TOP_LIMIT: u32 = 1;
pub const MAX_TOP_LIMIT: u32 = 50;

pub fn clamp_top_limit(limit: u32) -> u32 {
    limit.clamp(MIN_TOP_LIMIT, MAX_TOP_LIMIT)
}

/// Persistence collaborator for the ingestion service
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads the singleton ingest state, if a run ever claimed it
    async fn get_ingest_state(&self) -> Result<Option<IngestState>>;

    /// Writes the singleton ingest state, creating it if needed
    async fn upsert_ingest_state(&self, update: IngestStateUpdate) -> Result<()>;

    /// Subset of `ids` already persisted
    async fn existing_content_ids(&self, ids: &[String]) -> Result<HashSet<String>>;

    /// Merge-upserts content rows; returns the number of rows written
    async fn upsert_content_items(&self, items: &[ContentItem]) -> Result<usize>;

    /// Coalesce-upserts author profiles; returns the number of distinct authors
    async fn upsert_authors(&self, authors: &[AuthorProfile]) -> Result<usize>;

    /// Top content published at or after `window_start`, best first
    async fn query_top_content(
        &self,
        metric: LeaderboardMetric,
        window_start: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LeaderboardEntry>>;

    /// Round-trips to the store and returns its clock
    async fn health_check(&self) -> Result<DateTime<Utc>>;
}

/// Builds the store selected by `STORAGE_TYPE`
pub async fn create_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.storage_type.as_str() {
        "memory" => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        "postgres" => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| IngestionError::MissingConfig("DATABASE_URL".to_string()))?;
            Ok(Arc::new(PgStore::connect(url).await?))
        }
        other => Err(IngestionError::MissingConfig(format!(
            "unknown STORAGE_TYPE: {other}"
        ))),
    }
}
