//! Castboard ingestion service
//!
//! Periodically pulls recent Farcaster casts from the Neynar API under a
//! strict request budget, merges their engagement counters into storage and
//! serves a ranked leaderboard.

pub mod budget;
pub mod config;
pub mod detail_fetcher;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod paginator;
pub mod rate_limiter;
pub mod server;
pub mod storage;
pub mod upstream;

pub use config::Config;
pub use error::{IngestionError, Result};
pub use orchestrator::{IngestRequest, Orchestrator, RunOutcome};
