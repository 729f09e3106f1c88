//! Ingestion orchestrator
//!
//! One run walks: authorize → throttle → claim → window selection → search →
//! dedup → detail fetch → upsert → watermark advance. Any error after the
//! throttle check is caught at the top and reported as [`RunOutcome::Failed`];
//! writes that already happened stay committed (every write is an idempotent
//! merge).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::budget::RequestBudget;
use crate::config::Config;
use crate::detail_fetcher::{DetailBatchResult, DetailFetcher};
use crate::error::{IngestionError, Result};
use crate::metrics;
use crate::models::{
    floor_to_minute, AuthorProfile, ContentItem, IngestState, IngestStateUpdate, TimeWindow,
};
use crate::paginator::{Paginator, PaginatorSettings, SearchOutcome, StopReason};
use crate::storage::Store;
use crate::upstream::{ContentDetail, ContentSummary, UpstreamApi};

/// Maximum backfill depth in hours
pub const MAX_BACKFILL_HOURS: u32 = 168;

/// Lookback used when no watermark exists yet
pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

const CRON_HEADER_VALUE: &str = "1";
const CRON_USER_AGENT: &str = "vercel-cron";

/// Identity proof presented by a trigger
#[derive(Debug, Clone, Default)]
pub struct TriggerCredentials {
    /// Value of the `x-vercel-cron` header
    pub cron_header: Option<String>,
    pub user_agent: Option<String>,
    /// `token` query parameter or `x-ingest-token` header
    pub token: Option<String>,
}

impl TriggerCredentials {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn scheduler() -> Self {
        Self {
            cron_header: Some(CRON_HEADER_VALUE.to_string()),
            ..Default::default()
        }
    }

    fn is_scheduler(&self) -> bool {
        self.cron_header.as_deref() == Some(CRON_HEADER_VALUE)
            || self
                .user_agent
                .as_deref()
                .is_some_and(|ua| ua.to_ascii_lowercase().contains(CRON_USER_AGENT))
    }
}

/// Accepts the trusted scheduler or the shared secret; an empty secret never matches
pub fn authorize(credentials: &TriggerCredentials, ingest_token: &str) -> Result<()> {
    if credentials.is_scheduler() {
        return Ok(());
    }

    match credentials.token.as_deref() {
        Some(token)
            if !ingest_token.is_empty()
                && constant_time_eq(token.as_bytes(), ingest_token.as_bytes()) =>
        {
            Ok(())
        }
        _ => Err(IngestionError::Forbidden),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    Incremental,
    Backfill,
    Slices,
}

/// Parameters of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Validate)]
pub struct IngestRequest {
    /// 0 for incremental, otherwise backfill depth
    #[validate(range(max = 168))]
    #[serde(default)]
    pub hours: u32,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub include_existing: bool,
    /// Scan a backfill in fixed-width slices
    #[serde(default)]
    pub slices: bool,
    /// Overrides the configured base query
    #[validate(length(min = 1, max = 512))]
    #[serde(default)]
    pub query: Option<String>,
    /// Overrides the page ceiling of the selected mode
    #[validate(range(min = 1, max = 50))]
    #[serde(default)]
    pub pages: Option<u32>,
}

impl IngestRequest {
    pub fn incremental() -> Self {
        Self::default()
    }

    pub fn backfill(hours: u32) -> Self {
        Self {
            hours,
            ..Default::default()
        }
    }

    pub fn mode(&self) -> IngestMode {
        match (self.hours, self.slices) {
            (0, _) => IngestMode::Incremental,
            (_, false) => IngestMode::Backfill,
            (_, true) => IngestMode::Slices,
        }
    }

    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| IngestionError::InvalidInput(e.to_string()))?;
        if self.slices && self.hours == 0 {
            return Err(IngestionError::InvalidInput(
                "slice mode needs a backfill depth in hours".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters reported by a completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub mode: IngestMode,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// In-window search hits, duplicates included
    pub scanned: usize,
    pub unique: usize,
    pub skipped_existing: usize,
    pub detail_fetched: usize,
    pub upserted: usize,
    pub dropped_without_author: usize,
    pub authors_upserted: usize,
    pub search_requests: u32,
    pub bulk_requests: u32,
    pub slices_scanned: u32,
    pub stop_reason: StopReason,
    pub detail_failed_batch: Option<usize>,
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunOutcome {
    Completed(IngestSummary),
    Skipped {
        skipped: bool,
        reason: &'static str,
        last_run_minutes_ago: f64,
    },
    Failed {
        run_id: Uuid,
        error: String,
        kind: &'static str,
    },
}

impl RunOutcome {
    fn too_soon(minutes_ago: f64) -> Self {
        Self::Skipped {
            skipped: true,
            reason: "too_soon",
            last_run_minutes_ago: (minutes_ago * 10.0).round() / 10.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => metrics::OUTCOME_COMPLETED,
            Self::Skipped { .. } => metrics::OUTCOME_SKIPPED,
            Self::Failed { .. } => metrics::OUTCOME_FAILED,
        }
    }
}

/// Lower bound of the scan window.
///
/// Incremental runs resume from the watermark minus a buffer, or look back a
/// day on first run. Backfills ignore the watermark.
pub fn select_window(
    request: &IngestRequest,
    state: Option<&IngestState>,
    now: DateTime<Utc>,
    lookback_buffer: ChronoDuration,
) -> TimeWindow {
    let start = match request.mode() {
        IngestMode::Incremental => match state.and_then(|s| s.last_seen_timestamp) {
            Some(watermark) => floor_to_minute(watermark - lookback_buffer),
            None => floor_to_minute(now - ChronoDuration::hours(DEFAULT_LOOKBACK_HOURS)),
        },
        IngestMode::Backfill | IngestMode::Slices => {
            floor_to_minute(now - ChronoDuration::hours(i64::from(request.hours)))
        }
    };
    TimeWindow::new(start.min(now), now)
}

/// Unique ids in first-seen order, with the first summary seen for each
fn dedup_first_seen(items: &[ContentSummary]) -> (Vec<String>, HashMap<String, &ContentSummary>) {
    let mut order = Vec::new();
    let mut first_seen = HashMap::new();
    for item in items {
        if !first_seen.contains_key(&item.id) {
            order.push(item.id.clone());
            first_seen.insert(item.id.clone(), item);
        }
    }
    (order, first_seen)
}

/// Builds the row for one id, preferring the detail and falling back to the summary
fn build_row(
    summary: Option<&ContentSummary>,
    detail: Option<&ContentDetail>,
    now: DateTime<Utc>,
) -> Option<ContentItem> {
    let detail_summary = detail.map(|d| &d.summary);
    let id = detail_summary.or(summary)?.id.clone();

    let author_id = detail_summary
        .and_then(ContentSummary::author_id)
        .or_else(|| summary.and_then(ContentSummary::author_id))?;

    let body = detail_summary
        .map(|s| s.body.as_str())
        .filter(|b| !b.is_empty())
        .or_else(|| summary.map(|s| s.body.as_str()))
        .unwrap_or_default()
        .to_string();

    Some(ContentItem {
        id,
        author_id: Some(author_id),
        body,
        channel: detail_summary
            .and_then(|s| s.channel.clone())
            .or_else(|| summary.and_then(|s| s.channel.clone())),
        published_at: detail_summary
            .and_then(|s| s.published_at)
            .or_else(|| summary.and_then(|s| s.published_at))
            .unwrap_or(now),
        like_count: detail.map_or(0, |d| d.like_count),
        recast_count: detail.map_or(0, |d| d.recast_count),
        reply_count: detail.map_or(0, |d| d.reply_count),
    })
}

/// Runs ingestion against an upstream and a store
pub struct Orchestrator {
    api: Arc<dyn UpstreamApi>,
    store: Arc<dyn Store>,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn UpstreamApi>, store: Arc<dyn Store>, config: Arc<Config>) -> Self {
        Self { api, store, config }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Authorizes and validates a trigger, then runs.
    ///
    /// Authorization and parameter errors are returned as `Err` without side
    /// effects; everything else is reported through the outcome.
    pub async fn trigger(
        &self,
        credentials: &TriggerCredentials,
        request: IngestRequest,
    ) -> Result<RunOutcome> {
        if let Err(e) = authorize(credentials, &self.config.ingest_token) {
            warn!(
                has_token = credentials.token.is_some(),
                user_agent = credentials.user_agent.as_deref().unwrap_or(""),
                "Ingest trigger forbidden"
            );
            return Err(e);
        }
        request.check()?;
        Ok(self.run(request).await)
    }

    pub async fn run(&self, request: IngestRequest) -> RunOutcome {
        self.run_at(request, Utc::now()).await
    }

    /// Runs with an explicit clock reading
    pub async fn run_at(&self, request: IngestRequest, now: DateTime<Utc>) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        let outcome = match self.execute(&request, now, run_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run_id = %run_id, error = %e, kind = e.kind(), "Ingest run failed");
                RunOutcome::Failed {
                    run_id,
                    error: e.to_string(),
                    kind: e.kind(),
                }
            }
        };

        metrics::record_run(outcome.label(), started.elapsed().as_secs_f64());
        outcome
    }

    #[instrument(skip_all, fields(run_id = %run_id, mode = ?request.mode()))]
    async fn execute(
        &self,
        request: &IngestRequest,
        now: DateTime<Utc>,
        run_id: Uuid,
    ) -> Result<RunOutcome> {
        let state = self.store.get_ingest_state().await?;

        // Throttled: best-effort, non-atomic
        if !request.force {
            if let Some(ref state) = state {
                let since_last = now - state.last_run_at;
                if since_last < ChronoDuration::minutes(self.config.min_interval_minutes) {
                    let minutes_ago = since_last.num_milliseconds() as f64 / 60_000.0;
                    info!(minutes_ago, "Skipping run, previous run too recent");
                    return Ok(RunOutcome::too_soon(minutes_ago));
                }
            }
        }

        self.store
            .upsert_ingest_state(IngestStateUpdate::claim_run(now))
            .await?;

        let window = select_window(
            request,
            state.as_ref(),
            now,
            ChronoDuration::minutes(self.config.lookback_buffer_minutes),
        );
        info!(
            upstream = self.api.name(),
            window_start = %window.start,
            window_end = %window.end,
            "Starting ingest run"
        );

        // Budgets are per run; the rate limiter is shared for the process
        let search_budget = RequestBudget::new("search", self.config.max_search_requests);
        let bulk_budget = RequestBudget::new("bulk", self.config.max_bulk_requests);

        let search = self.search(request, window, &search_budget).await?;
        let (unique_ids, first_seen) = dedup_first_seen(&search.items);

        let selected: Vec<String> = if request.include_existing || unique_ids.is_empty() {
            unique_ids.clone()
        } else {
            let existing = self.store.existing_content_ids(&unique_ids).await?;
            unique_ids
                .iter()
                .filter(|id| !existing.contains(*id))
                .cloned()
                .collect()
        };
        let skipped_existing = unique_ids.len() - selected.len();

        let search_authors: Vec<AuthorProfile> = unique_ids
            .iter()
            .filter_map(|id| first_seen.get(id))
            .filter_map(|s| s.author.as_ref().and_then(|a| a.to_profile()))
            .collect();
        let mut authors_upserted = self.upsert_authors_best_effort(&search_authors, "search").await;

        let details = DetailFetcher::new(
            self.api.as_ref(),
            &bulk_budget,
            self.config.bulk_batch_size,
            self.config.page_delay(),
        )
        .fetch_details(&selected)
        .await?;

        let detail_authors: Vec<AuthorProfile> = details
            .items
            .iter()
            .filter_map(|d| d.summary.author.as_ref().and_then(|a| a.to_profile()))
            .collect();
        authors_upserted += self.upsert_authors_best_effort(&detail_authors, "details").await;

        let (rows, dropped_without_author) = Self::build_rows(&selected, &first_seen, &details, now);

        if !rows.is_empty() {
            self.store.upsert_content_items(&rows).await?;
            metrics::record_rows_upserted(metrics::TABLE_CONTENT, rows.len());
        }

        let existing_watermark = state.as_ref().and_then(|s| s.last_seen_timestamp);
        let watermark = match rows.iter().map(|r| r.published_at).max() {
            Some(newest) => {
                self.store
                    .upsert_ingest_state(IngestStateUpdate::advance(Some(newest), now))
                    .await?;
                Some(existing_watermark.map_or(newest, |w| w.max(newest)))
            }
            None => existing_watermark,
        };

        let summary = IngestSummary {
            run_id,
            mode: request.mode(),
            window_start: window.start,
            window_end: window.end,
            scanned: search.items.len(),
            unique: unique_ids.len(),
            skipped_existing,
            detail_fetched: details.items.len(),
            upserted: rows.len(),
            dropped_without_author,
            authors_upserted,
            search_requests: search_budget.used(),
            bulk_requests: bulk_budget.used(),
            slices_scanned: search.slices_scanned,
            stop_reason: search.stop_reason,
            detail_failed_batch: details.failed_batch,
            watermark,
        };

        info!(
            scanned = summary.scanned,
            unique = summary.unique,
            skipped_existing = summary.skipped_existing,
            upserted = summary.upserted,
            search_requests = summary.search_requests,
            bulk_requests = summary.bulk_requests,
            search_budget_left = search_budget.remaining(),
            bulk_budget_left = bulk_budget.remaining(),
            stop_reason = %summary.stop_reason,
            "Ingest run completed"
        );

        Ok(RunOutcome::Completed(summary))
    }

    async fn search(
        &self,
        request: &IngestRequest,
        window: TimeWindow,
        budget: &RequestBudget,
    ) -> Result<SearchOutcome> {
        let mut settings = PaginatorSettings::from_config(&self.config);
        if let Some(ref query) = request.query {
            settings.base_query = query.clone();
        }
        let mut paginator = Paginator::new(self.api.as_ref(), budget, settings);

        match request.mode() {
            IngestMode::Incremental => {
                let pages = request.pages.unwrap_or(self.config.incremental_pages);
                paginator.search_smart(window, pages).await
            }
            IngestMode::Backfill => {
                let pages = request.pages.unwrap_or(self.config.backfill_pages);
                paginator.search_backfill(window, pages).await
            }
            IngestMode::Slices => {
                let pages = request.pages.unwrap_or(self.config.slice_pages);
                paginator
                    .search_slices(
                        window,
                        ChronoDuration::hours(i64::from(self.config.slice_hours)),
                        pages,
                        self.config.max_empty_slices,
                    )
                    .await
            }
        }
    }

    /// Author rows are enrichment; a failed write is logged and the run goes on
    async fn upsert_authors_best_effort(&self, authors: &[AuthorProfile], source: &str) -> usize {
        if authors.is_empty() {
            return 0;
        }
        match self.store.upsert_authors(authors).await {
            Ok(count) => {
                metrics::record_rows_upserted(metrics::TABLE_AUTHORS, count);
                count
            }
            Err(e) => {
                warn!(source, error = %e, "Author upsert skipped");
                0
            }
        }
    }

    fn build_rows(
        selected: &[String],
        first_seen: &HashMap<String, &ContentSummary>,
        details: &DetailBatchResult,
        now: DateTime<Utc>,
    ) -> (Vec<ContentItem>, usize) {
        let by_id: HashMap<&str, &ContentDetail> = details
            .items
            .iter()
            .map(|d| (d.summary.id.as_str(), d))
            .collect();

        let mut rows = Vec::with_capacity(selected.len());
        let mut dropped = 0;
        let mut seen = HashSet::new();
        for id in selected {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match build_row(
                first_seen.get(id).copied(),
                by_id.get(id.as_str()).copied(),
                now,
            ) {
                Some(row) => rows.push(row),
                None => dropped += 1,
            }
        }
        (rows, dropped)
    }
}
