//! Search Paginator
//!
//! Drives `cast/search` under the per-run search budget:
//! - Declarative fallback matrix of query variants for incremental runs
//! - Since → After anchor fallback when a first page comes back empty
//! - Contiguous and sliced backfill over the base query only
//! - Client-side window filtering and pacing between pages

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::budget::RequestBudget;
use crate::error::Result;
use crate::models::TimeWindow;
use crate::upstream::{
    ApiResponse, ContentSummary, SearchPage, SearchRequest, SortOrder, TimeAnchor, TimeAnchorKind,
    UpstreamApi,
};

/// Query shape of one search variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPredicate {
    /// Base query as configured
    Base,
    /// Base query restricted to the configured language
    Language,
    /// Language query narrowed to casts with replies
    HasReplies,
    /// Language query narrowed to casts with likes
    HasLikes,
    /// Language query narrowed to casts with recasts
    HasRecasts,
    /// Match-everything query
    Wildcard,
}

impl QueryPredicate {
    /// Renders the `q` parameter
    pub fn render(&self, base: &str, language: &str) -> String {
        let localized = || {
            if language.is_empty() {
                base.to_string()
            } else {
                format!("{base} lang:{language}")
            }
        };

        match self {
            Self::Base => base.to_string(),
            Self::Language => localized(),
            Self::HasReplies => format!("{} has:replies", localized()),
            Self::HasLikes => format!("{} has:likes", localized()),
            Self::HasRecasts => format!("{} has:recasts", localized()),
            Self::Wildcard => "*".to_string(),
        }
    }
}

/// Share of the page ceiling a variant may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageShare {
    Full,
    Half,
}

impl PageShare {
    pub fn apply(&self, max_pages: u32) -> u32 {
        match self {
            Self::Full => max_pages,
            Self::Half => (max_pages / 2).max(1),
        }
    }
}

/// One entry of the fallback matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SearchVariant {
    pub predicate: QueryPredicate,
    pub anchor: TimeAnchorKind,
    pub sort: SortOrder,
    pub pages: PageShare,
}

impl SearchVariant {
    pub const fn new(predicate: QueryPredicate, anchor: TimeAnchorKind, sort: SortOrder) -> Self {
        Self {
            predicate,
            anchor,
            sort,
            pages: PageShare::Full,
        }
    }
}

/// Incremental fallback matrix, tried in order
pub fn incremental_plan() -> Vec<SearchVariant> {
    const PREDICATES: [QueryPredicate; 5] = [
        QueryPredicate::Language,
        QueryPredicate::HasReplies,
        QueryPredicate::HasLikes,
        QueryPredicate::HasRecasts,
        QueryPredicate::Wildcard,
    ];

    let mut plan: Vec<SearchVariant> = PREDICATES
        .iter()
        .flat_map(|&predicate| {
            [TimeAnchorKind::Since, TimeAnchorKind::After]
                .into_iter()
                .map(move |anchor| SearchVariant::new(predicate, anchor, SortOrder::Relevance))
        })
        .collect();

    // Sort-order fallback with half the page ceiling
    plan.push(SearchVariant {
        pages: PageShare::Half,
        ..SearchVariant::new(
            QueryPredicate::Wildcard,
            TimeAnchorKind::Since,
            SortOrder::ChronologicalDesc,
        )
    });
    plan
}

/// Backfill plan: base query, anchor fallback only
pub fn backfill_plan() -> Vec<SearchVariant> {
    vec![
        SearchVariant::new(QueryPredicate::Base, TimeAnchorKind::Since, SortOrder::Relevance),
        SearchVariant::new(QueryPredicate::Base, TimeAnchorKind::After, SortOrder::Relevance),
    ]
}

/// Why a search stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Upstream returned no further cursor
    CursorExhausted,
    /// Page ceiling for the variant or slice was reached
    PageCeiling,
    /// Per-run search budget is spent
    BudgetExhausted,
    /// A page came back with a non-2xx status
    PageFailed,
    /// Too many consecutive slices yielded nothing
    EmptySlices,
    /// Every variant came back empty
    NoResults,
    /// All slices were scanned
    SlicesCompleted,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CursorExhausted => "cursor_exhausted",
            Self::PageCeiling => "page_ceiling",
            Self::BudgetExhausted => "budget_exhausted",
            Self::PageFailed => "page_failed",
            Self::EmptySlices => "empty_slices",
            Self::NoResults => "no_results",
            Self::SlicesCompleted => "slices_completed",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress through one variant's pages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationState {
    pub cursor: Option<String>,
    pub pages_used: u32,
    /// Status of a failed page, if any
    pub failed: Option<u16>,
}

impl PaginationState {
    pub fn record_page(&mut self, next_cursor: Option<String>) {
        self.cursor = next_cursor;
        self.pages_used += 1;
    }

    pub fn record_failure(&mut self, status: u16) {
        self.failed = Some(status);
    }
}

/// Reason to stop paginating, or `None` while another page is allowed
pub fn stop_reason(
    state: &PaginationState,
    max_pages: u32,
    budget: &RequestBudget,
) -> Option<StopReason> {
    if state.failed.is_some() {
        Some(StopReason::PageFailed)
    } else if state.pages_used > 0 && state.cursor.is_none() {
        Some(StopReason::CursorExhausted)
    } else if state.pages_used >= max_pages {
        Some(StopReason::PageCeiling)
    } else if budget.is_exhausted() {
        Some(StopReason::BudgetExhausted)
    } else {
        None
    }
}

pub fn should_continue(state: &PaginationState, max_pages: u32, budget: &RequestBudget) -> bool {
    stop_reason(state, max_pages, budget).is_none()
}

/// Result of fetching a single page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFetch {
    Page(SearchPage),
    Failed(u16),
    BudgetExhausted,
}

/// Everything a search produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    /// In-window summaries, in upstream order (may contain duplicates)
    pub items: Vec<ContentSummary>,
    pub pages: u32,
    /// Variant that produced results, if any
    pub variant: Option<SearchVariant>,
    pub stop_reason: StopReason,
    pub slices_scanned: u32,
}

/// Result of paging through one variant
struct VariantScan {
    items: Vec<ContentSummary>,
    pages: u32,
    hit: bool,
    stop: StopReason,
}

#[derive(Debug, Clone)]
pub struct PaginatorSettings {
    pub base_query: String,
    pub language: String,
    pub page_size: u32,
    pub page_delay: Duration,
}

impl PaginatorSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            base_query: config.search_query.clone(),
            language: config.search_language.clone(),
            page_size: config.page_size,
            page_delay: config.page_delay(),
        }
    }
}

/// Paginates search results for one run
pub struct Paginator<'a> {
    api: &'a dyn UpstreamApi,
    budget: &'a RequestBudget,
    settings: PaginatorSettings,
    requests_sent: u32,
}

impl<'a> Paginator<'a> {
    pub fn new(api: &'a dyn UpstreamApi, budget: &'a RequestBudget, settings: PaginatorSettings) -> Self {
        Self {
            api,
            budget,
            settings,
            requests_sent: 0,
        }
    }

    /// Fetches one page, charging the search budget and pacing after the first request
    pub async fn search_page(
        &mut self,
        query: &str,
        anchor: TimeAnchor,
        cursor: Option<String>,
        sort: SortOrder,
    ) -> Result<PageFetch> {
        if !self.budget.try_consume() {
            return Ok(PageFetch::BudgetExhausted);
        }

        if self.requests_sent > 0 && !self.settings.page_delay.is_zero() {
            tokio::time::sleep(self.settings.page_delay).await;
        }
        self.requests_sent += 1;

        let request = SearchRequest {
            query: query.to_string(),
            anchor,
            cursor,
            sort,
            limit: self.settings.page_size,
        };

        Ok(match self.api.search(&request).await? {
            ApiResponse::Ok(page) => PageFetch::Page(page),
            ApiResponse::Rejected { status, body } => {
                warn!(
                    status,
                    body = %truncate(&body, 200),
                    query,
                    "Search page failed"
                );
                PageFetch::Failed(status)
            }
        })
    }

    /// Incremental search over the fallback matrix
    pub async fn search_smart(&mut self, window: TimeWindow, max_pages: u32) -> Result<SearchOutcome> {
        self.run_plan(&incremental_plan(), window, max_pages).await
    }

    /// Contiguous backfill over the base query
    pub async fn search_backfill(&mut self, window: TimeWindow, max_pages: u32) -> Result<SearchOutcome> {
        self.run_plan(&backfill_plan(), window, max_pages).await
    }

    /// Sliced backfill, oldest slice first
    pub async fn search_slices(
        &mut self,
        window: TimeWindow,
        slice_width: ChronoDuration,
        slice_pages: u32,
        max_empty_slices: u32,
    ) -> Result<SearchOutcome> {
        let slices = window.slices(slice_width);
        let mut items = Vec::new();
        let mut pages = 0;
        let mut scanned = 0;
        let mut empty_streak = 0;
        let mut stop = StopReason::SlicesCompleted;

        for slice in &slices {
            if self.budget.is_exhausted() {
                stop = StopReason::BudgetExhausted;
                break;
            }

            let outcome = self.run_plan(&backfill_plan(), *slice, slice_pages).await?;
            scanned += 1;
            pages += outcome.pages;

            debug!(
                slice_start = %slice.start,
                slice_end = %slice.end,
                found = outcome.items.len(),
                pages = outcome.pages,
                "Slice scanned"
            );

            if outcome.items.is_empty() {
                empty_streak += 1;
                if max_empty_slices > 0 && empty_streak >= max_empty_slices {
                    info!(empty_streak, "Too many empty slices, stopping backfill");
                    stop = StopReason::EmptySlices;
                    break;
                }
            } else {
                empty_streak = 0;
                items.extend(outcome.items);
            }

            if outcome.stop_reason == StopReason::BudgetExhausted {
                stop = StopReason::BudgetExhausted;
                break;
            }
        }

        Ok(SearchOutcome {
            items,
            pages,
            variant: None,
            stop_reason: stop,
            slices_scanned: scanned,
        })
    }

    /// Tries variants in order until one has in-window results on its first page
    async fn run_plan(
        &mut self,
        plan: &[SearchVariant],
        window: TimeWindow,
        max_pages: u32,
    ) -> Result<SearchOutcome> {
        let mut pages = 0;
        let mut stop = StopReason::NoResults;

        for variant in plan {
            let scan = self.scan_variant(variant, window, max_pages).await?;
            pages += scan.pages;

            if scan.hit {
                info!(
                    predicate = ?variant.predicate,
                    anchor = variant.anchor.param_name(),
                    sort = variant.sort.as_param(),
                    pages = scan.pages,
                    found = scan.items.len(),
                    stop = %scan.stop,
                    "Search variant produced results"
                );
                return Ok(SearchOutcome {
                    items: scan.items,
                    pages,
                    variant: Some(*variant),
                    stop_reason: scan.stop,
                    slices_scanned: 0,
                });
            }

            if scan.stop == StopReason::BudgetExhausted {
                stop = StopReason::BudgetExhausted;
                break;
            }
            debug!(predicate = ?variant.predicate, anchor = variant.anchor.param_name(), "Variant empty, falling back");
        }

        Ok(SearchOutcome {
            items: Vec::new(),
            pages,
            variant: None,
            stop_reason: stop,
            slices_scanned: 0,
        })
    }

    async fn scan_variant(
        &mut self,
        variant: &SearchVariant,
        window: TimeWindow,
        max_pages: u32,
    ) -> Result<VariantScan> {
        let query = variant
            .predicate
            .render(&self.settings.base_query, &self.settings.language);
        let anchor = TimeAnchor {
            kind: variant.anchor,
            value: window.start,
        };
        let max_pages = variant.pages.apply(max_pages);

        let mut state = PaginationState::default();
        let mut items = Vec::new();

        let stop = loop {
            if let Some(reason) = stop_reason(&state, max_pages, self.budget) {
                break reason;
            }

            match self
                .search_page(&query, anchor, state.cursor.clone(), variant.sort)
                .await?
            {
                PageFetch::Page(page) => {
                    let accepted: Vec<ContentSummary> = page
                        .items
                        .into_iter()
                        .filter(|item| item.published_at.is_some_and(|ts| window.contains(ts)))
                        .collect();

                    let first_page = state.pages_used == 0;
                    state.record_page(page.next_cursor);

                    if first_page && accepted.is_empty() {
                        return Ok(VariantScan {
                            items,
                            pages: state.pages_used,
                            hit: false,
                            stop: StopReason::NoResults,
                        });
                    }
                    items.extend(accepted);
                }
                PageFetch::Failed(status) => state.record_failure(status),
                PageFetch::BudgetExhausted => break StopReason::BudgetExhausted,
            }
        };

        Ok(VariantScan {
            hit: !items.is_empty(),
            items,
            pages: state.pages_used,
            stop,
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
