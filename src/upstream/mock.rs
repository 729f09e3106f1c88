//! Scripted in-process upstream for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    ApiResponse, AuthorRef, ContentDetail, ContentSummary, SearchPage, SearchRequest, UpstreamApi,
};
use crate::error::Result;

type Responder = Box<dyn Fn(&SearchRequest) -> ApiResponse<SearchPage> + Send + Sync>;

/// Mock upstream serving fixed pages.
///
/// Without a custom responder, page `n` is served for cursor `page-n` (the
/// first page for no cursor), regardless of query, anchor or sort.
pub struct MockUpstream {
    pages: Vec<Vec<ContentSummary>>,
    responder: Option<Responder>,
    details: HashMap<String, ContentDetail>,
    failing_detail_calls: HashSet<usize>,
    search_requests: Mutex<Vec<SearchRequest>>,
    detail_requests: Mutex<Vec<Vec<String>>>,
    detail_calls: AtomicUsize,
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            responder: None,
            details: HashMap::new(),
            failing_detail_calls: HashSet::new(),
            search_requests: Mutex::new(Vec::new()),
            detail_requests: Mutex::new(Vec::new()),
            detail_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_pages(mut self, pages: Vec<Vec<ContentSummary>>) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&SearchRequest) -> ApiResponse<SearchPage> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn with_details(mut self, details: Vec<ContentDetail>) -> Self {
        self.details
            .extend(details.into_iter().map(|d| (d.summary.id.clone(), d)));
        self
    }

    /// Makes the n-th detail call (1-based) answer with HTTP 500
    pub fn fail_detail_call(mut self, n: usize) -> Self {
        self.failing_detail_calls.insert(n);
        self
    }

    pub fn search_calls(&self) -> usize {
        self.search_requests.lock().len()
    }

    pub fn search_requests(&self) -> Vec<SearchRequest> {
        self.search_requests.lock().clone()
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn detail_requests(&self) -> Vec<Vec<String>> {
        self.detail_requests.lock().clone()
    }

    fn page_for(&self, cursor: Option<&str>) -> ApiResponse<SearchPage> {
        let index = match cursor {
            None => 0,
            Some(c) => match c.strip_prefix("page-").and_then(|n| n.parse::<usize>().ok()) {
                Some(n) => n,
                None => {
                    return ApiResponse::Rejected {
                        status: 400,
                        body: format!("unknown cursor {c}"),
                    }
                }
            },
        };

        let items = self.pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < self.pages.len()).then(|| format!("page-{}", index + 1));
        ApiResponse::Ok(SearchPage { items, next_cursor })
    }
}

#[async_trait]
impl UpstreamApi for MockUpstream {
    fn name(&self) -> &str {
        "Mock upstream"
    }

    async fn search(&self, request: &SearchRequest) -> Result<ApiResponse<SearchPage>> {
        self.search_requests.lock().push(request.clone());
        Ok(match self.responder {
            Some(ref responder) => responder(request),
            None => self.page_for(request.cursor.as_deref()),
        })
    }

    async fn fetch_details(&self, ids: &[String]) -> Result<ApiResponse<Vec<ContentDetail>>> {
        let call = self.detail_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.detail_requests.lock().push(ids.to_vec());

        if self.failing_detail_calls.contains(&call) {
            return Ok(ApiResponse::Rejected {
                status: 500,
                body: "internal error".to_string(),
            });
        }

        Ok(ApiResponse::Ok(
            ids.iter()
                .filter_map(|id| self.details.get(id).cloned())
                .collect(),
        ))
    }
}

/// Builds a search hit authored by `author_id`
pub fn summary(
    id: &str,
    author_id: Option<i64>,
    published_at: chrono::DateTime<chrono::Utc>,
) -> ContentSummary {
    ContentSummary {
        id: id.to_string(),
        author: Some(AuthorRef {
            id: author_id,
            handle: author_id.map(|fid| format!("user{fid}")),
            display_name: None,
            avatar_url: None,
        }),
        body: format!("cast {id}"),
        channel: None,
        published_at: Some(published_at),
    }
}

/// Builds a detail record for a search hit
pub fn detail(summary: &ContentSummary, likes: i64, recasts: i64, replies: i64) -> ContentDetail {
    ContentDetail {
        summary: summary.clone(),
        like_count: likes,
        recast_count: recasts,
        reply_count: replies,
    }
}
