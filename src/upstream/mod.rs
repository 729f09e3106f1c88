//! Upstream content API
//!
//! The ingestion core talks to the social-graph API only through the
//! [`UpstreamApi`] trait. Responses are decoded once, at this boundary, into
//! the fixed [`ContentSummary`] / [`ContentDetail`] shapes.

pub mod decode;
pub mod mock;
pub mod neynar;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::AuthorProfile;

/// How the lower time bound of a search is expressed upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeAnchorKind {
    /// Inclusive lower bound
    Since,
    /// Exclusive, cursor-like lower bound
    After,
}

impl TimeAnchorKind {
    pub fn param_name(&self) -> &'static str {
        match self {
            Self::Since => "since",
            Self::After => "after",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAnchor {
    pub kind: TimeAnchorKind,
    pub value: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    ChronologicalAsc,
    ChronologicalDesc,
    Relevance,
}

impl SortOrder {
    /// Value of the upstream `sort_type` parameter
    pub fn as_param(&self) -> &'static str {
        match self {
            Self::ChronologicalAsc => "chron",
            Self::ChronologicalDesc => "desc_chron",
            Self::Relevance => "algorithmic",
        }
    }
}

/// One search call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub anchor: TimeAnchor,
    pub cursor: Option<String>,
    pub sort: SortOrder,
    pub limit: u32,
}

/// Author data embedded in a cast; any field may be missing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRef {
    pub id: Option<i64>,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl AuthorRef {
    /// Profile row for this author, if it has a usable id
    pub fn to_profile(&self) -> Option<AuthorProfile> {
        Some(AuthorProfile {
            id: self.id?,
            handle: self.handle.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        })
    }
}

/// A search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSummary {
    pub id: String,
    pub author: Option<AuthorRef>,
    pub body: String,
    pub channel: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl ContentSummary {
    pub fn author_id(&self) -> Option<i64> {
        self.author.as_ref().and_then(|a| a.id)
    }
}

/// A fully hydrated cast with engagement counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDetail {
    pub summary: ContentSummary,
    pub like_count: i64,
    pub recast_count: i64,
    pub reply_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub items: Vec<ContentSummary>,
    pub next_cursor: Option<String>,
}

/// HTTP-level outcome of an upstream call.
///
/// A non-2xx status is a normal result the caller branches on, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiResponse<T> {
    Ok(T),
    Rejected { status: u16, body: String },
}

/// Paginated search and batch detail lookups against the content API
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Gets the adapter name
    fn name(&self) -> &str;

    /// Fetches one page of search results
    async fn search(&self, request: &SearchRequest) -> Result<ApiResponse<SearchPage>>;

    /// Fetches full records for up to one batch of ids
    async fn fetch_details(&self, ids: &[String]) -> Result<ApiResponse<Vec<ContentDetail>>>;
}
