//! Neynar Farcaster v2 adapter
//!
//! `GET {base}/cast/search` for paginated search and `GET {base}/casts` for
//! bulk details. Every call carries the static `x-api-key` header and goes
//! through the shared rate-limited client.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use std::sync::Arc;
use tracing::{debug, warn};

use super::decode::{decode_details, decode_search_page};
use super::{ApiResponse, ContentDetail, SearchPage, SearchRequest, UpstreamApi};
use crate::error::Result;
use crate::http_client::RateLimitedClient;

const API_KEY_HEADER: &str = "x-api-key";

/// Endpoint labels for logs and metrics
pub const ENDPOINT_SEARCH: &str = "cast_search";
pub const ENDPOINT_BULK: &str = "casts_bulk";

pub struct NeynarClient {
    http: Arc<RateLimitedClient>,
    base_url: String,
    api_key: String,
}

impl NeynarClient {
    pub fn new(http: Arc<RateLimitedClient>, base_url: &str, api_key: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn get(
        &self,
        endpoint: &'static str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<ApiResponse<String>> {
        let url = format!("{}/{}", self.base_url, path);
        let request = self
            .http
            .inner()
            .get(&url)
            .query(params)
            .header(API_KEY_HEADER, &self.api_key)
            .header(ACCEPT, "application/json")
            .build()?;

        let response = self.http.call(endpoint, request).await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            Ok(ApiResponse::Ok(body))
        } else {
            warn!(endpoint, status = status.as_u16(), "Upstream request rejected");
            Ok(ApiResponse::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl UpstreamApi for NeynarClient {
    fn name(&self) -> &str {
        "Neynar v2"
    }

    async fn search(&self, request: &SearchRequest) -> Result<ApiResponse<SearchPage>> {
        let mut params: Vec<(&str, String)> = vec![
            ("q", request.query.clone()),
            ("limit", request.limit.to_string()),
            ("sort_type", request.sort.as_param().to_string()),
            (
                request.anchor.kind.param_name(),
                request
                    .anchor
                    .value
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ),
        ];
        if let Some(ref cursor) = request.cursor {
            params.push(("cursor", cursor.clone()));
        }

        debug!(
            query = %request.query,
            anchor = request.anchor.kind.param_name(),
            sort = request.sort.as_param(),
            has_cursor = request.cursor.is_some(),
            "Searching casts"
        );

        Ok(match self.get(ENDPOINT_SEARCH, "cast/search", &params).await? {
            ApiResponse::Ok(body) => ApiResponse::Ok(decode_search_page(&body)?),
            ApiResponse::Rejected { status, body } => ApiResponse::Rejected { status, body },
        })
    }

    async fn fetch_details(&self, ids: &[String]) -> Result<ApiResponse<Vec<ContentDetail>>> {
        let params = [("casts", ids.join(","))];

        Ok(match self.get(ENDPOINT_BULK, "casts", &params).await? {
            ApiResponse::Ok(body) => ApiResponse::Ok(decode_details(&body)?),
            ApiResponse::Rejected { status, body } => ApiResponse::Rejected { status, body },
        })
    }
}
