//! Bulk Detail Fetcher
//!
//! Hydrates content ids in fixed-size batches. The first failing batch ends
//! the fetch; whatever was collected so far is still returned.

use std::time::Duration;
use tracing::{debug, warn};

use crate::budget::RequestBudget;
use crate::error::Result;
use crate::upstream::{ApiResponse, ContentDetail, UpstreamApi};

/// Outcome of a bulk detail fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailBatchResult {
    pub items: Vec<ContentDetail>,
    pub batches_ok: u32,
    /// Index of the batch that failed, if one did
    pub failed_batch: Option<usize>,
    /// Status the failing batch returned
    pub failed_status: Option<u16>,
    pub budget_exhausted: bool,
}

pub struct DetailFetcher<'a> {
    api: &'a dyn UpstreamApi,
    budget: &'a RequestBudget,
    batch_size: usize,
    batch_delay: Duration,
}

impl<'a> DetailFetcher<'a> {
    pub fn new(
        api: &'a dyn UpstreamApi,
        budget: &'a RequestBudget,
        batch_size: usize,
        batch_delay: Duration,
    ) -> Self {
        Self {
            api,
            budget,
            batch_size: batch_size.max(1),
            batch_delay,
        }
    }

    pub async fn fetch_details(&self, ids: &[String]) -> Result<DetailBatchResult> {
        let mut result = DetailBatchResult::default();
        let batches: Vec<&[String]> = ids.chunks(self.batch_size).collect();

        for (index, batch) in batches.iter().enumerate() {
            if !self.budget.try_consume() {
                warn!(
                    budget = self.budget.name(),
                    remaining_batches = batches.len() - index,
                    limit = self.budget.limit(),
                    "Bulk budget exhausted"
                );
                result.budget_exhausted = true;
                break;
            }

            if index > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }

            match self.api.fetch_details(batch).await? {
                ApiResponse::Ok(details) => {
                    debug!(batch = index, requested = batch.len(), received = details.len(), "Detail batch fetched");
                    result.items.extend(details);
                    result.batches_ok += 1;
                }
                ApiResponse::Rejected { status, .. } => {
                    warn!(batch = index, status, "Detail batch failed, keeping partial results");
                    result.failed_batch = Some(index);
                    result.failed_status = Some(status);
                    break;
                }
            }
        }

        Ok(result)
    }
}
