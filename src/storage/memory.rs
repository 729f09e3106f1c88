//! In-memory [`Store`] for local runs and tests.
//!
//! Applies the same merge rules as the Postgres store, behind
//! `parking_lot::RwLock`s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use super::{clamp_top_limit, Store};
use crate::error::Result;
use crate::models::{
    AuthorProfile, ContentItem, IngestState, IngestStateUpdate, LeaderboardEntry, LeaderboardMetric,
};

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<Option<IngestState>>,
    content: RwLock<HashMap<String, ContentItem>>,
    authors: RwLock<HashMap<i64, AuthorProfile>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_item(&self, id: &str) -> Option<ContentItem> {
        self.content.read().get(id).cloned()
    }

    pub fn author(&self, id: i64) -> Option<AuthorProfile> {
        self.authors.read().get(&id).cloned()
    }

    pub fn content_count(&self) -> usize {
        self.content.read().len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_ingest_state(&self) -> Result<Option<IngestState>> {
        Ok(self.state.read().clone())
    }

    async fn upsert_ingest_state(&self, update: IngestStateUpdate) -> Result<()> {
        let mut state = self.state.write();
        let merged = update.merge_into(state.as_ref(), Utc::now());
        *state = Some(merged);
        Ok(())
    }

    async fn existing_content_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let content = self.content.read();
        Ok(ids
            .iter()
            .filter(|id| content.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn upsert_content_items(&self, items: &[ContentItem]) -> Result<usize> {
        let mut content = self.content.write();
        for item in items {
            let merged = match content.get(&item.id) {
                Some(stored) => stored.merged_with(item),
                None => item.clone(),
            };
            content.insert(item.id.clone(), merged);
        }
        Ok(items.len())
    }

    async fn upsert_authors(&self, authors: &[AuthorProfile]) -> Result<usize> {
        let collapsed = AuthorProfile::collapse(authors);
        let mut stored = self.authors.write();
        for author in &collapsed {
            let merged = match stored.get(&author.id) {
                Some(existing) => existing.merged_with(author),
                None => author.clone(),
            };
            stored.insert(author.id, merged);
        }
        Ok(collapsed.len())
    }

    async fn query_top_content(
        &self,
        metric: LeaderboardMetric,
        window_start: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LeaderboardEntry>> {
        let content = self.content.read();
        let authors = self.authors.read();

        let mut rows: Vec<&ContentItem> = content
            .values()
            .filter(|item| item.published_at >= window_start)
            .collect();
        rows.sort_by(|a, b| {
            metric
                .value_of(b)
                .cmp(&metric.value_of(a))
                .then_with(|| b.published_at.cmp(&a.published_at))
        });

        Ok(rows
            .into_iter()
            .take(clamp_top_limit(limit) as usize)
            .map(|item| {
                let author = item.author_id.and_then(|id| authors.get(&id));
                LeaderboardEntry::new(item.clone(), author)
            })
            .collect())
    }

    async fn health_check(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }
}
