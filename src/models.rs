//! Domain model: leaderboard rows, author profiles, and the ingest watermark.

use chrono::{DateTime, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed key of the singleton ingest-state row
pub const INGEST_STATE_ID: &str = "casts";

/// Weight of a reply in the engagement score
pub const REPLY_WEIGHT: i64 = 10;
/// Weight of a recast in the engagement score
pub const RECAST_WEIGHT: i64 = 3;
/// Weight of a like in the engagement score
pub const LIKE_WEIGHT: i64 = 1;

/// Weighted engagement: replies, then recasts, then likes.
pub fn engagement_score(likes: i64, recasts: i64, replies: i64) -> i64 {
    replies * REPLY_WEIGHT + recasts * RECAST_WEIGHT + likes * LIKE_WEIGHT
}

/// Truncates a timestamp to the start of its minute
pub fn floor_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(ts)
}

/// Closed time range `[start, end]` a run accepts content from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Splits the window into `width`-wide slices, oldest first.
    ///
    /// The last slice is clipped to `end`.
    pub fn slices(&self, width: chrono::Duration) -> Vec<TimeWindow> {
        if width <= chrono::Duration::zero() || self.start >= self.end {
            return vec![*self];
        }

        let mut slices = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let next = (cursor + width).min(self.end);
            slices.push(TimeWindow::new(cursor, next));
            cursor = next;
        }
        slices
    }
}

/// Singleton ingestion watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestState {
    /// Latest content timestamp successfully persisted
    pub last_seen_timestamp: Option<DateTime<Utc>>,
    /// Wall-clock time of the most recent run claim
    pub last_run_at: DateTime<Utc>,
}

/// Partial write into the singleton state.
///
/// `last_seen_timestamp` is coalesced (a `None` keeps the stored value) and
/// only ever advanced; `last_run_at` overwrites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStateUpdate {
    pub last_seen_timestamp: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl IngestStateUpdate {
    pub fn claim_run(now: DateTime<Utc>) -> Self {
        Self {
            last_seen_timestamp: None,
            last_run_at: Some(now),
        }
    }

    pub fn advance(watermark: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            last_seen_timestamp: watermark,
            last_run_at: Some(now),
        }
    }

    /// Applies this update on top of an existing state
    pub fn merge_into(&self, existing: Option<&IngestState>, now: DateTime<Utc>) -> IngestState {
        let last_seen_timestamp = match (existing.and_then(|s| s.last_seen_timestamp), self.last_seen_timestamp) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => new.or(old),
        };
        let last_run_at = self
            .last_run_at
            .or_else(|| existing.map(|s| s.last_run_at))
            .unwrap_or(now);

        IngestState {
            last_seen_timestamp,
            last_run_at,
        }
    }
}

/// One leaderboard row (a cast)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: String,
    pub author_id: Option<i64>,
    pub body: String,
    pub channel: Option<String>,
    pub published_at: DateTime<Utc>,
    pub like_count: i64,
    pub recast_count: i64,
    pub reply_count: i64,
}

impl ContentItem {
    pub fn engagement_score(&self) -> i64 {
        engagement_score(self.like_count, self.recast_count, self.reply_count)
    }

    /// Merges an incoming sighting into a stored row.
    ///
    /// Counters never decrease; every other scalar takes the incoming value.
    pub fn merged_with(&self, incoming: &ContentItem) -> ContentItem {
        ContentItem {
            id: self.id.clone(),
            author_id: incoming.author_id,
            body: incoming.body.clone(),
            channel: incoming.channel.clone(),
            published_at: incoming.published_at,
            like_count: self.like_count.max(incoming.like_count),
            recast_count: self.recast_count.max(incoming.recast_count),
            reply_count: self.reply_count.max(incoming.reply_count),
        }
    }
}

/// Author profile, filled opportunistically from partial upstream data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorProfile {
    pub id: i64,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl AuthorProfile {
    /// Coalesce merge: incoming nulls never clobber stored values
    pub fn merged_with(&self, incoming: &AuthorProfile) -> AuthorProfile {
        AuthorProfile {
            id: self.id,
            handle: incoming.handle.clone().or_else(|| self.handle.clone()),
            display_name: incoming
                .display_name
                .clone()
                .or_else(|| self.display_name.clone()),
            avatar_url: incoming.avatar_url.clone().or_else(|| self.avatar_url.clone()),
        }
    }

    /// Collapses duplicate ids within one batch, coalescing in arrival order
    pub fn collapse(authors: &[AuthorProfile]) -> Vec<AuthorProfile> {
        let mut order: Vec<i64> = Vec::new();
        let mut by_id: std::collections::HashMap<i64, AuthorProfile> = std::collections::HashMap::new();
        for author in authors {
            match by_id.get_mut(&author.id) {
                Some(existing) => *existing = existing.merged_with(author),
                None => {
                    order.push(author.id);
                    by_id.insert(author.id, author.clone());
                }
            }
        }
        order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
    }
}

/// Ranking metric for the leaderboard read path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderboardMetric {
    Likes,
    #[default]
    Replies,
    Recasts,
    Score,
}

impl LeaderboardMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Likes => "likes",
            Self::Replies => "replies",
            Self::Recasts => "recasts",
            Self::Score => "score",
        }
    }

    /// Parses untrusted input, falling back to the default metric
    pub fn parse_or_default(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }

    /// Sort key of an entry under this metric
    pub fn value_of(&self, item: &ContentItem) -> i64 {
        match self {
            Self::Likes => item.like_count,
            Self::Replies => item.reply_count,
            Self::Recasts => item.recast_count,
            Self::Score => item.engagement_score(),
        }
    }
}

impl FromStr for LeaderboardMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "likes" => Ok(Self::Likes),
            "replies" => Ok(Self::Replies),
            "recasts" => Ok(Self::Recasts),
            "score" => Ok(Self::Score),
            other => Err(format!("unknown leaderboard metric: {other}")),
        }
    }
}

impl fmt::Display for LeaderboardMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leaderboard row joined with its (possibly missing) author
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    #[serde(flatten)]
    pub item: ContentItem,
    pub score: i64,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl LeaderboardEntry {
    pub fn new(item: ContentItem, author: Option<&AuthorProfile>) -> Self {
        let score = item.engagement_score();
        Self {
            item,
            score,
            handle: author.and_then(|a| a.handle.clone()),
            display_name: author.and_then(|a| a.display_name.clone()),
            avatar_url: author.and_then(|a| a.avatar_url.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn item(likes: i64, recasts: i64, replies: i64) -> ContentItem {
        ContentItem {
            id: "0xabc".to_string(),
            author_id: Some(1),
            body: "gm".to_string(),
            channel: None,
            published_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            like_count: likes,
            recast_count: recasts,
            reply_count: replies,
        }
    }

    #[test]
    fn test_engagement_score_weights() {
        assert_eq!(engagement_score(1, 0, 0), 1);
        assert_eq!(engagement_score(0, 1, 0), 3);
        assert_eq!(engagement_score(0, 0, 1), 10);
        assert_eq!(item(7, 2, 3).engagement_score(), 7 + 6 + 30);
    }

    #[test]
    fn test_content_merge_keeps_counter_maximum() {
        let stored = item(50, 10, 5);
        let mut incoming = item(20, 12, 0);
        incoming.body = "edited".to_string();
        incoming.channel = Some("base".to_string());

        let merged = stored.merged_with(&incoming);
        assert_eq!(merged.like_count, 50);
        assert_eq!(merged.recast_count, 12);
        assert_eq!(merged.reply_count, 5);
        assert_eq!(merged.body, "edited");
        assert_eq!(merged.channel.as_deref(), Some("base"));
    }

    #[test]
    fn test_author_coalesce_merge() {
        let stored = AuthorProfile {
            id: 3,
            handle: Some("dwr".to_string()),
            display_name: Some("Dan".to_string()),
            avatar_url: None,
        };
        let incoming = AuthorProfile {
            id: 3,
            handle: None,
            display_name: Some("Dan R".to_string()),
            avatar_url: Some("https://img/pfp.png".to_string()),
        };

        let merged = stored.merged_with(&incoming);
        assert_eq!(merged.handle.as_deref(), Some("dwr"));
        assert_eq!(merged.display_name.as_deref(), Some("Dan R"));
        assert_eq!(merged.avatar_url.as_deref(), Some("https://img/pfp.png"));
    }

    #[test]
    fn test_collapse_duplicate_authors() {
        let authors = vec![
            AuthorProfile { id: 1, handle: Some("a".into()), display_name: None, avatar_url: None },
            AuthorProfile { id: 2, handle: Some("b".into()), display_name: None, avatar_url: None },
            AuthorProfile { id: 1, handle: None, display_name: Some("A".into()), avatar_url: None },
        ];
        let collapsed = AuthorProfile::collapse(&authors);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].id, 1);
        assert_eq!(collapsed[0].handle.as_deref(), Some("a"));
        assert_eq!(collapsed[0].display_name.as_deref(), Some("A"));
    }

    #[test]
    fn test_metric_parse_falls_back_to_replies() {
        assert_eq!(LeaderboardMetric::parse_or_default("LIKES"), LeaderboardMetric::Likes);
        assert_eq!(LeaderboardMetric::parse_or_default("score"), LeaderboardMetric::Score);
        assert_eq!(
            LeaderboardMetric::parse_or_default("likes; drop table top_casts"),
            LeaderboardMetric::Replies
        );
        assert_eq!(LeaderboardMetric::parse_or_default(""), LeaderboardMetric::Replies);
    }

    #[test]
    fn test_floor_to_minute() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 34, 56).unwrap() + Duration::milliseconds(789);
        assert_eq!(floor_to_minute(ts), Utc.with_ymd_and_hms(2024, 5, 1, 12, 34, 0).unwrap());
    }

    #[test]
    fn test_window_slices_oldest_first() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + Duration::hours(5));
        let slices = window.slices(Duration::hours(2));

        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0], TimeWindow::new(start, start + Duration::hours(2)));
        assert_eq!(slices[2], TimeWindow::new(start + Duration::hours(4), start + Duration::hours(5)));
        assert!(window.contains(start));
        assert!(window.contains(start + Duration::hours(5)));
        assert!(!window.contains(start - Duration::seconds(1)));
    }

    #[test]
    fn test_state_update_never_retracts_watermark() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let existing = IngestState {
            last_seen_timestamp: Some(now),
            last_run_at: now - Duration::hours(1),
        };

        let older = IngestStateUpdate::advance(Some(now - Duration::hours(3)), now);
        let merged = older.merge_into(Some(&existing), now);
        assert_eq!(merged.last_seen_timestamp, Some(now));
        assert_eq!(merged.last_run_at, now);

        let claim = IngestStateUpdate::claim_run(now + Duration::minutes(1));
        let merged = claim.merge_into(Some(&existing), now);
        assert_eq!(merged.last_seen_timestamp, Some(now));
        assert_eq!(merged.last_run_at, now + Duration::minutes(1));

        let fresh = IngestStateUpdate::claim_run(now).merge_into(None, now);
        assert_eq!(fresh.last_seen_timestamp, None);
    }
}
