//! Postgres-backed [`Store`]
//!
//! Multi-row upserts are built with `QueryBuilder::push_values` and chunked to
//! stay under the bind-parameter limit. All statements are runtime-checked so
//! building the crate never needs a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use super::{clamp_top_limit, schema, Store};
use crate::error::Result;
use crate::models::{
    AuthorProfile, ContentItem, IngestState, IngestStateUpdate, LeaderboardEntry,
    LeaderboardMetric, INGEST_STATE_ID,
};

/// Rows per INSERT; 8 binds per content row keeps this well under 65535
const UPSERT_CHUNK: usize = 1000;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Storage initialized");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        schema::migrate(&self.pool).await
    }
}

/// Sort expression for a metric; never built from caller input
fn order_column(metric: LeaderboardMetric) -> &'static str {
    match metric {
        LeaderboardMetric::Likes => "t.likes",
        LeaderboardMetric::Replies => "t.replies",
        LeaderboardMetric::Recasts => "t.recasts",
        LeaderboardMetric::Score => "score",
    }
}

fn top_content_sql(metric: LeaderboardMetric) -> String {
    format!(
        r#"
        SELECT
            t.cast_hash, t.fid, t.text, t.channel, t.timestamp,
            t.likes, t.recasts, t.replies,
            (t.replies * 10 + t.recasts * 3 + t.likes) AS score,
            u.username, u.display_name, u.pfp_url
        FROM top_casts t
        LEFT JOIN users u ON u.fid = t.fid
        WHERE t.timestamp >= $1
        ORDER BY {} DESC, t.timestamp DESC
        LIMIT $2
        "#,
        order_column(metric)
    )
}

fn entry_from_row(row: &PgRow) -> std::result::Result<LeaderboardEntry, sqlx::Error> {
    Ok(LeaderboardEntry {
        item: ContentItem {
            id: row.try_get("cast_hash")?,
            author_id: row.try_get("fid")?,
            body: row.try_get("text")?,
            channel: row.try_get("channel")?,
            published_at: row.try_get("timestamp")?,
            like_count: row.try_get("likes")?,
            recast_count: row.try_get("recasts")?,
            reply_count: row.try_get("replies")?,
        },
        score: row.try_get("score")?,
        handle: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        avatar_url: row.try_get("pfp_url")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn get_ingest_state(&self) -> Result<Option<IngestState>> {
        let row = sqlx::query("SELECT last_ts, updated_at FROM ingest_state WHERE id = $1")
            .bind(INGEST_STATE_ID)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => Some(IngestState {
                last_seen_timestamp: row.try_get("last_ts")?,
                last_run_at: row.try_get("updated_at")?,
            }),
            None => None,
        })
    }

    async fn upsert_ingest_state(&self, update: IngestStateUpdate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_state (id, last_ts, updated_at)
            VALUES ($1, $2, COALESCE($3, NOW()))
            ON CONFLICT (id) DO UPDATE SET
                last_ts = GREATEST(ingest_state.last_ts, EXCLUDED.last_ts),
                updated_at = COALESCE($3, ingest_state.updated_at)
            "#,
        )
        .bind(INGEST_STATE_ID)
        .bind(update.last_seen_timestamp)
        .bind(update.last_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn existing_content_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let found: Vec<String> =
            sqlx::query_scalar("SELECT cast_hash FROM top_casts WHERE cast_hash = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(found.into_iter().collect())
    }

    async fn upsert_content_items(&self, items: &[ContentItem]) -> Result<usize> {
        for chunk in items.chunks(UPSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO top_casts (cast_hash, fid, text, channel, timestamp, likes, recasts, replies) ",
            );
            builder.push_values(chunk, |mut b, item| {
                b.push_bind(&item.id)
                    .push_bind(item.author_id)
                    .push_bind(&item.body)
                    .push_bind(&item.channel)
                    .push_bind(item.published_at)
                    .push_bind(item.like_count)
                    .push_bind(item.recast_count)
                    .push_bind(item.reply_count);
            });
            builder.push(
                r#"
                ON CONFLICT (cast_hash) DO UPDATE SET
                    fid = EXCLUDED.fid,
                    text = EXCLUDED.text,
                    channel = EXCLUDED.channel,
                    timestamp = EXCLUDED.timestamp,
                    likes = GREATEST(EXCLUDED.likes, top_casts.likes),
                    recasts = GREATEST(EXCLUDED.recasts, top_casts.recasts),
                    replies = GREATEST(EXCLUDED.replies, top_casts.replies),
                    updated_at = NOW()
                "#,
            );
            builder.build().execute(&self.pool).await?;
        }

        debug!(count = items.len(), "Upserted content rows");
        Ok(items.len())
    }

    async fn upsert_authors(&self, authors: &[AuthorProfile]) -> Result<usize> {
        // ON CONFLICT cannot touch the same row twice in one statement
        let authors = AuthorProfile::collapse(authors);

        for chunk in authors.chunks(UPSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO users (fid, username, display_name, pfp_url) ");
            builder.push_values(chunk, |mut b, author| {
                b.push_bind(author.id)
                    .push_bind(&author.handle)
                    .push_bind(&author.display_name)
                    .push_bind(&author.avatar_url);
            });
            builder.push(
                r#"
                ON CONFLICT (fid) DO UPDATE SET
                    username = COALESCE(EXCLUDED.username, users.username),
                    display_name = COALESCE(EXCLUDED.display_name, users.display_name),
                    pfp_url = COALESCE(EXCLUDED.pfp_url, users.pfp_url),
                    updated_at = NOW()
                "#,
            );
            builder.build().execute(&self.pool).await?;
        }

        debug!(count = authors.len(), "Upserted authors");
        Ok(authors.len())
    }

    async fn query_top_content(
        &self,
        metric: LeaderboardMetric,
        window_start: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LeaderboardEntry>> {
        let rows = sqlx::query(&top_content_sql(metric))
            .bind(window_start)
            .bind(i64::from(clamp_top_limit(limit)))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(entry_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn health_check(&self) -> Result<DateTime<Utc>> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn cast(likes: i64, recasts: i64, replies: i64) -> ContentItem {
        ContentItem {
            id: "0xabc".to_string(),
            author_id: Some(7),
            body: "gm".to_string(),
            channel: None,
            published_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            like_count: likes,
            recast_count: recasts,
            reply_count: replies,
        }
    }

    // Run with DATABASE_URL set: cargo test -- --ignored
    #[sqlx::test(migrations = false)]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn test_merge_upserts_against_postgres(pool: PgPool) {
        let store = PgStore { pool };
        store.migrate().await.unwrap();

        store.upsert_content_items(&[cast(50, 5, 5)]).await.unwrap();
        store.upsert_content_items(&[cast(20, 9, 0)]).await.unwrap();

        store
            .upsert_authors(&[AuthorProfile {
                id: 7,
                handle: Some("alice".into()),
                display_name: Some("Alice".into()),
                avatar_url: None,
            }])
            .await
            .unwrap();
        store
            .upsert_authors(&[AuthorProfile {
                id: 7,
                handle: None,
                display_name: None,
                avatar_url: Some("https://img/a.png".into()),
            }])
            .await
            .unwrap();

        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let top = store
            .query_top_content(LeaderboardMetric::Likes, start, 10)
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        let entry = &top[0];
        assert_eq!(
            (entry.item.like_count, entry.item.recast_count, entry.item.reply_count),
            (50, 9, 5)
        );
        assert_eq!(entry.score, 5 * 10 + 9 * 3 + 50);
        assert_eq!(entry.handle.as_deref(), Some("alice"));
        assert_eq!(entry.display_name.as_deref(), Some("Alice"));
        assert_eq!(entry.avatar_url.as_deref(), Some("https://img/a.png"));

        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        store
            .upsert_ingest_state(IngestStateUpdate::advance(Some(t), t))
            .await
            .unwrap();
        store
            .upsert_ingest_state(IngestStateUpdate::advance(Some(t - ChronoDuration::hours(2)), t))
            .await
            .unwrap();
        let state = store.get_ingest_state().await.unwrap().unwrap();
        assert_eq!(state.last_seen_timestamp, Some(t));
    }

    #[test]
    fn test_order_column_is_whitelisted() {
        for metric in [
            LeaderboardMetric::Likes,
            LeaderboardMetric::Replies,
            LeaderboardMetric::Recasts,
            LeaderboardMetric::Score,
        ] {
            let sql = top_content_sql(metric);
            assert!(sql.contains(&format!("ORDER BY {} DESC", order_column(metric))));
        }

        let hostile = LeaderboardMetric::parse_or_default("likes desc; drop table users");
        assert_eq!(order_column(hostile), "t.replies");
    }
}
