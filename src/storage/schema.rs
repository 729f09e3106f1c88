//! Postgres schema for the leaderboard store

use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

/// Idempotent DDL, one statement per entry
pub const SCHEMA: &[&str] = &[
    // users: author profiles, coalesce-merged
    r#"
    CREATE TABLE IF NOT EXISTS users (
        fid BIGINT PRIMARY KEY,
        username TEXT,
        display_name TEXT,
        pfp_url TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // top_casts: one row per cast hash, counters only grow
    r#"
    CREATE TABLE IF NOT EXISTS top_casts (
        cast_hash TEXT PRIMARY KEY,
        fid BIGINT,
        text TEXT NOT NULL DEFAULT '',
        channel TEXT,
        timestamp TIMESTAMPTZ NOT NULL,
        likes BIGINT NOT NULL DEFAULT 0,
        recasts BIGINT NOT NULL DEFAULT 0,
        replies BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_top_casts_timestamp ON top_casts (timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_top_casts_fid ON top_casts (fid)",
    // ingest_state: singleton watermark row keyed by 'casts'
    r#"
    CREATE TABLE IF NOT EXISTS ingest_state (
        id TEXT PRIMARY KEY,
        last_ts TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

/// Creates tables and indexes if they do not exist
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "Schema is up to date");
    Ok(())
}
