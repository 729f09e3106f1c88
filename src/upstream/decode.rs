//! Tolerant decoding of upstream responses
//!
//! The API is documented but inconsistent: payloads may or may not be wrapped
//! in a `result` object, casts may arrive as `casts` or `messages`, the cursor
//! may be `next.cursor` or `cursor`, and avatars live under one of three keys.
//! All of that is resolved here, once.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{AuthorRef, ContentDetail, ContentSummary, SearchPage};
use crate::error::Result;

#[derive(Debug, Default, Deserialize)]
struct RawCast {
    hash: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    author: Option<RawAuthor>,
    #[serde(default)]
    channel: Option<RawChannel>,
    #[serde(default)]
    reactions: Option<RawReactions>,
    #[serde(default)]
    replies: Option<RawReplies>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuthor {
    #[serde(default)]
    fid: Option<Value>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    pfp_url: Option<String>,
    #[serde(default)]
    pfp: Option<RawPfp>,
    #[serde(default)]
    profile: Option<RawProfile>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPfp {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProfile {
    #[serde(default)]
    pfp_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawChannel {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReactions {
    #[serde(default)]
    likes_count: Option<i64>,
    #[serde(default)]
    recasts_count: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReplies {
    #[serde(default)]
    count: Option<i64>,
}

impl RawAuthor {
    fn into_ref(self) -> AuthorRef {
        let avatar_url = self
            .pfp_url
            .or_else(|| self.pfp.and_then(|p| p.url))
            .or_else(|| self.profile.and_then(|p| p.pfp_url));
        AuthorRef {
            // Only numeric ids are accepted
            id: self.fid.as_ref().and_then(Value::as_i64),
            handle: self.username,
            display_name: self.display_name,
            avatar_url,
        }
    }
}

impl RawCast {
    fn into_summary(self) -> (ContentSummary, Option<RawReactions>, Option<RawReplies>) {
        let summary = ContentSummary {
            id: self.hash,
            author: self.author.map(RawAuthor::into_ref),
            body: self.text.unwrap_or_default(),
            channel: self.channel.and_then(|c| c.id),
            published_at: self.timestamp.as_deref().and_then(parse_timestamp),
        };
        (summary, self.reactions, self.replies)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Unwraps the optional `result` envelope
fn envelope(value: &Value) -> &Value {
    match value.get("result") {
        Some(inner) if inner.is_object() => inner,
        _ => value,
    }
}

/// Decodes each element on its own; malformed casts are skipped
fn decode_casts(items: Option<&Value>) -> Vec<RawCast> {
    let Some(items) = items.and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match RawCast::deserialize(item) {
            Ok(cast) if !cast.hash.is_empty() => Some(cast),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Skipping undecodable cast");
                None
            }
        })
        .collect()
}

/// Decodes a `cast/search` response body
pub fn decode_search_page(body: &str) -> Result<SearchPage> {
    let value: Value = serde_json::from_str(body)?;
    let result = envelope(&value);

    let items_value = match result.get("casts") {
        Some(v) if v.is_array() => Some(v),
        _ => result.get("messages"),
    };

    let items = decode_casts(items_value)
        .into_iter()
        .map(|cast| cast.into_summary().0)
        .collect();

    let next_cursor = result
        .pointer("/next/cursor")
        .and_then(Value::as_str)
        .or_else(|| result.get("cursor").and_then(Value::as_str))
        .filter(|c| !c.is_empty())
        .map(String::from);

    Ok(SearchPage { items, next_cursor })
}

/// Decodes a bulk `casts` response body
pub fn decode_details(body: &str) -> Result<Vec<ContentDetail>> {
    let value: Value = serde_json::from_str(body)?;
    let result = envelope(&value);

    Ok(decode_casts(result.get("casts"))
        .into_iter()
        .map(|cast| {
            let (summary, reactions, replies) = cast.into_summary();
            let reactions = reactions.unwrap_or_default();
            ContentDetail {
                summary,
                like_count: reactions.likes_count.unwrap_or(0).max(0),
                recast_count: reactions.recasts_count.unwrap_or(0).max(0),
                reply_count: replies.and_then(|r| r.count).unwrap_or(0).max(0),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_search_page_with_result_envelope() {
        let body = json!({
            "result": {
                "casts": [{
                    "hash": "0x01",
                    "text": "gm",
                    "timestamp": "2024-05-01T12:00:00.000Z",
                    "author": {"fid": 3, "username": "dwr", "display_name": "Dan", "pfp_url": "https://a/p.png"},
                    "channel": {"id": "farcaster"}
                }],
                "next": {"cursor": "abc"}
            }
        })
        .to_string();

        let page = decode_search_page(&body).unwrap();
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
        assert_eq!(page.items.len(), 1);

        let item = &page.items[0];
        assert_eq!(item.id, "0x01");
        assert_eq!(item.body, "gm");
        assert_eq!(item.channel.as_deref(), Some("farcaster"));
        assert_eq!(item.published_at, Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        assert_eq!(item.author_id(), Some(3));
        assert_eq!(item.author.as_ref().unwrap().avatar_url.as_deref(), Some("https://a/p.png"));
    }

    #[test]
    fn test_search_page_without_envelope_uses_messages_and_flat_cursor() {
        let body = json!({
            "messages": [{"hash": "0x02", "author": {"fid": 9, "pfp": {"url": "https://b/p.png"}}}],
            "cursor": "next-1"
        })
        .to_string();

        let page = decode_search_page(&body).unwrap();
        assert_eq!(page.next_cursor.as_deref(), Some("next-1"));
        assert_eq!(page.items[0].id, "0x02");
        assert_eq!(page.items[0].body, "");
        assert_eq!(page.items[0].published_at, None);
        assert_eq!(
            page.items[0].author.as_ref().unwrap().avatar_url.as_deref(),
            Some("https://b/p.png")
        );
    }

    #[test]
    fn test_malformed_casts_are_skipped() {
        let body = json!({
            "casts": [
                {"text": "no hash"},
                {"hash": "", "text": "empty hash"},
                {"hash": "0x03", "author": {"fid": "not-a-number", "profile": {"pfp_url": "https://c"}}}
            ],
            "next": {"cursor": ""}
        })
        .to_string();

        let page = decode_search_page(&body).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].author_id(), None);
        assert_eq!(
            page.items[0].author.as_ref().unwrap().avatar_url.as_deref(),
            Some("https://c")
        );
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_details_counters_default_to_zero() {
        let body = json!({
            "result": {
                "casts": [
                    {"hash": "0x01", "reactions": {"likes_count": 12, "recasts_count": 4}, "replies": {"count": 2}},
                    {"hash": "0x02"}
                ]
            }
        })
        .to_string();

        let details = decode_details(&body).unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(
            (details[0].like_count, details[0].recast_count, details[0].reply_count),
            (12, 4, 2)
        );
        assert_eq!(
            (details[1].like_count, details[1].recast_count, details[1].reply_count),
            (0, 0, 0)
        );
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(decode_search_page("<html>bad gateway</html>").is_err());
    }
}
