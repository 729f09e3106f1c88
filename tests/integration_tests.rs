//! Integration Tests for the ingestion service
//!
//! Uses wiremock for the upstream API and the in-memory store.
//! Run with: cargo test --test integration_tests

use std::sync::Arc;

use castboard_ingest::config::Config;
use castboard_ingest::http_client::{HttpClientConfig, RateLimitedClient};
use castboard_ingest::models::LeaderboardMetric;
use castboard_ingest::orchestrator::{IngestRequest, Orchestrator, RunOutcome};
use castboard_ingest::rate_limiter::SlidingWindowLimiter;
use castboard_ingest::server::{self, AppState};
use castboard_ingest::storage::{MemoryStore, Store};
use castboard_ingest::upstream::mock::{detail, summary, MockUpstream};
use castboard_ingest::upstream::neynar::NeynarClient;
use chrono::{Duration, SecondsFormat, Utc};
use http_body_util::BodyExt;
use hyper::{Request, StatusCode};
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "integration-token";

fn config(api_url: &str) -> Config {
    let mut builder = config::Config::builder();
    for (key, value) in [
        ("neynar_api_key", "test-key"),
        ("neynar_api_url", api_url),
        ("storage_type", "memory"),
        ("ingest_token", TOKEN),
        ("page_delay_ms", "0"),
        ("retry_base_ms", "10"),
        ("metrics_enabled", "true"),
    ] {
        builder = builder.set_override(key, value).unwrap();
    }
    builder.build().unwrap().try_deserialize().unwrap()
}

fn neynar(server: &MockServer, config: &Config) -> NeynarClient {
    let http = RateLimitedClient::new(
        HttpClientConfig::from_config(config),
        Arc::new(SlidingWindowLimiter::per_minute(config.rate_limit_rpm)),
    )
    .unwrap();
    NeynarClient::new(Arc::new(http), &server.uri(), "test-key".to_string())
}

fn cast_json(hash: &str, fid: i64, minutes_ago: i64, likes: i64, recasts: i64, replies: i64) -> Value {
    let ts = (Utc::now() - Duration::minutes(minutes_ago)).to_rfc3339_opts(SecondsFormat::Millis, true);
    json!({
        "hash": hash,
        "text": format!("cast {hash}"),
        "timestamp": ts,
        "author": {
            "fid": fid,
            "username": format!("user{fid}"),
            "display_name": format!("User {fid}"),
            "pfp": {"url": format!("https://img.example/{fid}.png")}
        },
        "channel": {"id": "dev"},
        "reactions": {"likes_count": likes, "recasts_count": recasts},
        "replies": {"count": replies}
    })
}

async fn body_json(response: hyper::Response<http_body_util::Full<hyper::body::Bytes>>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Full run against a mocked Neynar API
#[tokio::test]
async fn test_incremental_run_against_http_upstream() {
    let server = MockServer::start().await;
    let config = Arc::new(config(&server.uri()));

    Mock::given(method("GET"))
        .and(path("/cast/search"))
        .and(header("x-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": {
                "casts": [
                    cast_json("0xaa", 1, 5, 0, 0, 0),
                    cast_json("0xbb", 2, 10, 0, 0, 0)
                ],
                "next": {"cursor": null}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/casts"))
        .and(query_param("casts", "0xaa,0xbb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": {
                "casts": [
                    cast_json("0xaa", 1, 5, 10, 2, 4),
                    cast_json("0xbb", 2, 10, 1, 0, 9)
                ]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        Arc::new(neynar(&server, &config)),
        store.clone(),
        config.clone(),
    );

    let outcome = orchestrator.run(IngestRequest::incremental()).await;
    let summary = match outcome {
        RunOutcome::Completed(summary) => summary,
        other => panic!("unexpected outcome: {other:?}"),
    };

    assert_eq!(summary.unique, 2);
    assert_eq!(summary.upserted, 2);
    assert_eq!(summary.search_requests, 1);
    assert_eq!(summary.bulk_requests, 1);
    assert!(summary.watermark.is_some());

    let stored = store.content_item("0xaa").unwrap();
    assert_eq!((stored.like_count, stored.recast_count, stored.reply_count), (10, 2, 4));
    assert_eq!(stored.channel.as_deref(), Some("dev"));

    let author = store.author(2).unwrap();
    assert_eq!(author.handle.as_deref(), Some("user2"));
    assert_eq!(author.avatar_url.as_deref(), Some("https://img.example/2.png"));

    let top = store
        .query_top_content(LeaderboardMetric::Replies, Utc::now() - Duration::hours(1), 15)
        .await
        .unwrap();
    let ids: Vec<_> = top.iter().map(|e| e.item.id.as_str()).collect();
    assert_eq!(ids, vec!["0xbb", "0xaa"]);

    // A second run right away is throttled and makes no calls
    let second = orchestrator.run(IngestRequest::incremental()).await;
    assert!(matches!(second, RunOutcome::Skipped { .. }));
}

#[tokio::test]
async fn test_search_retries_after_429() {
    let server = MockServer::start().await;
    let config = config(&server.uri());

    Mock::given(method("GET"))
        .and(path("/cast/search"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cast/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"casts": []})))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        Arc::new(neynar(&server, &config)),
        store.clone(),
        Arc::new(config),
    );

    let outcome = orchestrator
        .run(IngestRequest {
            pages: Some(1),
            ..IngestRequest::backfill(2)
        })
        .await;
    assert!(matches!(outcome, RunOutcome::Completed(_)), "{outcome:?}");

    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() >= 2);
    assert_eq!(store.content_count(), 0);
}

fn app_state() -> (Arc<AppState>, Arc<MemoryStore>) {
    let now = Utc::now();
    let hits = vec![
        summary("0x01", Some(1), now - Duration::minutes(3)),
        summary("0x02", Some(2), now - Duration::minutes(4)),
    ];
    let details = vec![detail(&hits[0], 5, 1, 0), detail(&hits[1], 0, 0, 7)];
    let api = MockUpstream::new().with_pages(vec![hits]).with_details(details);

    let config = Arc::new(config("http://127.0.0.1:9"));
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(Arc::new(api), store.clone(), config.clone());
    (Arc::new(AppState::new(orchestrator, config)), store)
}

fn get(uri: &str) -> Request<()> {
    Request::builder().uri(uri).body(()).unwrap()
}

#[tokio::test]
async fn test_ingest_route_requires_identity() {
    let (state, store) = app_state();

    let response = server::handle(get("/api/ingest"), state.clone()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = server::handle(get("/api/ingest?token=wrong&hours=abc"), state.clone()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(store.content_count(), 0);

    let response = server::handle(get(&format!("/api/ingest?token={TOKEN}&hours=abc")), state.clone()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server::handle(get(&format!("/api/ingest?token={TOKEN}&hours=500")), state.clone()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server::handle(get(&format!("/api/ingest?token={TOKEN}&mode=slices")), state).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.content_count(), 0);
}

#[tokio::test]
async fn test_ingest_then_top_routes() {
    let (state, store) = app_state();

    let request = Request::builder()
        .method("POST")
        .uri("/api/ingest")
        .header("x-vercel-cron", "1")
        .body(())
        .unwrap();
    let response = server::handle(request, state.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["upserted"], 2);
    assert_eq!(store.content_count(), 2);

    let response = server::handle(get("/api/ingest?token=integration-token"), state.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["skipped"], true);
    assert_eq!(body["reason"], "too_soon");

    let response = server::handle(get("/api/top?by=replies&limit=1&hours=1"), state.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["orderBy"], "replies");
    assert_eq!(body["hours"], 1);
    assert_eq!(body["count"], 1);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    let response = server::handle(get("/api/top?limit=0"), state).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_metrics_and_unknown_routes() {
    let (state, _) = app_state();

    let response = server::handle(get("/health"), state.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["env"]["NEYNAR_API_KEY"], "set");
    assert_eq!(body["env"]["DATABASE_URL"], "missing");

    let response = server::handle(get("/metrics"), state.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = server::handle(get("/api/nope"), state).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Serves over a real socket and stops on shutdown
#[tokio::test]
async fn test_server_accepts_connections() {
    let (state, _) = app_state();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(server::serve(listener, state, async {
        let _ = stop_rx.await;
    }));

    let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

/// A caller that gives up does not cancel a run that already claimed its slot
#[tokio::test]
async fn test_run_survives_client_disconnect_and_drains_on_shutdown() {
    let upstream = MockServer::start().await;
    let config = Arc::new(config(&upstream.uri()));

    Mock::given(method("GET"))
        .and(path("/cast/search"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"casts": [cast_json("0xcc", 3, 2, 0, 0, 0)]}))
                .set_delay(std::time::Duration::from_millis(500)),
        )
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/casts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "casts": [cast_json("0xcc", 3, 2, 4, 1, 2)]
        })))
        .mount(&upstream)
        .await;

    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        Arc::new(neynar(&upstream, &config)),
        store.clone(),
        config.clone(),
    );
    let state = Arc::new(AppState::new(orchestrator, config));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(server::serve(listener, state, async {
        let _ = stop_rx.await;
    }));

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(100))
        .build()
        .unwrap();
    let result = client
        .get(format!("http://{addr}/api/ingest?token={TOKEN}"))
        .send()
        .await;
    assert!(result.is_err());

    // Wait until the run has reached the upstream, then shut down mid-run
    for _ in 0..50 {
        if !upstream.received_requests().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    stop_tx.send(()).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(10), server_task)
        .await
        .expect("server did not drain in time")
        .unwrap()
        .unwrap();

    let paths: Vec<String> = upstream
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert!(paths.contains(&"/casts".to_string()), "{paths:?}");

    let stored = store.content_item("0xcc").unwrap();
    assert_eq!((stored.like_count, stored.recast_count, stored.reply_count), (4, 1, 2));
    let ingest_state = store.get_ingest_state().await.unwrap().unwrap();
    assert!(ingest_state.last_seen_timestamp.is_some());
}
