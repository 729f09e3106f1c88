//! HTTP trigger surface
//!
//! Routes:
//! - `GET|POST /api/ingest` runs one ingestion pass
//! - `GET /api/top` reads the leaderboard
//! - `GET /health` reports key presence and the store clock
//! - `GET /metrics` exposes Prometheus metrics

use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, USER_AGENT};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use validator::Validate;

use crate::config::Config;
use crate::error::{IngestionError, Result};
use crate::metrics::gather_metrics;
use crate::models::LeaderboardMetric;
use crate::orchestrator::{authorize, IngestRequest, Orchestrator, RunOutcome, TriggerCredentials};

const CRON_HEADER: &str = "x-vercel-cron";
const TOKEN_HEADER: &str = "x-ingest-token";

/// Shared state behind every connection
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub config: Arc<Config>,
    pub runs: RunTracker,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, config: Arc<Config>) -> Self {
        Self {
            orchestrator,
            config,
            runs: RunTracker::new(),
        }
    }
}

/// Counts ingestion runs that outlive the request which started them.
///
/// Runs are spawned detached, so a caller that disconnects does not cancel
/// a run after it has claimed its slot. Shutdown waits on [`drained`].
///
/// [`drained`]: RunTracker::drained
#[derive(Clone)]
pub struct RunTracker {
    active: Arc<watch::Sender<usize>>,
}

struct RunGuard(Arc<watch::Sender<usize>>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            active: Arc::new(active),
        }
    }

    pub fn spawn<F>(&self, run: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.active.send_modify(|n| *n += 1);
        let guard = RunGuard(self.active.clone());
        tokio::spawn(async move {
            let _guard = guard;
            run.await
        })
    }

    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Resolves once no tracked run is in flight
    pub async fn drained(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Leaderboard query parameters
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct TopParams {
    pub by: LeaderboardMetric,
    #[validate(range(min = 1, max = 50))]
    pub limit: u32,
    #[validate(range(min = 1, max = 168))]
    pub hours: u32,
}

impl Default for TopParams {
    fn default() -> Self {
        Self {
            by: LeaderboardMetric::default(),
            limit: 15,
            hours: 24,
        }
    }
}

type Params = HashMap<String, String>;

fn query_params<B>(req: &Request<B>) -> Params {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn header<B>(req: &Request<B>, name: impl hyper::header::AsHeaderName) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn flag(params: &Params, name: &str) -> bool {
    params
        .get(name)
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn parse_number(params: &Params, name: &str) -> Result<Option<u32>> {
    match params.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|_| IngestionError::InvalidInput(format!("{name} must be a non-negative integer"))),
    }
}

/// Reads the identity proof from headers and the `token` parameter
pub fn credentials<B>(req: &Request<B>, params: &Params) -> TriggerCredentials {
    TriggerCredentials {
        cron_header: header(req, CRON_HEADER),
        user_agent: header(req, USER_AGENT),
        token: params
            .get("token")
            .filter(|t| !t.is_empty())
            .cloned()
            .or_else(|| header(req, TOKEN_HEADER)),
    }
}

pub fn ingest_request(params: &Params) -> Result<IngestRequest> {
    Ok(IngestRequest {
        hours: parse_number(params, "hours")?.unwrap_or(0),
        force: flag(params, "force"),
        include_existing: flag(params, "include_existing") || flag(params, "includeExisting"),
        slices: params
            .get("mode")
            .is_some_and(|m| m.eq_ignore_ascii_case("slices")),
        query: params.get("q").filter(|q| !q.trim().is_empty()).cloned(),
        pages: parse_number(params, "pages")?,
    })
}

pub fn top_params(params: &Params) -> Result<TopParams> {
    let defaults = TopParams::default();
    let top = TopParams {
        by: params
            .get("by")
            .map(|raw| LeaderboardMetric::parse_or_default(raw))
            .unwrap_or_default(),
        limit: parse_number(params, "limit")?.unwrap_or(defaults.limit),
        hours: parse_number(params, "hours")?.unwrap_or(defaults.hours),
    };
    top.validate()
        .map_err(|e| IngestionError::InvalidInput(e.to_string()))?;
    Ok(top)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = match serde_json::to_vec(body) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed");
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(
        json!({ "error": message }).to_string(),
    )));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn status_for(error: &IngestionError) -> StatusCode {
    match error {
        IngestionError::Forbidden => StatusCode::FORBIDDEN,
        IngestionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Method, path and query of a request, read before any await
struct Call {
    method: Method,
    path: String,
    params: Params,
    credentials: TriggerCredentials,
}

impl Call {
    fn from_request<B>(req: &Request<B>) -> Self {
        let params = query_params(req);
        let credentials = credentials(req, &params);
        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            params,
            credentials,
        }
    }
}

async fn handle_ingest(call: &Call, state: &Arc<AppState>) -> Response<Full<Bytes>> {
    let credentials = call.credentials.clone();

    // Authorization comes before any parameter parsing
    if let Err(e) = authorize(&credentials, &state.config.ingest_token) {
        info!(
            user_agent = credentials.user_agent.as_deref().unwrap_or(""),
            has_token = credentials.token.is_some(),
            "Ingest forbidden"
        );
        return error_response(status_for(&e), &e.to_string());
    }

    let request = match ingest_request(&call.params) {
        Ok(request) => request,
        Err(e) => return error_response(status_for(&e), &e.to_string()),
    };

    let run_state = state.clone();
    let run = state.runs.spawn(async move {
        run_state.orchestrator.trigger(&credentials, request).await
    });

    match run.await {
        Ok(Ok(outcome @ RunOutcome::Failed { .. })) => {
            json_response(StatusCode::INTERNAL_SERVER_ERROR, &outcome)
        }
        Ok(Ok(outcome)) => json_response(StatusCode::OK, &outcome),
        Ok(Err(e)) => error_response(status_for(&e), &e.to_string()),
        Err(e) => {
            error!(error = %e, "Ingest task aborted");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "ingest task aborted")
        }
    }
}

async fn handle_top(call: &Call, state: &AppState) -> Response<Full<Bytes>> {
    let params = match top_params(&call.params) {
        Ok(params) => params,
        Err(e) => return error_response(status_for(&e), &e.to_string()),
    };

    let window_start = Utc::now() - ChronoDuration::hours(i64::from(params.hours));
    match state
        .orchestrator
        .store()
        .query_top_content(params.by, window_start, params.limit)
        .await
    {
        Ok(items) => json_response(
            StatusCode::OK,
            &json!({
                "count": items.len(),
                "items": items,
                "orderBy": params.by,
                "hours": params.hours,
            }),
        ),
        Err(e) => {
            error!(error = %e, "Leaderboard query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

async fn handle_health(state: &AppState) -> Response<Full<Bytes>> {
    let presence = |set: bool| if set { "set" } else { "missing" };
    let env = json!({
        "NEYNAR_API_KEY": presence(state.config.has_api_key()),
        "DATABASE_URL": presence(state.config.database_url.is_some()),
        "STORAGE_TYPE": state.config.storage_type,
    });

    match state.orchestrator.store().health_check().await {
        Ok(now) => json_response(StatusCode::OK, &json!({ "ok": true, "env": env, "dbNow": now })),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({ "ok": false, "env": env, "error": e.to_string() }),
        ),
    }
}

/// Routes one request
pub async fn handle<B>(req: Request<B>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let call = Call::from_request(&req);
    drop(req);
    debug!(method = %call.method, path = %call.path, "HTTP request");

    match (&call.method, call.path.as_str()) {
        (&Method::GET | &Method::POST, "/api/ingest") => handle_ingest(&call, &state).await,
        (&Method::GET, "/api/top") => handle_top(&call, &state).await,
        (&Method::GET, "/health") => handle_health(&state).await,
        (&Method::GET, "/metrics") if state.config.metrics_enabled => {
            let mut response = Response::new(Full::new(Bytes::from(gather_metrics())));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Accepts connections until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    info!(address = %addr, "HTTP server listening");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let io = TokioIo::new(stream);
                let state = state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(peer = %peer, error = %e, "Connection closed with error");
                    }
                });
            }
            _ = &mut shutdown => {
                info!("HTTP server shutting down");
                break;
            }
        }
    }

    let in_flight = state.runs.active();
    if in_flight > 0 {
        info!(in_flight, "Waiting for ingest runs to finish");
    }
    state.runs.drained().await;

    Ok(())
}
