use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderValue, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::cache::{CacheStats, PriceCache};
use crate::config::AppConfig;
use crate::fetch::fetcher::PriceFetcher;
use crate::fetch::PriceValue;
use crate::rate_limit::{QuotaUsage, RateLimiter};
use crate::scheduler::{RefreshScheduler, SchedulerStatus};

pub struct ApiState {
    pub config: AppConfig,
    pub cache: Arc<PriceCache>,
    pub limiter: Arc<RateLimiter>,
    pub fetcher: Arc<PriceFetcher>,
    pub scheduler: Arc<RefreshScheduler>,
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/prices/all", get(prices_all))
        .route("/api/health", get(health))
        .route("/api/ping", get(ping))
        .fallback(not_found)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Any origin may read; the surface is read-only.
async fn cors(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    response
}

#[derive(Deserialize)]
struct PricesQuery {
    force: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PricesMetadata {
    cached: bool,
    partial: bool,
    stale: bool,
    degraded: bool,
    timestamp: String,
    ttls: BTreeMap<String, u64>,
}

#[derive(Serialize)]
struct PricesResponse {
    data: BTreeMap<String, PriceValue>,
    metadata: PricesMetadata,
    errors: Vec<String>,
    successes: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HandlerError {
    error: String,
    message: String,
    retry_after: u64,
}

async fn prices_all(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PricesQuery>,
) -> Response {
    if query.force.unwrap_or(false) {
        info!("force refresh requested; clearing cache");
        state.cache.clear();
    }

    match state.fetcher.fetch_all().await {
        Ok(outcome) => {
            let status = if outcome.errors.is_empty() {
                StatusCode::OK
            } else {
                StatusCode::MULTI_STATUS
            };
            let body = PricesResponse {
                metadata: PricesMetadata {
                    cached: outcome.cached,
                    partial: outcome.partial,
                    stale: outcome.stale,
                    degraded: outcome.errors.len() > 3,
                    timestamp: Utc::now().to_rfc3339(),
                    ttls: outcome.ttls,
                },
                data: outcome.data,
                errors: outcome.errors,
                successes: outcome.successes,
            };
            (status, Json(body)).into_response()
        }
        Err(err) => {
            error!(error = %err, "price aggregation failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HandlerError {
                    error: "Service unavailable".to_string(),
                    message: err.to_string(),
                    retry_after: 30,
                }),
            )
                .into_response()
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    cache: CacheStats,
    rate_limits: BTreeMap<&'static str, QuotaUsage>,
    scheduler: SchedulerStatus,
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let rate_limits = state
        .config
        .declared_quotas()
        .into_iter()
        .map(|(upstream, limit)| (upstream.id(), state.limiter.usage(upstream, limit)))
        .collect();

    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        cache: state.cache.stats(),
        rate_limits,
        scheduler: state.scheduler.status(),
    })
}

#[derive(Serialize)]
struct PingResponse {
    status: &'static str,
    timestamp: String,
}

async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
struct NotFoundBody {
    error: &'static str,
    path: String,
}

async fn not_found(uri: Uri) -> (StatusCode, Json<NotFoundBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundBody {
            error: "Not found",
            path: uri.path().to_string(),
        }),
    )
}
