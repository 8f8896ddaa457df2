//! Axum JSON API over an advocate store.

use std::sync::Arc;

use advo_core::Advocate;
use advo_storage::{
    AdvocateStore, BrandPerformance, MetricValue, OutlierMetric, StoreError, TopMetric,
};
use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "advo-web";

pub const DEFAULT_TOP_LIMIT: usize = 20;
pub const DEFAULT_OUTLIER_STDDEV: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("ADVO_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::default().port),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AdvocateStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn AdvocateStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Serialize)]
pub struct TopAdvocatesResponse {
    pub metric: TopMetric,
    pub results: Vec<MetricValue>,
}

#[derive(Debug, Serialize)]
pub struct BrandPerformanceResponse {
    pub results: Vec<BrandPerformance>,
}

#[derive(Debug, Serialize)]
pub struct OutliersResponse {
    pub metric: OutlierMetric,
    pub stddev: f64,
    pub outliers: Vec<MetricValue>,
}

#[derive(Debug, Deserialize, Default)]
struct TopAdvocatesQuery {
    limit: Option<usize>,
    metric: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OutliersQuery {
    metric: Option<String>,
    stddev: Option<f64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/users/{user_id}", get(user_handler))
        .route("/metrics/top-advocates", get(top_advocates_handler))
        .route("/metrics/brands/performance", get(brand_performance_handler))
        .route("/metrics/outliers", get(outliers_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig, store: Arc<dyn AdvocateStore>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "serving advocate api");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn user_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
) -> Result<Json<Advocate>, Response> {
    match state.store.get_advocate(&user_id).await {
        Ok(Some(advocate)) => Ok(Json(advocate)),
        Ok(None) => Err(detail(StatusCode::NOT_FOUND, "user not found")),
        Err(err) => Err(store_error(err)),
    }
}

async fn top_advocates_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopAdvocatesQuery>,
) -> Response {
    let metric = match query.metric.as_deref().unwrap_or("conversions").parse::<TopMetric>() {
        Ok(metric) => metric,
        Err(err) => return store_error(err),
    };
    let limit = query.limit.unwrap_or(DEFAULT_TOP_LIMIT);
    match state.store.top_advocates(metric, limit).await {
        Ok(results) => Json(TopAdvocatesResponse { metric, results }).into_response(),
        Err(err) => store_error(err),
    }
}

async fn brand_performance_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.brand_performance().await {
        Ok(results) => Json(BrandPerformanceResponse { results }).into_response(),
        Err(err) => store_error(err),
    }
}

async fn outliers_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OutliersQuery>,
) -> Response {
    let metric = match query.metric.as_deref().unwrap_or("sales").parse::<OutlierMetric>() {
        Ok(metric) => metric,
        Err(err) => return store_error(err),
    };
    let stddev = query.stddev.unwrap_or(DEFAULT_OUTLIER_STDDEV);
    match state.store.outliers(metric, stddev).await {
        Ok(outliers) => Json(OutliersResponse {
            metric,
            stddev,
            outliers,
        })
        .into_response(),
        Err(err) => store_error(err),
    }
}

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"detail": message.into()}))).into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::UnsupportedMetric(_) => detail(StatusCode::BAD_REQUEST, err.to_string()),
        StoreError::Backend(_) => {
            error!(error = %err, "store query failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
        }
    }
}
