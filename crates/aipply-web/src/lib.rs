//! Axum JSON API: keyword search plus admin listing and manual refresh.

use std::sync::Arc;

use aipply_store::{OpportunityStore, SearchFilter};
use aipply_sync::{RefreshOrchestrator, ScrapeHints};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "aipply-web";

const SERVICE_NAME: &str = "AIpply Opportunity Search API";
const SEARCH_LIMIT: i64 = 100;
const ADMIN_LIST_DEFAULT_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: OpportunityStore,
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub stale_after_hours: i64,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    keyword: String,
    region: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RefreshParams {
    keyword: Option<String>,
    region: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ListParams {
    limit: Option<i64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/search", get(search_handler))
        .route("/api/admin/opportunities", get(admin_list_handler))
        .route("/api/admin/refresh", post(admin_refresh_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving http api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

/// Store-first search. A stale store schedules a background refresh that is
/// never awaited by this response; a failing store query degrades to a live
/// scrape so the request still gets an answer.
async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    let hints = ScrapeHints {
        keyword: Some(params.keyword.clone()),
        region: params.region.clone(),
        kind: params.kind.clone(),
    };

    match state.store.needs_refresh(state.stale_after_hours).await {
        Ok(true) => {
            info!(keyword = %params.keyword, "store is stale, scheduling background refresh");
            state.orchestrator.spawn_refresh(hints.clone());
        }
        Ok(false) => {}
        Err(err) => warn!(error = %err, "staleness check failed"),
    }

    let filter = SearchFilter {
        keyword: Some(params.keyword),
        region: params.region,
        kind: params.kind,
        limit: Some(SEARCH_LIMIT),
    };
    match state.store.search(&filter).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => {
            warn!(error = %err, "store search failed, answering from live scrape");
            match state.orchestrator.scrape_raw(&hints).await {
                Ok(candidates) => Json(candidates).into_response(),
                Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
            }
        }
    }
}

async fn admin_list_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params.limit.unwrap_or(ADMIN_LIST_DEFAULT_LIMIT);
    match state.store.list_all(limit).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => {
            warn!(error = %err, "admin listing failed");
            Json(Vec::<aipply_core::OpportunityRecord>::new()).into_response()
        }
    }
}

/// Synchronous refresh: blocks until scrape + upsert complete and reports
/// the counts. Errors come back as a structured error status.
async fn admin_refresh_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RefreshParams>,
) -> Response {
    let hints = ScrapeHints {
        keyword: params.keyword,
        region: params.region,
        kind: params.kind,
    };
    match state.orchestrator.refresh(&hints).await {
        Ok(outcome) => Json(json!({
            "status": "success",
            "scraped": outcome.scraped,
            "new_opportunities": outcome.added,
            "message": format!("store refreshed with {} new opportunities", outcome.added),
        }))
        .into_response(),
        Err(err) => Json(json!({
            "status": "error",
            "message": err.to_string(),
        }))
        .into_response(),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message })),
    )
        .into_response()
}
