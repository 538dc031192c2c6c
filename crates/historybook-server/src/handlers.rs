//! API route handlers.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use tracing::{debug, info};

use historybook_index::ResultPage;

use crate::error::{ApiError, Result};
use crate::models::{HealthResponse, IndexResponse, SearchQuery};
use crate::state::AppState;

/// GET /api/health - Liveness check.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /collections/{collection} - Search a collection.
pub async fn search(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ResultPage>> {
    debug!(
        "Searching {} for {:?} (offset {}, size {})",
        collection, query.q, query.offset, query.size
    );

    if query.q.trim().is_empty() {
        return Ok(Json(ResultPage::empty(&query.q, query.offset, query.size)));
    }

    let page = tokio::task::spawn_blocking(move || {
        state
            .index
            .search(&collection, &query.q, query.offset, query.size, query.debug)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(page))
}

/// POST /collections/{collection}/{url} - Index a page fetched now.
pub async fn index_page(
    State(state): State<AppState>,
    Path((collection, url)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<IndexResponse>)> {
    store(state, collection, url, Utc::now().trunc_subsecs(0), body).await
}

/// POST /collections/{collection}/{url}/{timestamp} - Index a page with an
/// explicit ISO-8601 fetch time.
pub async fn index_page_at(
    State(state): State<AppState>,
    Path((collection, url, timestamp)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<IndexResponse>)> {
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| ApiError::BadRequest(format!("invalid timestamp {:?}: {}", timestamp, e)))?
        .with_timezone(&Utc);

    store(state, collection, url, timestamp, body).await
}

async fn store(
    state: AppState,
    collection: String,
    url: String,
    timestamp: DateTime<Utc>,
    body: Bytes,
) -> Result<(StatusCode, Json<IndexResponse>)> {
    let response = IndexResponse {
        collection: collection.clone(),
        url: url.clone(),
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    };

    tokio::task::spawn_blocking(move || {
        let markup = String::from_utf8_lossy(&body);
        state.index.index_page(&collection, &url, timestamp, &markup)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    info!("Indexed {} into {} via API", response.url, response.collection);
    Ok((StatusCode::ACCEPTED, Json(response)))
}
