//! API request and response models.

use serde::{Deserialize, Serialize};

/// Query parameters for GET /collections/{collection}.
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    /// Query string in the index query syntax.
    #[serde(default)]
    pub q: String,
    /// Number of URL groups to skip (default: 0).
    #[serde(default)]
    pub offset: usize,
    /// Maximum number of results (default: 10).
    #[serde(default = "default_size")]
    pub size: usize,
    /// Include score explanations (default: false).
    #[serde(default)]
    pub debug: bool,
}

fn default_size() -> usize {
    10
}

/// Response body for a page accepted into the index.
#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub collection: String,
    pub url: String,
    /// ISO-8601 fetch time recorded for the page.
    pub timestamp: String,
}

/// Response body for GET /api/health.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
