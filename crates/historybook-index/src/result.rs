//! Search result types returned to API clients.

use serde::Serialize;

/// A single matched page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Content key of the page text.
    pub key: String,
    pub collection: String,
    pub title: String,
    pub url: String,
    pub domain: String,
    /// ISO-8601 fetch time.
    pub timestamp: String,
    /// Highlighted fragments; `<b>` is the only markup.
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
    /// Final score after the score transform.
    pub score: f32,
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultPage {
    pub query: String,
    pub offset: usize,
    pub max_results_requested: usize,
    /// Number of distinct URLs that matched, across all pages.
    pub result_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
    pub results: Vec<SearchResult>,
}

impl ResultPage {
    /// An empty page for a query that matched nothing.
    pub fn empty(query: &str, offset: usize, size: usize) -> Self {
        Self {
            query: query.to_string(),
            offset,
            max_results_requested: size,
            result_count: 0,
            debug_info: None,
            results: Vec::new(),
        }
    }
}
