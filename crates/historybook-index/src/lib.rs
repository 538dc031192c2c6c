//! HistoryBook Index - full-text history of captured pages.
//!
//! This crate provides:
//! - Title and text extraction from captured HTML
//! - The page schema and document adapter
//! - A persistent, collection-namespaced index with recency-boosted ranking,
//!   per-URL grouping and highlighted snippets

pub mod document;
pub mod engine;
pub mod error;
pub mod extract;
pub mod ranking;
pub mod result;
pub mod snippet;

pub use document::{content_key, registrable_domain, IndexSchema, PageDocument};
pub use engine::{HistoryIndex, INDEX_DIR};
pub use error::{IndexError, Result};
pub use extract::{extract, ExtractedText};
pub use ranking::{IdentityTransform, RecencyBoost, ScoreTransform};
pub use result::{ResultPage, SearchResult};

use chrono::{DateTime, Utc};

/// Ingest and query operations over a page index.
///
/// Implemented by [`HistoryIndex`]; the capture pipeline and the REST layer
/// depend on this trait rather than the concrete engine.
pub trait PageIndex: Send + Sync {
    /// Indexes one captured page. Returns once the page is searchable.
    fn index_page(
        &self,
        collection: &str,
        url: &str,
        timestamp: DateTime<Utc>,
        body: &str,
    ) -> Result<()>;

    /// Searches one collection, returning the `offset`/`size` window of
    /// URL-grouped results.
    fn search(
        &self,
        collection: &str,
        query: &str,
        offset: usize,
        size: usize,
        include_debug: bool,
    ) -> Result<ResultPage>;
}
