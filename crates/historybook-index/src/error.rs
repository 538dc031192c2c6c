//! Error types for the index.

use thiserror::Error;

/// Index error type.
///
/// Every failure surfaced by ingest or search is an `IndexError`; the variant
/// carries the underlying cause.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Error raised by the search library.
    #[error("Index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    /// Failed to open the index directory.
    #[error("Failed to open index directory: {0}")]
    Directory(#[from] tantivy::directory::error::OpenDirectoryError),

    /// Malformed query syntax.
    #[error("Invalid query: {0}")]
    Query(#[from] tantivy::query::QueryParserError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The index has been closed.
    #[error("Index is closed")]
    Closed,
}

impl IndexError {
    /// Returns true if the error was caused by the caller's query string.
    pub fn is_query_error(&self) -> bool {
        matches!(self, IndexError::Query(_))
    }
}

/// Result type for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;
