//! Application state for the API server.

use std::sync::Arc;

use historybook_index::{HistoryIndex, PageIndex};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The page index searched and fed by the API.
    pub index: Arc<dyn PageIndex>,
}

impl AppState {
    /// Creates application state over an index.
    pub fn new(index: Arc<dyn PageIndex>) -> Self {
        Self { index }
    }

    /// Creates application state with a throwaway in-memory index.
    pub fn in_memory() -> historybook_index::Result<Self> {
        Ok(Self::new(Arc::new(HistoryIndex::in_memory()?)))
    }
}
