//! The indexing filter and the ingest queue behind it.
//!
//! Captured pages are handed to a single worker task that indexes them one at
//! a time, off the proxy I/O path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use encoding_rs::{Encoding, UTF_8};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use historybook_index::PageIndex;

use crate::classifier::header;
use crate::filter::{
    default_selector, ProxyFilter, ProxyFilterFactory, ProxyRequest, ProxyResponse,
    ResponseSelector, TransactionInfo,
};

/// A page waiting to be indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPage {
    pub collection: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug)]
enum QueueMessage {
    Page(CapturedPage),
    Shutdown,
}

/// Pages that may wait for the worker before submissions are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Sending side of the ingest queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IndexQueue {
    tx: mpsc::Sender<QueueMessage>,
}

/// The worker task draining an [`IndexQueue`].
#[derive(Debug)]
pub struct IndexWorker {
    handle: JoinHandle<()>,
}

impl IndexQueue {
    /// Spawns the ingest worker for `index` with the default capacity.
    pub fn start(index: Arc<dyn PageIndex>) -> (Self, IndexWorker) {
        Self::with_capacity(index, DEFAULT_QUEUE_CAPACITY)
    }

    /// Spawns the ingest worker for `index`, holding at most `capacity`
    /// pending pages.
    pub fn with_capacity(index: Arc<dyn PageIndex>, capacity: usize) -> (Self, IndexWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(index, rx));
        (Self { tx }, IndexWorker { handle })
    }

    /// Enqueues a page without waiting.
    ///
    /// Returns false, dropping the page, if the queue is full or the worker
    /// is gone.
    pub fn submit(&self, page: CapturedPage) -> bool {
        match self.tx.try_send(QueueMessage::Page(page)) {
            Ok(()) => true,
            Err(TrySendError::Full(QueueMessage::Page(page))) => {
                tracing::warn!("Index queue full, dropping capture of {}", page.url);
                false
            }
            Err(TrySendError::Closed(QueueMessage::Page(page))) => {
                tracing::warn!("Index queue closed, dropping capture of {}", page.url);
                false
            }
            Err(_) => false,
        }
    }

    /// Asks the worker to stop after the pages already queued.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(QueueMessage::Shutdown).await;
    }
}

impl IndexWorker {
    /// Waits for the worker to finish.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!("Index worker failed: {}", e);
        }
    }
}

async fn run_worker(index: Arc<dyn PageIndex>, mut rx: mpsc::Receiver<QueueMessage>) {
    tracing::debug!("Index worker started");

    while let Some(message) = rx.recv().await {
        let page = match message {
            QueueMessage::Page(page) => page,
            QueueMessage::Shutdown => break,
        };

        let url = page.url.clone();
        let index = Arc::clone(&index);
        let result = tokio::task::spawn_blocking(move || {
            index.index_page(&page.collection, &page.url, page.timestamp, &page.body)
        })
        .await;

        match result {
            Ok(Ok(())) => tracing::info!("Captured {}", url),
            Ok(Err(e)) => tracing::error!("Failed to index {}: {}", url, e),
            Err(e) => tracing::error!("Index task for {} failed: {}", url, e),
        }
    }

    tracing::debug!("Index worker stopped");
}

/// Filter that submits captured pages to the ingest queue.
pub struct IndexingFilter {
    collection: Arc<str>,
    queue: IndexQueue,
    selector: ResponseSelector,
    request: Option<(String, String)>,
}

impl IndexingFilter {
    pub fn new(collection: Arc<str>, queue: IndexQueue, selector: ResponseSelector) -> Self {
        Self {
            collection,
            queue,
            selector,
            request: None,
        }
    }
}

impl ProxyFilter for IndexingFilter {
    fn on_request(&mut self, request: &ProxyRequest<'_>) {
        self.request = Some((request.url.to_string(), request.method.to_string()));
    }

    fn on_response(&mut self, response: &ProxyResponse<'_>) {
        let Some((url, method)) = self.request.take() else {
            tracing::warn!("Response seen without a request, skipping capture");
            return;
        };

        let info = TransactionInfo {
            url,
            method,
            status: response.status,
            headers: response.headers.clone(),
        };
        if !(self.selector)(&info) {
            tracing::debug!("Not indexing {}", info.url);
            return;
        }

        let page = CapturedPage {
            collection: self.collection.to_string(),
            body: decode_body(response.body, &info.headers),
            url: info.url,
            timestamp: Utc::now().trunc_subsecs(0),
        };
        self.queue.submit(page);
    }
}

/// Creates an [`IndexingFilter`] per request.
pub struct IndexingFilterFactory {
    collection: Arc<str>,
    queue: IndexQueue,
    selector: ResponseSelector,
}

impl IndexingFilterFactory {
    /// Captures into `collection` using the default capture selector.
    pub fn new(collection: impl Into<Arc<str>>, queue: IndexQueue) -> Self {
        Self {
            collection: collection.into(),
            queue,
            selector: default_selector(),
        }
    }

    /// Replaces the selector re-checked before submitting a page.
    pub fn with_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&TransactionInfo) -> bool + Send + Sync + 'static,
    {
        self.selector = Arc::new(selector);
        self
    }
}

impl ProxyFilterFactory for IndexingFilterFactory {
    fn create(&self) -> Box<dyn ProxyFilter> {
        Box::new(IndexingFilter::new(
            Arc::clone(&self.collection),
            self.queue.clone(),
            Arc::clone(&self.selector),
        ))
    }
}

/// Decodes a captured body using the `charset` of its `Content-Type`.
///
/// Unknown or missing charsets fall back to UTF-8; invalid sequences are
/// replaced. A byte order mark overrides the declared charset.
pub fn decode_body(body: &[u8], headers: &HashMap<String, String>) -> String {
    let encoding = header(headers, "content-type")
        .and_then(charset)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);

    let (text, used, had_errors) = encoding.decode(body);
    if had_errors {
        tracing::debug!("Replaced invalid {} sequences in captured body", used.name());
    }
    text.into_owned()
}

fn charset(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}
