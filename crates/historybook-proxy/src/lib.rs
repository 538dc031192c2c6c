//! HistoryBook Proxy - capturing MITM proxy.
//!
//! This crate provides an HTTP(S) proxy that observes browsing traffic and
//! hands selected pages to the history index.
//!
//! ## Features
//!
//! - Generates root CA certificate on first run
//! - Creates per-host certificates on the fly
//! - Decides from response headers alone whether a page is captured
//! - Streams every response to the client unchanged
//! - Buffers and decodes (chunked, gzip, deflate) captured pages up to a bound
//! - Indexes captured pages on a single background worker
//!
//! ## Architecture
//!
//! ```text
//! Client Request → Proxy → Filter (on_request)
//!                                │
//!                     Response headers → Selector
//!                                │
//!              ┌─────────────────┴─────────────────┐
//!              │ No                                │ Yes
//!              ▼                                   ▼
//!         Passthrough                  Stream + Reassemble (bounded)
//!                                                  │
//!                                                  ▼
//!                                       Filter (on_response)
//!                                                  │
//!                                                  ▼
//!                                     Index queue → PageIndex
//! ```

mod ca;
mod capture;
mod classifier;
mod error;
mod filter;
mod handler;
mod proxy;
pub mod reassembler;

pub use ca::{CaManager, CaManagerError};
pub use capture::{
    decode_body, CapturedPage, IndexQueue, IndexWorker, IndexingFilter, IndexingFilterFactory,
    DEFAULT_QUEUE_CAPACITY,
};
pub use classifier::{header, is_local_url, media_type, should_capture};
pub use error::{ProxyError, ReassemblyError, Result};
pub use filter::{
    default_selector, ProxyFilter, ProxyFilterFactory, ProxyRequest, ProxyResponse,
    ResponseSelector, TransactionInfo,
};
pub use handler::{CaptureBody, HandlerConfig, ProxyHandler};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use reassembler::{
    ChunkedDecoder, ContentDecoder, Reassembler, ReassemblyState, TransferFraming,
    DEFAULT_MAX_BUFFER_SIZE,
};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8082;
