//! Pluggable per-transaction filters.
//!
//! A [`ProxyFilterFactory`] produces one [`ProxyFilter`] per proxied request.
//! The filter sees the request when it leaves the client and, if the response
//! was selected for capture, the fully decoded response once it has streamed
//! through.

use std::collections::HashMap;
use std::sync::Arc;

use hudsucker::hyper::Response;

use crate::classifier::should_capture;

/// Request metadata handed to [`ProxyFilter::on_request`].
#[derive(Debug, Clone, Copy)]
pub struct ProxyRequest<'a> {
    /// Absolute request URL.
    pub url: &'a str,
    pub method: &'a str,
}

/// A materialized response handed to [`ProxyFilter::on_response`].
#[derive(Debug, Clone, Copy)]
pub struct ProxyResponse<'a> {
    pub status: u16,
    /// Single-valued header map keyed by lowercase name.
    pub headers: &'a HashMap<String, String>,
    /// Body with transfer and content codings removed.
    pub body: &'a [u8],
}

/// What is known about a transaction once response headers arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub url: String,
    pub method: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
}

impl TransactionInfo {
    /// Collects the metadata of `response` to a request for `url`.
    ///
    /// Repeated headers keep their first value.
    pub fn from_response<B>(url: String, method: String, response: &Response<B>) -> Self {
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }

        Self {
            url,
            method,
            status: response.status().as_u16(),
            headers,
        }
    }
}

/// Hooks into the lifecycle of one proxied transaction.
pub trait ProxyFilter: Send {
    /// Called when the request is forwarded upstream.
    fn on_request(&mut self, request: &ProxyRequest<'_>);

    /// Called once the response body has been captured and decoded.
    fn on_response(&mut self, response: &ProxyResponse<'_>);
}

/// Creates a fresh filter for each request.
pub trait ProxyFilterFactory: Send + Sync {
    fn create(&self) -> Box<dyn ProxyFilter>;
}

/// Decides, from response metadata, whether a response body is buffered.
pub type ResponseSelector = Arc<dyn Fn(&TransactionInfo) -> bool + Send + Sync>;

/// Selector backed by [`should_capture`].
pub fn default_selector() -> ResponseSelector {
    Arc::new(|info: &TransactionInfo| should_capture(info.status, &info.headers, &info.url))
}
