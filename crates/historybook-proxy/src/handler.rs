//! HTTP handler wiring the filter chain into the MITM proxy.
//!
//! Selected responses are streamed to the client through a [`CaptureBody`]
//! that feeds a copy of every chunk to the response's reassembler. Everything
//! else is returned untouched.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body_util::combinators::BoxBody;
use hudsucker::{
    hyper::{Method, Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::{Body as HttpBody, Bytes, Frame, SizeHint};
use parking_lot::Mutex;

use crate::filter::{
    default_selector, ProxyFilter, ProxyFilterFactory, ProxyRequest, ProxyResponse,
    ResponseSelector, TransactionInfo,
};
use crate::reassembler::{
    ReassemblyState, Reassembler, TransferFraming, DEFAULT_MAX_BUFFER_SIZE,
};

type SharedFilter = Arc<Mutex<Box<dyn ProxyFilter>>>;

/// Handler configuration.
#[derive(Clone)]
pub struct HandlerConfig {
    /// Creates the per-request filter. `None` disables capture.
    pub filter_factory: Option<Arc<dyn ProxyFilterFactory>>,
    /// Decides which responses are buffered.
    pub selector: ResponseSelector,
    /// Bound on a decoded captured body.
    pub max_buffer_size: usize,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("filter_factory", &self.filter_factory.is_some())
            .field("max_buffer_size", &self.max_buffer_size)
            .finish()
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            filter_factory: None,
            selector: default_selector(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

/// The in-flight request a handler clone is serving.
#[derive(Clone)]
struct Transaction {
    url: String,
    method: String,
    filter: SharedFilter,
}

/// HTTP handler for the MITM proxy.
///
/// The proxy clones the handler for every request, so the transaction
/// recorded in `handle_request` is the one answered in `handle_response`.
#[derive(Clone)]
pub struct ProxyHandler {
    config: HandlerConfig,
    transaction: Option<Transaction>,
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("config", &self.config)
            .field(
                "transaction",
                &self.transaction.as_ref().map(|t| t.url.as_str()),
            )
            .finish()
    }
}

impl ProxyHandler {
    /// Creates a new proxy handler with the given configuration.
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config,
            transaction: None,
        }
    }

    /// Starts tracking a request if capture is enabled.
    fn begin(&mut self, req: &Request<Body>) {
        let Some(factory) = self.config.filter_factory.as_ref() else {
            return;
        };

        let url = req.uri().to_string();
        let method = req.method().to_string();

        let mut filter = factory.create();
        filter.on_request(&ProxyRequest {
            url: &url,
            method: &method,
        });

        self.transaction = Some(Transaction {
            url,
            method,
            filter: Arc::new(Mutex::new(filter)),
        });
    }

    /// Wraps the response body for capture when the selector picks it.
    fn intercept(&self, transaction: Transaction, res: Response<Body>) -> Response<Body> {
        // HEAD responses never carry a body
        if transaction.method == Method::HEAD.as_str() {
            return res;
        }

        let info = TransactionInfo::from_response(transaction.url, transaction.method, &res);
        let selected = (self.config.selector)(&info);

        let mut reassembler = Reassembler::new(self.config.max_buffer_size);
        if reassembler.on_headers(selected, &info.headers, TransferFraming::Decoded)
            != ReassemblyState::Buffering
        {
            tracing::trace!("Passing through {} ({})", info.url, info.status);
            return res;
        }

        tracing::debug!("Buffering {} for capture", info.url);
        let (parts, body) = res.into_parts();
        let body = CaptureBody::new(body, reassembler, transaction.filter, info);
        Response::from_parts(parts, Body::from(BoxBody::new(body)))
    }
}

impl HttpHandler for ProxyHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        // Tunnels are not transactions; the requests inside them are
        if req.method() != Method::CONNECT {
            self.begin(&req);
        }
        RequestOrResponse::Request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        match self.transaction.take() {
            Some(transaction) => self.intercept(transaction, res),
            None => res,
        }
    }
}

/// Response body that forwards every frame unchanged while feeding data
/// frames to a [`Reassembler`].
///
/// When the upstream body ends the decoded page is handed to the
/// transaction's filter.
pub struct CaptureBody {
    inner: Pin<Box<Body>>,
    reassembler: Reassembler,
    filter: Option<SharedFilter>,
    info: TransactionInfo,
    finished: bool,
}

impl CaptureBody {
    fn new(
        inner: Body,
        reassembler: Reassembler,
        filter: SharedFilter,
        info: TransactionInfo,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            reassembler,
            filter: Some(filter),
            info,
            finished: false,
        }
    }

    fn complete(&mut self) {
        self.finished = true;
        let Some(filter) = self.filter.take() else {
            return;
        };
        let Some(body) = self.reassembler.on_end() else {
            return;
        };

        tracing::debug!("Captured {} bytes from {}", body.len(), self.info.url);
        filter.lock().on_response(&ProxyResponse {
            status: self.info.status,
            headers: &self.info.headers,
            body: &body,
        });
    }
}

impl HttpBody for CaptureBody {
    type Data = Bytes;
    type Error = hudsucker::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.reassembler.on_chunk(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!("Upstream body of {} failed: {}", this.info.url, e);
                this.reassembler.abort();
                this.filter = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    // Completion is only observed by polling to the end, so never report the
    // end early.
    fn is_end_stream(&self) -> bool {
        self.finished
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
