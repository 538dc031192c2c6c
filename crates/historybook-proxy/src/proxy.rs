//! Capturing MITM proxy server.

use std::net::SocketAddr;
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::sync::broadcast;

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::filter::{default_selector, ProxyFilterFactory, ResponseSelector, TransactionInfo};
use crate::handler::{HandlerConfig, ProxyHandler};
use crate::reassembler::DEFAULT_MAX_BUFFER_SIZE;
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    /// Bound on a decoded captured body.
    pub max_buffer_size: usize,
}

impl ProxyConfig {
    /// Creates a configuration on the default port for the given CA.
    pub fn with_ca_dir(ca_manager: CaManager) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the bound on a decoded captured body, in bytes.
    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }
}

/// MITM proxy that captures selected responses.
pub struct ProxyServer {
    config: ProxyConfig,
    filter_factory: Option<Arc<dyn ProxyFilterFactory>>,
    selector: Option<ResponseSelector>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("filter_factory", &self.filter_factory.is_some())
            .field("selector", &self.selector.is_some())
            .finish()
    }
}

impl ProxyServer {
    /// Creates a new proxy server with the given configuration.
    ///
    /// Generates the root CA if it does not exist yet.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        if config.max_buffer_size == 0 {
            return Err(ProxyError::Config(
                "max buffer size must be greater than zero".to_string(),
            ));
        }
        config.ca_manager.ensure_ca().map_err(ProxyError::Ca)?;

        Ok(Self {
            config,
            filter_factory: None,
            selector: None,
        })
    }

    /// Sets the factory creating the per-request filter.
    pub fn with_filter_factory(mut self, factory: impl ProxyFilterFactory + 'static) -> Self {
        self.filter_factory = Some(Arc::new(factory));
        self
    }

    /// Sets the selector deciding which responses are buffered.
    ///
    /// Defaults to [`should_capture`](crate::should_capture).
    pub fn with_response_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&TransactionInfo) -> bool + Send + Sync + 'static,
    {
        self.selector = Some(Arc::new(selector));
        self
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.config.ca_manager.cert_path()
    }

    fn handler(&self) -> ProxyHandler {
        ProxyHandler::new(HandlerConfig {
            filter_factory: self.filter_factory.clone(),
            selector: self.selector.clone().unwrap_or_else(default_selector),
            max_buffer_size: self.config.max_buffer_size,
        })
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let addr = self.config.addr;

        // Load CA authority before spawning
        let authority = self.config.ca_manager.ensure_ca().map_err(ProxyError::Ca)?;
        let handler = self.handler();

        tracing::info!("Starting capture proxy on {}", addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        // Subscribe before spawning so an immediate stop is not missed
        let mut shutdown_rx = shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let proxy = match Proxy::builder()
                .with_addr(addr)
                .with_ca(authority)
                .with_rustls_connector(default_provider())
                .with_http_handler(handler)
                .build()
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("Failed to build proxy: {}", e);
                    return;
                }
            };

            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{IndexQueue, IndexingFilterFactory};
    use crate::classifier::{header, media_type};
    use axum::body::Body as AxumBody;
    use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
    use axum::routing::get;
    use axum::Router;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use historybook_index::HistoryIndex;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    const PAGE: &str = "<html><head><title>Proxy Page</title></head>\
                        <body><p>Captured through the proxy</p></body></html>";

    fn test_config(temp_dir: &TempDir) -> ProxyConfig {
        ProxyConfig::with_ca_dir(CaManager::new(temp_dir.path().join("ca")))
            .with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn large_html() -> String {
        let mut body = String::from("<html><body>");
        for i in 0..4_000 {
            body.push_str(&format!("<p>paragraph number {} of the long page</p>", i));
        }
        body.push_str("</body></html>");
        body
    }

    fn plain_text() -> Vec<u8> {
        (0..6_000)
            .map(|i| format!("streamed plaintext line {}\n", i))
            .collect::<String>()
            .into_bytes()
    }

    /// Captures HTML from any host, loopback included.
    fn html_selector(info: &TransactionInfo) -> bool {
        info.status == 200
            && header(&info.headers, "content-type")
                .map(|value| media_type(value).starts_with("text/html"))
                .unwrap_or(false)
    }

    async fn start_origin() -> SocketAddr {
        let app = Router::new()
            .route(
                "/page",
                get(|| async { ([(CONTENT_TYPE, "text/html; charset=utf-8")], PAGE) }),
            )
            .route(
                "/gzip",
                get(|| async {
                    (
                        [(CONTENT_TYPE, "text/html"), (CONTENT_ENCODING, "gzip")],
                        gzip(PAGE.as_bytes()),
                    )
                }),
            )
            .route(
                "/chunked",
                get(|| async {
                    let parts: Vec<Result<String, std::io::Error>> = PAGE
                        .as_bytes()
                        .chunks(16)
                        .map(|c| Ok(String::from_utf8_lossy(c).into_owned()))
                        .collect();
                    (
                        [(CONTENT_TYPE, "text/html")],
                        AxumBody::from_stream(futures::stream::iter(parts)),
                    )
                }),
            )
            .route(
                "/stream",
                get(|| async {
                    let parts: Vec<Result<Vec<u8>, std::io::Error>> =
                        plain_text().chunks(4096).map(|c| Ok(c.to_vec())).collect();
                    (
                        [(CONTENT_TYPE, "text/plain")],
                        AxumBody::from_stream(futures::stream::iter(parts)),
                    )
                }),
            )
            .route("/large", get(|| async { ([(CONTENT_TYPE, "text/html")], large_html()) }))
            .route(
                "/binary",
                get(|| async {
                    let bytes: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
                    ([(CONTENT_TYPE, "application/octet-stream")], bytes)
                }),
            )
            .route(
                "/missing",
                get(|| async {
                    (
                        axum::http::StatusCode::NOT_FOUND,
                        [(CONTENT_TYPE, "text/html")],
                        "<p>Not here</p>",
                    )
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    struct Harness {
        _temp_dir: TempDir,
        index: Arc<HistoryIndex>,
        queue: IndexQueue,
        proxy: ProxyHandle,
        client: reqwest::Client,
        origin: SocketAddr,
    }

    impl Harness {
        async fn start(max_buffer_size: usize) -> Self {
            let temp_dir = TempDir::new().unwrap();
            let index = Arc::new(HistoryIndex::in_memory().unwrap());
            let (queue, _worker) = IndexQueue::start(index.clone());

            let port = free_port();
            let config = test_config(&temp_dir)
                .with_port(port)
                .with_max_buffer_size(max_buffer_size);
            let proxy = ProxyServer::new(config)
                .unwrap()
                .with_response_selector(html_selector)
                .with_filter_factory(
                    IndexingFilterFactory::new("test", queue.clone()).with_selector(html_selector),
                )
                .start()
                .unwrap();

            let client = reqwest::Client::builder()
                .proxy(reqwest::Proxy::http(format!("http://127.0.0.1:{}", port)).unwrap())
                .build()
                .unwrap();

            let origin = start_origin().await;
            let harness = Self {
                _temp_dir: temp_dir,
                index,
                queue,
                proxy,
                client,
                origin,
            };
            harness.wait_until_listening().await;
            harness
        }

        async fn wait_until_listening(&self) {
            for _ in 0..50 {
                if tokio::net::TcpStream::connect(self.proxy.addr()).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("proxy did not start listening");
        }

        async fn fetch(&self, path: &str) -> (u16, Vec<u8>) {
            let response = self
                .client
                .get(format!("http://{}{}", self.origin, path))
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            (status, response.bytes().await.unwrap().to_vec())
        }

        async fn wait_for_results(&self, query: &str, expected: usize) -> usize {
            let mut found = 0;
            for _ in 0..100 {
                found = self.index.search("test", query, 0, 10, false).unwrap().result_count;
                if found >= expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            found
        }

        async fn stop(self) {
            self.queue.shutdown().await;
            self.proxy.stop().await;
        }
    }

    #[test]
    fn proxy_config_with_port() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir).with_port(8888);
        assert_eq!(config.addr.port(), 8888);
    }

    #[test]
    fn proxy_config_with_addr() {
        let temp_dir = TempDir::new().unwrap();
        let addr = SocketAddr::from(([0, 0, 0, 0], 9999));
        let config = test_config(&temp_dir).with_addr(addr);
        assert_eq!(config.addr, addr);
    }

    #[test]
    fn proxy_config_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ProxyConfig::with_ca_dir(CaManager::new(temp_dir.path()));
        assert_eq!(config.addr.port(), DEFAULT_PROXY_PORT);
        assert_eq!(config.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);
    }

    #[test]
    fn proxy_server_new_generates_ca() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();
        assert!(server.ca_cert_path().exists());
        assert!(server
            .ca_cert_path()
            .to_string_lossy()
            .contains("historybook-ca.crt"));
    }

    #[test]
    fn zero_buffer_size_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir).with_max_buffer_size(0);
        assert!(matches!(ProxyServer::new(config), Err(ProxyError::Config(_))));
    }

    #[tokio::test]
    async fn proxy_handle_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();

        let handle = server.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn html_page_is_captured_and_searchable() {
        let harness = Harness::start(DEFAULT_MAX_BUFFER_SIZE).await;

        let (status, body) = harness.fetch("/page").await;
        assert_eq!(status, 200);
        assert_eq!(body, PAGE.as_bytes());

        assert_eq!(harness.wait_for_results("captured", 1).await, 1);
        let page = harness.index.search("test", "captured", 0, 10, false).unwrap();
        assert_eq!(page.results[0].title, "Proxy Page");
        assert_eq!(page.results[0].url, format!("http://{}/page", harness.origin));

        harness.stop().await;
    }

    #[tokio::test]
    async fn gzip_page_is_forwarded_raw_and_indexed_decoded() {
        let harness = Harness::start(DEFAULT_MAX_BUFFER_SIZE).await;

        let (status, body) = harness.fetch("/gzip").await;
        assert_eq!(status, 200);
        assert_eq!(body, gzip(PAGE.as_bytes()));

        assert_eq!(harness.wait_for_results("proxy", 1).await, 1);
        harness.stop().await;
    }

    #[tokio::test]
    async fn chunked_page_is_captured() {
        let harness = Harness::start(DEFAULT_MAX_BUFFER_SIZE).await;

        let (status, body) = harness.fetch("/chunked").await;
        assert_eq!(status, 200);
        assert_eq!(body, PAGE.as_bytes());

        assert_eq!(harness.wait_for_results("captured", 1).await, 1);
        harness.stop().await;
    }

    #[tokio::test]
    async fn large_responses_pass_through_unchanged() {
        let harness = Harness::start(DEFAULT_MAX_BUFFER_SIZE).await;

        let (status, body) = harness.fetch("/binary").await;
        assert_eq!(status, 200);
        let expected: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(body, expected);

        let (_, body) = harness.fetch("/large").await;
        assert!(body.len() >= 100_000);
        assert_eq!(body, large_html().as_bytes());

        assert_eq!(harness.wait_for_results("paragraph", 1).await, 1);
        harness.stop().await;
    }

    #[tokio::test]
    async fn oversized_page_is_forwarded_but_not_captured() {
        let harness = Harness::start(10_000).await;

        let (status, body) = harness.fetch("/large").await;
        assert_eq!(status, 200);
        assert_eq!(body, large_html().as_bytes());

        // A small page fetched afterwards is indexed, so the queue has caught up
        harness.fetch("/page").await;
        assert_eq!(harness.wait_for_results("captured", 1).await, 1);
        assert_eq!(
            harness
                .index
                .search("test", "paragraph", 0, 10, false)
                .unwrap()
                .result_count,
            0
        );
        harness.stop().await;
    }

    #[tokio::test]
    async fn streamed_non_html_passes_through_uncaptured() {
        let harness = Harness::start(DEFAULT_MAX_BUFFER_SIZE).await;

        let (status, body) = harness.fetch("/stream").await;
        assert_eq!(status, 200);
        assert!(body.len() >= 100_000);
        assert_eq!(body, plain_text());

        harness.fetch("/page").await;
        assert_eq!(harness.wait_for_results("captured", 1).await, 1);
        assert_eq!(
            harness
                .index
                .search("test", "plaintext", 0, 10, false)
                .unwrap()
                .result_count,
            0
        );
        harness.stop().await;
    }

    #[tokio::test]
    async fn error_responses_are_not_captured() {
        let harness = Harness::start(DEFAULT_MAX_BUFFER_SIZE).await;

        let (status, body) = harness.fetch("/missing").await;
        assert_eq!(status, 404);
        assert_eq!(body, b"<p>Not here</p>");

        harness.fetch("/page").await;
        assert_eq!(harness.wait_for_results("captured", 1).await, 1);
        assert_eq!(
            harness
                .index
                .search("test", "here", 0, 10, false)
                .unwrap()
                .result_count,
            0
        );
        harness.stop().await;
    }

    #[tokio::test]
    async fn default_selector_skips_local_origins() {
        let temp_dir = TempDir::new().unwrap();
        let index = Arc::new(HistoryIndex::in_memory().unwrap());
        let (queue, worker) = IndexQueue::start(index.clone());

        let port = free_port();
        let proxy = ProxyServer::new(test_config(&temp_dir).with_port(port))
            .unwrap()
            .with_filter_factory(IndexingFilterFactory::new("test", queue.clone()))
            .start()
            .unwrap();
        let origin = start_origin().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://127.0.0.1:{}", port)).unwrap())
            .build()
            .unwrap();
        let body = client
            .get(format!("http://{}/page", origin))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&body[..], PAGE.as_bytes());

        queue.shutdown().await;
        worker.join().await;
        let page = index.search("test", "captured", 0, 10, false).unwrap();
        assert_eq!(page.result_count, 0);

        proxy.stop().await;
    }
}
