//! HistoryBook - searchable personal browsing history.
//!
//! This is the main binary that runs the full HistoryBook application:
//! - MITM proxy capturing HTML pages into the history index
//! - HTTP API for searching the index and indexing pages directly

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use historybook_index::{HistoryIndex, PageIndex};
use historybook_proxy::{
    CaManager, IndexQueue, IndexingFilterFactory, ProxyConfig, ProxyServer, DEFAULT_MAX_BUFFER_SIZE,
    DEFAULT_PROXY_PORT,
};
use historybook_server::{AppState, Server, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// HistoryBook - full-text search over the pages you browse
#[derive(Parser, Debug)]
#[command(name = "historybook", version, about)]
struct Args {
    /// Directory holding the index, CA and logs
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Collection captured pages are filed under
    #[arg(long, default_value = "default")]
    collection: String,

    /// Port for the capturing proxy
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    proxy_port: u16,

    /// Port for the search API
    #[arg(long, default_value_t = DEFAULT_PORT)]
    api_port: u16,

    /// Host both listeners bind to
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Largest decoded page body captured, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER_SIZE)]
    max_buffer_size: usize,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        ProjectDirs::from("org", "historybook", "HistoryBook")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .context("could not determine a data directory, pass --data-dir")
    }

    fn log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}

/// Initialize logging to the console and a daily rolling file.
fn init_logging(args: &Args, log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("historybook={},warn", args.log_level())));

    if std::fs::create_dir_all(log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("historybook")
            .filename_suffix("log")
            .build(log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let data_dir = args.data_dir()?;

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args, &data_dir.join("logs"));

    tracing::info!("Starting HistoryBook...");
    tracing::info!("Args: {:?}", args);

    let index = Arc::new(
        HistoryIndex::open(&data_dir)
            .with_context(|| format!("failed to open index in {}", data_dir.display()))?,
    );
    let (queue, worker) = IndexQueue::start(Arc::clone(&index) as Arc<dyn PageIndex>);

    let proxy_addr: SocketAddr = format!("{}:{}", args.host, args.proxy_port)
        .parse()
        .context("invalid proxy address")?;
    let proxy_config = ProxyConfig::with_ca_dir(CaManager::new(data_dir.join("ca")))
        .with_addr(proxy_addr)
        .with_max_buffer_size(args.max_buffer_size);
    let proxy = ProxyServer::new(proxy_config)?
        .with_filter_factory(IndexingFilterFactory::new(args.collection.clone(), queue.clone()));
    tracing::info!("CA certificate: {:?}", proxy.ca_cert_path());
    let proxy = proxy.start()?;
    tracing::info!("Capturing proxy on {} (collection {:?})", proxy.addr(), args.collection);

    let server_config = ServerConfig::default()
        .with_host(args.host.clone())
        .with_port(args.api_port);
    let server = Server::new(server_config, AppState::new(Arc::clone(&index) as Arc<dyn PageIndex>))?;
    tracing::info!("Search API on http://{}", server.addr());

    // The API server owns the foreground until Ctrl-C
    let served = server.run_until(shutdown_signal()).await;

    proxy.stop().await;
    queue.shutdown().await;
    worker.join().await;
    index.close()?;

    served?;
    tracing::info!("HistoryBook shut down");
    Ok(())
}
