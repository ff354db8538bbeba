//! textbridge: translation intake and caching core.
//! Text arrives over local HTTP or from the clipboard, is normalized, served
//! from a two-tier cache when possible, and otherwise streamed from an
//! OpenAI-compatible completion endpoint. Results fan out over an event bus.

pub mod cancellation;
pub mod config;
pub mod events;
pub mod history;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod state_machine;
pub mod translate;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::{AppConfig, ConfigStore};
use events::EventBus;
use history::HistoryLog;
use ingest::clipboard::{spawn_clipboard_poller, SystemClipboard};
use ingest::http::spawn_listener;
use metrics::MetricsRegistry;
use pipeline::Pipeline;
use translate::cache::{TranslationCache, DEFAULT_L1_CAPACITY};
use translate::openai::OpenAiClient;

const CACHE_DB: &str = "translation_cache.sqlite3";
const HISTORY_DB: &str = "history.sqlite3";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("textbridge=debug"));
    let json = std::env::var("TEXTBRIDGE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the service until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    info!("textbridge starting");

    let config_path = config::config_path();
    let config = AppConfig::load_or_default(&config_path);
    let data_dir = config.resolve_data_dir();
    if config.provider.api_key.trim().is_empty() {
        warn!("no API key configured, cache misses will be rejected");
    }

    let store = Arc::new(ConfigStore::new(config));
    let bus = Arc::new(EventBus::default());
    let metrics = Arc::new(MetricsRegistry::new());

    let cache = Arc::new(
        TranslationCache::open_or_memory(&data_dir.join(CACHE_DB), DEFAULT_L1_CAPACITY)
            .context("opening translation cache")?,
    );
    let history = HistoryLog::open(&data_dir.join(HISTORY_DB), Arc::clone(&bus)).unwrap_or_else(
        |e| {
            warn!(error = %e, "history database unavailable, keeping history in memory");
            HistoryLog::in_memory(Arc::clone(&bus))
        },
    );
    let provider = Arc::new(OpenAiClient::new().context("building HTTP client")?);

    let pipeline = Pipeline::new(
        Arc::clone(&store),
        bus,
        cache,
        Arc::clone(&history),
        provider,
        metrics,
    );

    let _watcher = match config::watch_file(&config_path, Arc::clone(&store)) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "config hot reload disabled");
            None
        }
    };

    let shutdown = CancellationToken::new();
    let listener = spawn_listener(Arc::clone(&pipeline), shutdown.clone());
    let clipboard = spawn_clipboard_poller(
        Arc::clone(&pipeline),
        Arc::new(SystemClipboard),
        shutdown.clone(),
    );
    info!(data_dir = %data_dir.display(), "textbridge ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");

    shutdown.cancel();
    pipeline.cancel_current().await;
    for task in [listener, clipboard] {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    history.flush().await;
    info!("textbridge stopped");
    Ok(())
}
