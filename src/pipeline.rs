//! The translation pipeline: normalize → cache → stream → persist → broadcast.
//! This is the surface the presentation layer and the ingestion sources call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ConfigStore;
use crate::events::{Event, EventBus, ServerFault, Subscription, Topic, TranslationEvent};
use crate::history::{HistoryEntry, HistoryLog};
use crate::ingest::http::ListenerStatus;
use crate::ingest::IngestSource;
use crate::metrics::{metric_names, MetricSummary, MetricsRegistry};
use crate::state_machine::SessionStatus;
use crate::translate::cache::TranslationCache;
use crate::translate::normalize::Normalizer;
use crate::translate::session::{SessionDeps, SessionManager, TranslateOutcome};
use crate::translate::CompletionProvider;

/// Result of one ingestion event, mostly useful to callers that want to log
/// or test what the pipeline did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Empty after normalization; nothing published.
    Ignored,
    CacheHit,
    Started { session: u64 },
    Coalesced,
    Rejected(String),
}

pub struct Pipeline {
    config: Arc<ConfigStore>,
    normalizer: Normalizer,
    cache: Arc<TranslationCache>,
    history: Arc<HistoryLog>,
    bus: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
    sessions: SessionManager,
    listener: Arc<ListenerStatus>,
    last_text: Mutex<Option<String>>,
}

impl Pipeline {
    /// Build the pipeline and spawn its session actor on the current runtime.
    pub fn new(
        config: Arc<ConfigStore>,
        bus: Arc<EventBus>,
        cache: Arc<TranslationCache>,
        history: Arc<HistoryLog>,
        provider: Arc<dyn CompletionProvider>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let sessions = SessionManager::spawn(SessionDeps {
            provider,
            cache: Arc::clone(&cache),
            history: Arc::clone(&history),
            bus: Arc::clone(&bus),
            config: Arc::clone(&config),
            metrics: Arc::clone(&metrics),
        });
        Arc::new(Self {
            config,
            normalizer: Normalizer::new(),
            cache,
            history,
            bus,
            metrics,
            sessions,
            listener: Arc::new(ListenerStatus::default()),
            last_text: Mutex::new(None),
        })
    }

    /// Feed raw text from any source into the pipeline.
    pub async fn ingest(&self, raw: &str, source: IngestSource) -> IngestOutcome {
        let config = self.config.current();
        let text = self.normalizer.normalize(raw, &config.replacement_rules);
        if text.trim().is_empty() {
            debug!(%source, "ignoring empty input");
            return IngestOutcome::Ignored;
        }

        info!(%source, len = text.len(), "text ingested");
        *self.last_text.lock() = Some(text.clone());
        self.bus.publish(Event::IncomingText {
            text: text.clone(),
            source,
        });
        self.dispatch(text, false).await
    }

    async fn dispatch(&self, text: String, force: bool) -> IngestOutcome {
        let started = Instant::now();
        match self.sessions.translate(text.clone(), force).await {
            TranslateOutcome::CacheHit(translation) => {
                self.bus.publish(Event::Translation(TranslationEvent::Completed {
                    session: None,
                    original: text.clone(),
                    translation: translation.clone(),
                    cached: true,
                }));
                self.history.append(&text, &translation);
                self.metrics
                    .record_since(metric_names::CACHE_HIT_RESULT, started);
                IngestOutcome::CacheHit
            }
            TranslateOutcome::Started { session } => IngestOutcome::Started { session },
            TranslateOutcome::Coalesced => IngestOutcome::Coalesced,
            TranslateOutcome::Rejected(e) => IngestOutcome::Rejected(e.to_string()),
        }
    }

    /// Stop the active translation. Returns whether one was running.
    pub async fn cancel_current(&self) -> bool {
        self.sessions.cancel().await
    }

    /// Force a fresh translation of the last text seen, bypassing the cache.
    pub async fn retranslate_last(&self) -> IngestOutcome {
        let Some(text) = self.last_text.lock().clone() else {
            return IngestOutcome::Ignored;
        };
        info!(len = text.len(), "forced retranslation");
        self.dispatch(text, true).await
    }

    /// Cached translation for arbitrary text, without ingesting it.
    pub fn cached_translation(&self, text: &str) -> Option<String> {
        let key = text.trim();
        if key.is_empty() {
            return None;
        }
        self.cache.lookup(key)
    }

    pub fn last_text(&self) -> Option<String> {
        self.last_text.lock().clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.list()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.bus.subscribe(topic)
    }

    pub fn last_server_fault(&self) -> Option<ServerFault> {
        self.listener.last_fault()
    }

    pub fn session_status(&self) -> SessionStatus {
        self.sessions.status()
    }

    pub fn subscribe_session_status(&self) -> watch::Receiver<SessionStatus> {
        self.sessions.subscribe_status()
    }

    pub async fn in_flight(&self) -> Vec<String> {
        self.sessions.in_flight().await
    }

    pub fn metrics_summary(&self) -> HashMap<String, MetricSummary> {
        self.metrics.summary()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    pub fn history_log(&self) -> &Arc<HistoryLog> {
        &self.history
    }

    pub fn listener_status(&self) -> &Arc<ListenerStatus> {
        &self.listener
    }
}
