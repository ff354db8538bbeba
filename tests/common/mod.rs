#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use textbridge::config::{AppConfig, ConfigStore};
use textbridge::events::{Event, EventBus, Subscription};
use textbridge::history::HistoryLog;
use textbridge::metrics::MetricsRegistry;
use textbridge::pipeline::Pipeline;
use textbridge::translate::cache::{TranslationCache, DEFAULT_L1_CAPACITY};
use textbridge::translate::{CompletionProvider, CompletionRequest, StreamEvent, TranslateError};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn translation_of(text: &str) -> String {
    format!("[EN] {text}")
}

/// Provider that streams `"[EN] "` then the input text. While held, it
/// parks after the first delta until released or cancelled.
pub struct ScriptedProvider {
    calls: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    hold: watch::Sender<bool>,
    fail_status: Mutex<Option<u16>>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        let (hold, _) = watch::channel(false);
        Arc::new(Self {
            calls: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            hold,
            fail_status: Mutex::new(None),
        })
    }

    pub fn set_hold(&self, hold: bool) {
        self.hold.send_replace(hold);
    }

    /// Make every following call fail with this HTTP status.
    pub fn fail_with(&self, status: Option<u16>) {
        *self.fail_status.lock() = status;
    }

    pub fn calls_for(&self, text: &str) -> usize {
        self.calls.lock().get(text).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        on_event: &(dyn for<'a> Fn(StreamEvent<'a>) + Send + Sync),
    ) -> Result<String, TranslateError> {
        *self.calls.lock().entry(request.user_text.clone()).or_default() += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        if let Some(status) = *self.fail_status.lock() {
            return Err(TranslateError::Status {
                status,
                body: "scripted failure".into(),
            });
        }

        on_event(StreamEvent::Accepted);
        let mut text = String::from("[EN] ");
        on_event(StreamEvent::Delta {
            delta: "[EN] ",
            accumulated: &text,
        });

        let mut hold = self.hold.subscribe();
        loop {
            let held = *hold.borrow_and_update();
            if !held {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
                changed = hold.changed() => if changed.is_err() { break },
            }
        }
        if cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }

        text.push_str(&request.user_text);
        on_event(StreamEvent::Delta {
            delta: &request.user_text,
            accumulated: &text,
        });
        Ok(text)
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.provider.api_key = "test-key".into();
    config
}

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub provider: Arc<ScriptedProvider>,
    pub dir: TempDir,
}

/// Pipeline over fresh on-disk databases and a scripted provider.
/// Must be called inside a Tokio runtime.
pub fn harness(config: AppConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::default());
    let cache = Arc::new(
        TranslationCache::open(&dir.path().join("cache.sqlite3"), DEFAULT_L1_CAPACITY).unwrap(),
    );
    let history = HistoryLog::open(&dir.path().join("history.sqlite3"), Arc::clone(&bus)).unwrap();
    let provider = ScriptedProvider::new();
    let pipeline = Pipeline::new(
        Arc::new(ConfigStore::new(config)),
        bus,
        cache,
        history,
        Arc::clone(&provider) as Arc<dyn CompletionProvider>,
        Arc::new(MetricsRegistry::new()),
    );
    Harness {
        pipeline,
        provider,
        dir,
    }
}

/// Receive until `pred` matches, failing the test after `WAIT`.
pub async fn recv_until(sub: &mut Subscription, pred: impl Fn(&Event) -> bool) -> Event {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match sub.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await;
    match found {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for event on {}", sub.topic()),
    }
}

/// Poll `check` until it holds, failing the test after `WAIT`.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A localhost port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Clipboard stand-in whose content the test sets directly.
#[derive(Default)]
pub struct ScriptedClipboard {
    content: Mutex<Option<String>>,
    reads: AtomicUsize,
}

impl ScriptedClipboard {
    pub fn set(&self, text: &str) {
        *self.content.lock() = Some(text.to_string());
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl textbridge::ingest::clipboard::ClipboardSource for ScriptedClipboard {
    fn read_text(
        &self,
    ) -> Result<Option<String>, textbridge::ingest::clipboard::CaptureError> {
        let content = self.content.lock().clone();
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(content)
    }
}
