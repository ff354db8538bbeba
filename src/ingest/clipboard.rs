//! Clipboard watcher. Samples the system clipboard on a blocking thread at
//! the configured interval and forwards changed text into the pipeline.
//!
//! Each time watching is switched on, the current content becomes the
//! baseline and is never forwarded; only later changes are.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::IngestSource;
use crate::pipeline::Pipeline;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard read failed: {0}")]
    ReadFailed(String),
}

/// Anything that can be sampled for text. Reads may block.
pub trait ClipboardSource: Send + Sync {
    /// Current text content, or `None` when the clipboard holds no text.
    fn read_text(&self) -> Result<Option<String>, CaptureError>;
}

/// The OS clipboard via `arboard`. A handle is opened per read so nothing
/// platform-bound is held across samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl ClipboardSource for SystemClipboard {
    fn read_text(&self) -> Result<Option<String>, CaptureError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|e| CaptureError::Unavailable(e.to_string()))?;
        match clipboard.get_text() {
            Ok(text) => Ok(Some(text)),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(CaptureError::ReadFailed(e.to_string())),
        }
    }
}

/// Baseline and duplicate suppression for clipboard samples.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    baseline_taken: bool,
    last: Option<String>,
}

impl ChangeDetector {
    /// Forget everything; the next sample becomes the new baseline.
    pub fn reset(&mut self) {
        self.baseline_taken = false;
        self.last = None;
    }

    /// Feed one sample. Returns the text to forward, if any.
    pub fn observe(&mut self, sample: Option<String>) -> Option<String> {
        let sample = sample
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if !self.baseline_taken {
            self.baseline_taken = true;
            self.last = sample;
            return None;
        }

        let text = sample?;
        if self.last.as_deref() == Some(text.as_str()) {
            return None;
        }
        self.last = Some(text.clone());
        Some(text)
    }
}

/// Spawn the poller. It follows `clipboard_watch` and
/// `clipboard_interval_ms` from the live configuration and stops on
/// `shutdown`.
pub fn spawn_clipboard_poller(
    pipeline: Arc<Pipeline>,
    source: Arc<dyn ClipboardSource>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(poll_loop(pipeline, source, shutdown))
}

async fn poll_loop(
    pipeline: Arc<Pipeline>,
    source: Arc<dyn ClipboardSource>,
    shutdown: CancellationToken,
) {
    let mut config_rx = pipeline.config().subscribe();
    let mut detector = ChangeDetector::default();
    let mut watching = false;

    loop {
        let config = Arc::clone(&config_rx.borrow_and_update());

        if !config.clipboard_watch {
            if watching {
                info!("clipboard watch disabled");
                watching = false;
            }
            detector.reset();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = config_rx.changed() => if changed.is_err() { break },
            }
            continue;
        }
        if !watching {
            info!(interval_ms = config.clipboard_interval_ms, "clipboard watch enabled");
            watching = true;
        }

        let reader = Arc::clone(&source);
        let sample = match tokio::task::spawn_blocking(move || reader.read_text()).await {
            Ok(result) => result,
            Err(e) => Err(CaptureError::Unavailable(e.to_string())),
        };
        match sample {
            Ok(sample) => {
                if let Some(text) = detector.observe(sample) {
                    debug!(len = text.len(), "clipboard changed");
                    pipeline.ingest(&text, IngestSource::Clipboard).await;
                }
            }
            Err(e) => warn!(error = %e, "clipboard poll failed"),
        }

        let interval = Duration::from_millis(config.clipboard_interval_ms).max(MIN_INTERVAL);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
            changed = config_rx.changed() => if changed.is_err() { break },
        }
    }
    debug!("clipboard poller stopped");
}
