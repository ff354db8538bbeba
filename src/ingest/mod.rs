//! Ingestion sources. Every source hands raw text to the same pipeline;
//! downstream code only sees where it came from.

pub mod clipboard;
pub mod http;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestSource {
    /// `POST /submit` (raw text or `{"text": ...}`).
    Http,
    /// `POST /v1/chat/completions` compatibility shape.
    CompatChat,
    Clipboard,
    /// Direct call from the presentation layer (e.g. retranslate).
    Manual,
}

impl std::fmt::Display for IngestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestSource::Http => write!(f, "http"),
            IngestSource::CompatChat => write!(f, "compat_chat"),
            IngestSource::Clipboard => write!(f, "clipboard"),
            IngestSource::Manual => write!(f, "manual"),
        }
    }
}
