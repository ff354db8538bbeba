//! OpenAI-compatible chat/completions streaming client.
//! Connection pooling via reqwest, manual SSE parsing. No retries and no
//! overall timeout: a request runs until `[DONE]`, an error, or the
//! cancellation token fires. A body that closes before `[DONE]` is an error
//! so a truncated translation never reaches the cache.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{CompletionProvider, CompletionRequest, StreamEvent, TranslateError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 200;

pub struct OpenAiClient {
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new() -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TranslateError::Api(e.to_string()))?;
        Ok(Self { http })
    }
}

/// `{base_url}/chat/completions`, tolerating a trailing slash.
pub fn endpoint(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

pub fn build_body(request: &CompletionRequest) -> serde_json::Value {
    serde_json::json!({
        "model": request.model,
        "messages": [
            {"role": "system", "content": request.system_prompt},
            {"role": "user", "content": request.user_text}
        ],
        "stream": true
    })
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        on_event: &(dyn for<'a> Fn(StreamEvent<'a>) + Send + Sync),
    ) -> Result<String, TranslateError> {
        let send = self
            .http
            .post(endpoint(&request.base_url))
            .bearer_auth(&request.api_key)
            .json(&build_body(request))
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
            result = send => result.map_err(|e| TranslateError::Api(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
                body = response.text() => body.unwrap_or_default(),
            };
            return Err(TranslateError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }
        on_event(StreamEvent::Accepted);

        let mut full_text = String::new();
        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();
        let mut done = false;

        while !done {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                warn!(received = full_text.len(), "stream closed without [DONE]");
                return Err(TranslateError::Api("stream ended before [DONE]".into()));
            };
            let bytes = chunk.map_err(|e| TranslateError::Api(e.to_string()))?;

            for data in decoder.push(&bytes) {
                match data {
                    SseData::Delta(delta) => {
                        full_text.push_str(&delta);
                        on_event(StreamEvent::Delta {
                            delta: &delta,
                            accumulated: &full_text,
                        });
                    }
                    SseData::Error(message) => return Err(TranslateError::Api(message)),
                    SseData::Done => done = true,
                }
            }
        }

        Ok(full_text)
    }
}

/// One decoded `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseData {
    Delta(String),
    Error(String),
    Done,
}

/// Incremental SSE line decoder. Buffers raw bytes so multi-byte characters
/// split across network chunks decode correctly.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseData> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                out.push(SseData::Done);
                continue;
            }

            match serde_json::from_str::<SseChunk>(data) {
                Ok(parsed) => {
                    if let Some(error) = parsed.error {
                        out.push(SseData::Error(error.message));
                        continue;
                    }
                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)
                        .filter(|content| !content.is_empty());
                    if let Some(content) = content {
                        out.push(SseData::Delta(content));
                    }
                }
                Err(e) => warn!(error = %e, "skipping unparsable SSE payload"),
            }
        }
        out
    }
}

// --- SSE response types ---

#[derive(Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
    error: Option<SseError>,
}

#[derive(Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
}

#[derive(Deserialize, Default)]
struct SseDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct SseError {
    message: String,
}
