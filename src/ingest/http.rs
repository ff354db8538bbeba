//! Local HTTP ingestion on `127.0.0.1:<port>`.
//!
//! `POST /submit` takes raw text (or `{"text": ...}` when sent as JSON) and
//! always answers 200. `POST /v1/chat/completions` accepts the OpenAI chat
//! shape when the compatibility flag is on; it ingests the last user message
//! and always answers 404 so callers never mistake it for a real completion.
//!
//! The listener is supervised: a bind failure is reported as a
//! `server-fault` event and the supervisor waits for the next configuration
//! change before trying again. A port change rebinds gracefully.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::IngestSource;
use crate::events::{Event, ServerFault};
use crate::pipeline::Pipeline;

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    RawText(String),
    CompatChat(ChatCompletionRequest),
}

impl Submission {
    /// The text to ingest, if the submission carries any.
    pub fn into_text(self) -> Option<String> {
        let text = match self {
            Submission::RawText(text) => Some(text),
            Submission::CompatChat(request) => request.last_user_text(),
        };
        text.filter(|t| !t.trim().is_empty())
    }

    pub fn source(&self) -> IngestSource {
        match self {
            Submission::RawText(_) => IngestSource::Http,
            Submission::CompatChat(_) => IngestSource::CompatChat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContentPart {
    #[serde(default)]
    pub text: Option<String>,
}

impl ChatCompletionRequest {
    /// Content of the last `user` message: the string itself, or the first
    /// non-empty text part.
    pub fn last_user_text(&self) -> Option<String> {
        let message = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role.eq_ignore_ascii_case("user"))?;
        let text = match message.content.as_ref()? {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .find(|t| !t.trim().is_empty())?
                .to_string(),
        };
        Some(text.trim().to_string()).filter(|t| !t.is_empty())
    }
}

#[derive(Deserialize)]
struct SubmitJson {
    text: String,
}

/// Decode a `/submit` body. JSON bodies must be `{"text": ...}`; anything
/// else is taken verbatim as UTF-8 text.
pub fn decode_submit(content_type: Option<&str>, body: &[u8]) -> Option<Submission> {
    let is_json = content_type
        .map(|ct| ct.trim().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);

    let text = if is_json {
        serde_json::from_slice::<SubmitJson>(body).ok()?.text
    } else {
        std::str::from_utf8(body).ok()?.to_string()
    };
    (!text.trim().is_empty()).then_some(Submission::RawText(text))
}

/// Decode an OpenAI-style chat completion body.
pub fn decode_compat(body: &[u8]) -> Option<Submission> {
    serde_json::from_slice::<ChatCompletionRequest>(body)
        .ok()
        .map(Submission::CompatChat)
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/submit", post(submit))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(pipeline)
}

async fn submit(
    State(pipeline): State<Arc<Pipeline>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    debug!(len = body.len(), "received /submit");

    match decode_submit(content_type, &body) {
        Some(submission) => {
            let source = submission.source();
            if let Some(text) = submission.into_text() {
                pipeline.ingest(&text, source).await;
            }
        }
        None => debug!("undecodable /submit body ignored"),
    }
    StatusCode::OK
}

async fn chat_completions(State(pipeline): State<Arc<Pipeline>>, body: Bytes) -> StatusCode {
    if !pipeline.config().current().openai_compatible_input {
        return StatusCode::NOT_FOUND;
    }

    let text = decode_compat(&body).and_then(Submission::into_text);
    match text {
        Some(text) => {
            debug!(len = text.len(), "received compatible chat completion");
            pipeline.ingest(&text, IngestSource::CompatChat).await;
        }
        None => warn!("compatible chat request without a user message"),
    }
    StatusCode::NOT_FOUND
}

/// Serve the ingestion routes on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// What the supervisor last observed about the listener.
#[derive(Default)]
pub struct ListenerStatus {
    fault: Mutex<Option<ServerFault>>,
    bound: Mutex<Option<SocketAddr>>,
}

impl ListenerStatus {
    pub fn last_fault(&self) -> Option<ServerFault> {
        self.fault.lock().clone()
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    fn record_fault(&self, fault: ServerFault) {
        *self.bound.lock() = None;
        *self.fault.lock() = Some(fault);
    }

    fn record_bound(&self, addr: SocketAddr) {
        *self.fault.lock() = None;
        *self.bound.lock() = Some(addr);
    }

    fn clear_bound(&self) {
        *self.bound.lock() = None;
    }
}

/// Spawn the listener supervisor. It runs until `shutdown` fires or the
/// configuration store goes away.
pub fn spawn_listener(pipeline: Arc<Pipeline>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(supervise(pipeline, shutdown))
}

async fn supervise(pipeline: Arc<Pipeline>, shutdown: CancellationToken) {
    let mut config_rx = pipeline.config().subscribe();
    let status = Arc::clone(pipeline.listener_status());

    loop {
        let config = Arc::clone(&config_rx.borrow_and_update());

        let bound = match config.listener_port() {
            Ok(port) => {
                let addr = SocketAddr::from(([127, 0, 0, 1], port));
                TcpListener::bind(addr)
                    .await
                    .map(|listener| (port, listener))
                    .map_err(|e| (port, e.to_string()))
            }
            Err(e) => Err((config.server.port, e.to_string())),
        };

        match bound {
            Ok((port, listener)) => {
                let addr = listener
                    .local_addr()
                    .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], port)));
                status.record_bound(addr);
                info!(%addr, "HTTP listener bound");

                let stop = shutdown.child_token();
                let mut server = tokio::spawn(serve(listener, Arc::clone(&pipeline), stop.clone()));

                // Keep serving until the port changes, the server dies, or we shut down.
                let keep_going = loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break false,
                        result = &mut server => {
                            match result {
                                Ok(Ok(())) => warn!(%addr, "HTTP listener stopped"),
                                Ok(Err(e)) => warn!(%addr, error = %e, "HTTP listener failed"),
                                Err(e) => warn!(%addr, error = %e, "HTTP listener task panicked"),
                            }
                            status.clear_bound();
                            break wait_for_change(&mut config_rx, &shutdown).await;
                        }
                        changed = config_rx.changed() => {
                            if changed.is_err() {
                                break false;
                            }
                            let next = config_rx.borrow().server.port;
                            if next != port {
                                info!(old = port, new = next, "listener port changed, rebinding");
                                break true;
                            }
                        }
                    }
                };

                stop.cancel();
                if !server.is_finished() {
                    let _ = server.await;
                }
                status.clear_bound();
                if !keep_going {
                    break;
                }
            }
            Err((port, message)) => {
                warn!(port, error = %message, "HTTP listener unavailable");
                let fault = ServerFault { port, message };
                status.record_fault(fault.clone());
                pipeline.bus().publish(Event::ServerFault(fault));
                if !wait_for_change(&mut config_rx, &shutdown).await {
                    break;
                }
            }
        }
    }
    debug!("listener supervisor stopped");
}

/// Wait for any configuration change. Returns false on shutdown.
async fn wait_for_change(
    config_rx: &mut tokio::sync::watch::Receiver<Arc<crate::config::AppConfig>>,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        changed = config_rx.changed() => changed.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_raw_text_is_verbatim() {
        let submission = decode_submit(Some("text/plain"), "  こんにちは \n".as_bytes());
        assert_eq!(submission, Some(Submission::RawText("  こんにちは \n".into())));
        assert_eq!(
            decode_submit(None, b"hello").and_then(Submission::into_text),
            Some("hello".into())
        );
    }

    #[test]
    fn submit_json_requires_text_field() {
        assert_eq!(
            decode_submit(Some("application/json; charset=utf-8"), br#"{"text":"abc"}"#),
            Some(Submission::RawText("abc".into()))
        );
        assert_eq!(decode_submit(Some("application/json"), br#"{"body":"abc"}"#), None);
        assert_eq!(decode_submit(Some("application/json"), b"abc"), None);
    }

    #[test]
    fn submit_rejects_empty_and_invalid_utf8() {
        assert_eq!(decode_submit(None, b"   "), None);
        assert_eq!(decode_submit(None, &[0xff, 0xfe]), None);
    }

    #[test]
    fn compat_takes_last_user_message() {
        let body = br#"{"model":"x","messages":[
            {"role":"system","content":"sys"},
            {"role":"user","content":"first"},
            {"role":"assistant","content":"reply"},
            {"role":"user","content":"  second  "}
        ]}"#;
        let text = decode_compat(body).and_then(Submission::into_text);
        assert_eq!(text, Some("second".into()));
    }

    #[test]
    fn compat_content_parts_use_first_non_empty_text() {
        let body = br#"{"messages":[{"role":"user","content":[
            {"type":"image_url"},
            {"type":"text","text":"  "},
            {"type":"text","text":"line"},
            {"type":"text","text":"other"}
        ]}]}"#;
        let text = decode_compat(body).and_then(Submission::into_text);
        assert_eq!(text, Some("line".into()));
    }

    #[test]
    fn compat_without_user_message_yields_nothing() {
        let body = br#"{"messages":[{"role":"system","content":"sys"}]}"#;
        let submission = decode_compat(body).unwrap();
        assert_eq!(submission.source(), IngestSource::CompatChat);
        assert_eq!(submission.into_text(), None);
        assert_eq!(decode_compat(b"not json"), None);
    }
}
