//! Translation: normalization, the two-tier cache, the streaming provider
//! client, and the session manager that ties them together.

pub mod cache;
pub mod normalize;
pub mod openai;
pub mod session;
pub mod sqlite_cache;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;

/// One chat-completion call: system prompt + the user's normalized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    pub user_text: String,
}

impl CompletionRequest {
    /// Build a request, failing before any network attempt when the provider
    /// is not usable.
    pub fn from_config(provider: &ProviderConfig, text: &str) -> Result<Self, TranslateError> {
        if provider.api_key.trim().is_empty() {
            return Err(TranslateError::MissingCredential);
        }
        if provider.base_url.trim().is_empty() {
            return Err(TranslateError::InvalidConfig("provider base URL is empty".into()));
        }
        if provider.model.trim().is_empty() {
            return Err(TranslateError::InvalidConfig("model identifier is empty".into()));
        }
        Ok(Self {
            base_url: provider.base_url.trim().to_string(),
            api_key: provider.api_key.trim().to_string(),
            model: provider.model.trim().to_string(),
            system_prompt: provider.system_prompt.clone(),
            user_text: text.to_string(),
        })
    }
}

/// Progress reported by a provider while it streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    /// The provider accepted the request; output follows.
    Accepted,
    Delta { delta: &'a str, accumulated: &'a str },
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("API key is not configured")]
    MissingCredential,
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider returned an empty translation")]
    EmptyResult,
    #[error("translation cancelled")]
    Cancelled,
}

/// A streaming chat-completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Stream a completion, reporting progress through `on_event`, and return
    /// the full text. Must return [`TranslateError::Cancelled`] promptly once
    /// `cancel` fires.
    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        on_event: &(dyn for<'a> Fn(StreamEvent<'a>) + Send + Sync),
    ) -> Result<String, TranslateError>;
}
