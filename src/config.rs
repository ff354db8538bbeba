//! Runtime configuration: JSON file on disk plus environment overrides.
//! The live value sits behind a watch channel so the HTTP listener and the
//! clipboard poller can react to edits made by the settings layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::translate::normalize::ReplacementRule;

pub const DEFAULT_PORT: u16 = 17889;
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a translator. Translate the user's text into natural English. \
     Output only the translation, nothing else.";
pub const DEFAULT_CLIPBOARD_INTERVAL_MS: u64 = 1500;

const APP_DIR: &str = "textbridge";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid listener port: {0}")]
    InvalidPort(u16),
    #[error("config watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// Remote completion provider settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

/// Everything the core reads from the settings layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub server: ServerConfig,
    pub clipboard_watch: bool,
    pub clipboard_interval_ms: u64,
    pub openai_compatible_input: bool,
    pub replacement_rules: Vec<ReplacementRule>,
    pub data_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            server: ServerConfig::default(),
            clipboard_watch: false,
            clipboard_interval_ms: DEFAULT_CLIPBOARD_INTERVAL_MS,
            openai_compatible_input: false,
            replacement_rules: Vec::new(),
            data_dir: None,
        }
    }
}

impl AppConfig {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load the config file, falling back to defaults when it is missing or
    /// broken, then apply environment overrides.
    pub fn load_or_default(path: &Path) -> Self {
        let mut config = if path.exists() {
            Self::load(path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "config load failed, using defaults");
                Self::default()
            })
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Apply `TEXTBRIDGE_API_KEY` and `TRANSLATOR_PORT` from the given lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("TEXTBRIDGE_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.provider.api_key = key;
        }
        if let Some(port) = lookup("TRANSLATOR_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(e) => warn!(value = %port, error = %e, "ignoring TRANSLATOR_PORT"),
            }
        }
    }

    /// The listener port, rejecting values that cannot be bound deliberately.
    pub fn listener_port(&self) -> Result<u16, ConfigError> {
        match self.server.port {
            0 => Err(ConfigError::InvalidPort(0)),
            port => Ok(port),
        }
    }

    /// Directory holding the cache and history databases.
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
        })
    }
}

/// Path of the config file: `TEXTBRIDGE_CONFIG` or the platform config dir.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TEXTBRIDGE_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_default()
        .join(APP_DIR)
        .join(CONFIG_FILE)
}

/// Shared, observable configuration.
pub struct ConfigStore {
    tx: watch::Sender<Arc<AppConfig>>,
}

impl ConfigStore {
    pub fn new(config: AppConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self { tx }
    }

    /// Current snapshot (cheap clone of an Arc).
    pub fn current(&self) -> Arc<AppConfig> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AppConfig>> {
        self.tx.subscribe()
    }

    /// Edit the configuration in place and notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut AppConfig)) {
        self.tx.send_modify(|config| f(Arc::make_mut(config)));
    }

    /// Replace the configuration; subscribers are only woken on a real change.
    pub fn replace(&self, config: AppConfig) {
        self.tx.send_if_modified(|current| {
            if **current == config {
                return false;
            }
            *current = Arc::new(config);
            true
        });
    }
}

/// Watch the config file and push every successful re-read into `store`.
/// The returned watcher must be kept alive for as long as reloads are wanted.
pub fn watch_file(path: &Path, store: Arc<ConfigStore>) -> Result<RecommendedWatcher, ConfigError> {
    let file = path.to_path_buf();
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;

    let watched = file.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                && event.paths.iter().any(|p| p.file_name() == watched.file_name());
            if !relevant {
                return;
            }
            match AppConfig::load(&watched) {
                Ok(mut config) => {
                    config.apply_overrides(|name| std::env::var(name).ok());
                    store.replace(config);
                    info!(path = %watched.display(), "config reloaded");
                }
                Err(e) => warn!(error = %e, "config reload failed, keeping previous"),
            }
        }
        Err(e) => warn!(error = %e, "config watch error"),
    })?;

    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(path = %file.display(), "watching config file");
    Ok(watcher)
}
