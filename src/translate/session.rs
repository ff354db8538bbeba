//! Completion session manager.
//!
//! A single actor task owns the in-flight key set and the one active
//! streaming session. Requests are handled strictly in arrival order, which
//! makes "cancel the running session" and "start the next one" atomic: the
//! actor cancels the old token, waits for that task to stop, releases its key,
//! and only then registers the new key and spawns the new stream.
//!
//! Results are committed by the actor too. A session task reports
//! `Finished` over a separate channel; if a newer session has superseded it
//! in the meantime the report is discarded, so a cancelled session can never
//! write to the cache or history. A cache hit for another key also
//! supersedes the running session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::cache::TranslationCache;
use super::{CompletionProvider, CompletionRequest, StreamEvent, TranslateError};
use crate::cancellation::{GenerationGuard, TaskGeneration};
use crate::config::ConfigStore;
use crate::events::{Event, EventBus, TranslationEvent};
use crate::history::HistoryLog;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::state_machine::{SessionPhase, SessionStatus, SessionTracker};

/// What happened to a translate request.
#[derive(Debug)]
pub enum TranslateOutcome {
    /// Served from the cache; no session was started.
    CacheHit(String),
    /// A new streaming session was started.
    Started { session: u64 },
    /// The same key is already being computed; this request rides on it and
    /// gets its own history entry when the session completes.
    Coalesced,
    /// Precondition failure (e.g. no credential); nothing was attempted.
    Rejected(TranslateError),
}

enum Command {
    Translate {
        text: String,
        force: bool,
        reply: oneshot::Sender<TranslateOutcome>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    InFlight {
        reply: oneshot::Sender<Vec<String>>,
    },
}

struct Finished {
    session: u64,
    result: Result<String, TranslateError>,
}

/// Shared services the actor needs.
pub struct SessionDeps {
    pub provider: Arc<dyn CompletionProvider>,
    pub cache: Arc<TranslationCache>,
    pub history: Arc<HistoryLog>,
    pub bus: Arc<EventBus>,
    pub config: Arc<ConfigStore>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Handle to the session actor.
pub struct SessionManager {
    tx: mpsc::UnboundedSender<Command>,
    tracker: Arc<SessionTracker>,
}

impl SessionManager {
    /// Spawn the actor on the current Tokio runtime. It stops (cancelling any
    /// active session) when the manager is dropped.
    pub fn spawn(deps: SessionDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(SessionTracker::new());

        let actor = SessionActor {
            deps,
            tracker: Arc::clone(&tracker),
            generations: TaskGeneration::new(),
            in_flight: HashSet::new(),
            active: None,
            finished_tx,
        };
        tokio::spawn(actor.run(rx, finished_rx));

        Self { tx, tracker }
    }

    /// Translate `text` (already normalized). With `force`, the cache and
    /// the in-flight check are bypassed.
    pub async fn translate(&self, text: String, force: bool) -> TranslateOutcome {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Translate { text, force, reply }).is_err() {
            return TranslateOutcome::Rejected(TranslateError::Api("session manager stopped".into()));
        }
        rx.await.unwrap_or_else(|_| {
            TranslateOutcome::Rejected(TranslateError::Api("session manager stopped".into()))
        })
    }

    /// Cancel the active session, if any. Returns whether one was running.
    pub async fn cancel(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Cancel { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Keys currently being computed.
    pub async fn in_flight(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::InFlight { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn status(&self) -> SessionStatus {
        self.tracker.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.tracker.subscribe()
    }
}

struct ActiveSession {
    id: u64,
    key: String,
    /// Requests coalesced onto this session after it started.
    riders: usize,
    guard: GenerationGuard,
    handle: JoinHandle<()>,
}

struct SessionActor {
    deps: SessionDeps,
    tracker: Arc<SessionTracker>,
    generations: TaskGeneration,
    in_flight: HashSet<String>,
    active: Option<ActiveSession>,
    finished_tx: mpsc::UnboundedSender<Finished>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut finished: mpsc::UnboundedReceiver<Finished>,
    ) {
        debug!("session actor started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(done) = finished.recv() => self.handle_finished(done).await,
            }
        }
        self.cancel_active().await;
        debug!("session actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Translate { text, force, reply } => {
                let outcome = self.start(text, force).await;
                let _ = reply.send(outcome);
            }
            Command::Cancel { reply } => {
                let cancelled = self.cancel_active().await;
                let _ = reply.send(cancelled);
            }
            Command::InFlight { reply } => {
                let _ = reply.send(self.in_flight.iter().cloned().collect());
            }
        }
    }

    async fn start(&mut self, text: String, force: bool) -> TranslateOutcome {
        if !force {
            if self.in_flight.contains(&text) {
                if let Some(active) = self.active.as_mut().filter(|a| a.key == text) {
                    active.riders += 1;
                }
                debug!(len = text.len(), "request coalesced onto in-flight key");
                return TranslateOutcome::Coalesced;
            }
            let lookup = self.deps.metrics.span(metric_names::CACHE_LOOKUP);
            let cached = self.deps.cache.lookup(&text);
            lookup.finish();
            if let Some(translation) = cached {
                // The newest event wins the display, so the stream it replaces stops.
                if self.active.is_some() {
                    self.cancel_active().await;
                }
                return TranslateOutcome::CacheHit(translation);
            }
        }

        let config = self.deps.config.current();
        let request = match CompletionRequest::from_config(&config.provider, &text) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "translation precondition failed");
                self.deps.bus.publish(Event::Translation(TranslationEvent::Failed {
                    session: None,
                    original: text,
                    message: e.to_string(),
                }));
                return TranslateOutcome::Rejected(e);
            }
        };

        self.cancel_active().await;

        let guard = self.generations.cancel_and_advance();
        let session = guard.my_generation();
        if let Err(e) = self.tracker.begin(session) {
            warn!(session, error = %e, "session tracker out of step");
        }
        self.in_flight.insert(text.clone());
        self.deps.bus.publish(Event::Translation(TranslationEvent::Requesting {
            session,
            original: text.clone(),
        }));

        let trace_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("session", id = session, trace_id = %trace_id);
        let task = SessionTask {
            session,
            request,
            guard: guard.clone(),
            provider: Arc::clone(&self.deps.provider),
            bus: Arc::clone(&self.deps.bus),
            tracker: Arc::clone(&self.tracker),
            metrics: Arc::clone(&self.deps.metrics),
            finished_tx: self.finished_tx.clone(),
        };
        let handle = tokio::spawn(task.run().instrument(span));

        info!(session, force, len = text.len(), "translation session started");
        self.active = Some(ActiveSession {
            id: session,
            key: text,
            riders: 0,
            guard,
            handle,
        });
        TranslateOutcome::Started { session }
    }

    /// Cancel the active session, wait for its stream to stop, and release
    /// its key. No-op when idle.
    async fn cancel_active(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        let started = Instant::now();
        active.guard.cancel();
        if let Err(e) = active.handle.await {
            warn!(session = active.id, error = %e, "session task ended abnormally");
        }
        self.in_flight.remove(&active.key);
        let _ = self.tracker.transition(active.id, SessionPhase::Cancelled);
        self.deps.metrics.record_since(metric_names::CANCEL_LATENCY, started);
        self.deps.bus.publish(Event::Translation(TranslationEvent::Cancelled {
            session: active.id,
            original: active.key,
        }));
        info!(session = active.id, "translation session cancelled");
        true
    }

    async fn handle_finished(&mut self, done: Finished) {
        if self.active.as_ref().map(|a| a.id) != Some(done.session) {
            debug!(session = done.session, "discarding result of superseded session");
            return;
        }
        let Some(active) = self.active.take() else {
            return;
        };

        match done.result {
            Ok(translation) => {
                let cache = Arc::clone(&self.deps.cache);
                let (key, value) = (active.key.clone(), translation.clone());
                match tokio::task::spawn_blocking(move || cache.store(&key, &value)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        warn!(session = active.id, error = %e, "cache write failed, showing result anyway")
                    }
                    Err(e) => warn!(session = active.id, error = %e, "cache write task panicked"),
                }
                for _ in 0..=active.riders {
                    self.deps.history.append(&active.key, &translation);
                }
                self.in_flight.remove(&active.key);
                let _ = self.tracker.transition(active.id, SessionPhase::Completed);
                self.deps.bus.publish(Event::Translation(TranslationEvent::Completed {
                    session: Some(active.id),
                    original: active.key,
                    translation,
                    cached: false,
                }));
                info!(session = active.id, "translation session completed");
            }
            Err(TranslateError::Cancelled) => {
                self.in_flight.remove(&active.key);
                let _ = self.tracker.transition(active.id, SessionPhase::Cancelled);
                self.deps.bus.publish(Event::Translation(TranslationEvent::Cancelled {
                    session: active.id,
                    original: active.key,
                }));
            }
            Err(e) => {
                self.in_flight.remove(&active.key);
                let _ = self.tracker.transition(active.id, SessionPhase::Failed);
                warn!(session = active.id, error = %e, "translation session failed");
                self.deps.bus.publish(Event::Translation(TranslationEvent::Failed {
                    session: Some(active.id),
                    original: active.key,
                    message: e.to_string(),
                }));
            }
        }
    }
}

/// Everything a spawned stream needs; owns no shared mutable state.
struct SessionTask {
    session: u64,
    request: CompletionRequest,
    guard: GenerationGuard,
    provider: Arc<dyn CompletionProvider>,
    bus: Arc<EventBus>,
    tracker: Arc<SessionTracker>,
    metrics: Arc<MetricsRegistry>,
    finished_tx: mpsc::UnboundedSender<Finished>,
}

impl SessionTask {
    async fn run(self) {
        let started = Instant::now();
        let first_chunk = AtomicBool::new(false);
        let session = self.session;
        let guard = &self.guard;

        let on_event = |event: StreamEvent<'_>| {
            if !guard.should_continue() {
                return;
            }
            match event {
                StreamEvent::Accepted => {
                    let _ = self.tracker.transition(session, SessionPhase::Streaming);
                }
                StreamEvent::Delta { delta, accumulated } => {
                    if !first_chunk.swap(true, Ordering::Relaxed) {
                        self.metrics
                            .record_since(metric_names::TRANSLATE_FIRST_CHUNK, started);
                    }
                    self.bus.publish(Event::Translation(TranslationEvent::Partial {
                        session,
                        delta: delta.to_string(),
                        accumulated: accumulated.to_string(),
                    }));
                }
            }
        };

        let result = self
            .provider
            .stream(&self.request, guard.token(), &on_event)
            .await;

        if !guard.should_continue() {
            debug!(session, "stream stopped after cancellation");
            return;
        }

        let result = match result {
            Ok(text) if text.trim().is_empty() => Err(TranslateError::EmptyResult),
            Ok(text) => {
                self.metrics.record_since(metric_names::TRANSLATE_DONE, started);
                Ok(text)
            }
            Err(e) => Err(e),
        };
        let _ = self.finished_tx.send(Finished { session, result });
    }
}
