//! In-process pub/sub between ingestion and the presentation surfaces.
//! One broadcast channel per topic: publishers never wait on subscribers,
//! and a subscription deregisters itself when dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::ingest::IngestSource;

/// Buffered events per topic before a slow subscriber starts lagging.
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    IncomingText,
    Translation,
    HistoryUpdated,
    ServerFault,
}

impl Topic {
    fn index(self) -> usize {
        match self {
            Topic::IncomingText => 0,
            Topic::Translation => 1,
            Topic::HistoryUpdated => 2,
            Topic::ServerFault => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::IncomingText => "incoming-text",
            Topic::Translation => "translation",
            Topic::HistoryUpdated => "history-updated",
            Topic::ServerFault => "server-fault",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The HTTP listener could not serve on `port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFault {
    pub port: u16,
    pub message: String,
}

/// Progress of one translation. `session` is `None` for results that never
/// reached the network (cache hits, precondition failures).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TranslationEvent {
    Requesting {
        session: u64,
        original: String,
    },
    Partial {
        session: u64,
        delta: String,
        accumulated: String,
    },
    Completed {
        session: Option<u64>,
        original: String,
        translation: String,
        cached: bool,
    },
    Cancelled {
        session: u64,
        original: String,
    },
    Failed {
        session: Option<u64>,
        original: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
pub enum Event {
    IncomingText { text: String, source: IngestSource },
    Translation(TranslationEvent),
    HistoryUpdated { len: usize },
    ServerFault(ServerFault),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::IncomingText { .. } => Topic::IncomingText,
            Event::Translation(_) => Topic::Translation,
            Event::HistoryUpdated { .. } => Topic::HistoryUpdated,
            Event::ServerFault(_) => Topic::ServerFault,
        }
    }
}

pub struct EventBus {
    senders: [broadcast::Sender<Event>; 4],
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            senders: std::array::from_fn(|_| broadcast::channel(capacity).0),
        }
    }

    /// Deliver to every current subscriber of the event's topic.
    /// Returns how many subscribers received it.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();
        match self.senders[topic.index()].send(event) {
            Ok(delivered) => delivered,
            Err(_) => {
                debug!(%topic, "event dropped, no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic,
            rx: self.senders[topic.index()].subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.senders[topic.index()].receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

/// A listener on one topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event, or `None` once the bus is gone. Skips over events lost
    /// to lag instead of failing.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
