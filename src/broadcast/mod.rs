//! Real-time fan-out to WebSocket clients.
//!
//! Connections register with a bounded outbound queue and start
//! unauthenticated. Events go either to every connection or to the
//! subscribers of one topic. Delivery is best-effort: a full or closed
//! queue drops the event for that connection only.

mod auth;
pub mod message;
mod registry;

pub use auth::{Claims, Credentials, Principal, TokenVerifier};
pub use message::{ClientMessage, Envelope};
pub use registry::{ConnectionId, ConnectionState, Registry};

use serde_json::Value as JsonValue;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Outbound events buffered per connection before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BroadcastError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection is not authenticated")]
    NotAuthenticated,
    #[error("{0}")]
    InvalidCredentials(String),
}

pub struct Broadcaster {
    registry: Mutex<Registry>,
    verifier: TokenVerifier,
    queue_capacity: usize,
}

impl Broadcaster {
    pub fn new(verifier: TokenVerifier) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            verifier,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new, unauthenticated connection.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.registry().register(tx);
        info!(connection = %id, "client connected");
        (id, rx)
    }

    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        self.registry().state(id)
    }

    pub fn authenticate(
        &self,
        id: ConnectionId,
        credentials: &Credentials,
    ) -> Result<Principal, BroadcastError> {
        // Verify before taking the lock; only the state flip happens under it.
        let principal = match self.verifier.verify(credentials) {
            Ok(principal) => principal,
            Err(e) => {
                warn!(connection = %id, error = %e, "authentication failed");
                return Err(e);
            }
        };
        self.registry().authenticate(id, principal.clone())?;
        info!(connection = %id, subject = %principal.subject, "client authenticated");
        Ok(principal)
    }

    pub fn subscribe(&self, id: ConnectionId, topic: &str) -> Result<(), BroadcastError> {
        let added = self.registry().subscribe(id, topic)?;
        debug!(connection = %id, topic, added, "subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) -> Result<(), BroadcastError> {
        let removed = self.registry().unsubscribe(id, topic)?;
        debug!(connection = %id, topic, removed, "unsubscribed");
        Ok(())
    }

    pub fn disconnect(&self, id: ConnectionId) {
        let mut registry = self.registry();
        let topics = registry.topics_of(id).len();
        if registry.remove(id) {
            info!(connection = %id, topics, "client disconnected");
        }
    }

    /// Send to every connection. Returns how many queues accepted the event.
    pub fn broadcast_global(&self, event: &str, data: JsonValue) -> usize {
        let envelope = Envelope::new(event, data);
        let registry = self.registry();
        let delivered = registry
            .all()
            .filter(|(id, sender)| offer(*id, sender, envelope.clone()))
            .count();
        debug!(event, delivered, "global broadcast");
        delivered
    }

    /// Send to the subscribers of `topic`. Returns how many queues accepted the event.
    pub fn broadcast_to_topic(&self, topic: &str, event: &str, data: JsonValue) -> usize {
        let envelope = Envelope::new(event, data);
        let registry = self.registry();
        let delivered = registry
            .subscribers(topic)
            .filter(|(id, sender)| offer(*id, sender, envelope.clone()))
            .count();
        debug!(topic, event, delivered, "topic broadcast");
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.registry().connection_count()
    }

    pub fn topic_count(&self) -> usize {
        self.registry().topic_count()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry().subscriber_count(topic)
    }
}

/// Non-blocking enqueue; never waits on a slow client.
fn offer(id: ConnectionId, sender: &mpsc::Sender<Envelope>, envelope: Envelope) -> bool {
    match sender.try_send(envelope) {
        Ok(()) => true,
        Err(TrySendError::Full(envelope)) => {
            warn!(connection = %id, event = %envelope.event, "client queue full, dropping event");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(connection = %id, "client queue closed");
            false
        }
    }
}
