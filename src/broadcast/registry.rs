//! Connection and topic bookkeeping.
//!
//! Plain data structure; `Broadcaster` owns it behind a single lock.

use super::auth::Principal;
use super::message::Envelope;
use super::BroadcastError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    /// Removed from the registry. Terminal.
    Disconnected,
}

struct Connection {
    sender: mpsc::Sender<Envelope>,
    principal: Option<Principal>,
    topics: BTreeSet<String>,
}

#[derive(Default)]
pub struct Registry {
    connections: BTreeMap<ConnectionId, Connection>,
    topics: BTreeMap<String, BTreeSet<ConnectionId>>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sender: mpsc::Sender<Envelope>) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.connections.insert(
            id,
            Connection {
                sender,
                principal: None,
                topics: BTreeSet::new(),
            },
        );
        id
    }

    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        match self.connections.get(&id) {
            Some(conn) if conn.principal.is_some() => ConnectionState::Authenticated,
            Some(_) => ConnectionState::Unauthenticated,
            None => ConnectionState::Disconnected,
        }
    }

    pub fn principal(&self, id: ConnectionId) -> Option<&Principal> {
        self.connections.get(&id)?.principal.as_ref()
    }

    pub fn authenticate(
        &mut self,
        id: ConnectionId,
        principal: Principal,
    ) -> Result<(), BroadcastError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(BroadcastError::UnknownConnection(id))?;
        conn.principal = Some(principal);
        Ok(())
    }

    fn authenticated_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, BroadcastError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(BroadcastError::UnknownConnection(id))?;
        if conn.principal.is_none() {
            return Err(BroadcastError::NotAuthenticated);
        }
        Ok(conn)
    }

    /// Returns whether the subscription is new.
    pub fn subscribe(&mut self, id: ConnectionId, topic: &str) -> Result<bool, BroadcastError> {
        let conn = self.authenticated_mut(id)?;
        let added = conn.topics.insert(topic.to_string());
        self.topics.entry(topic.to_string()).or_default().insert(id);
        Ok(added)
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&mut self, id: ConnectionId, topic: &str) -> Result<bool, BroadcastError> {
        let conn = self.authenticated_mut(id)?;
        let removed = conn.topics.remove(topic);
        self.detach(id, topic);
        Ok(removed)
    }

    fn detach(&mut self, id: ConnectionId, topic: &str) {
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(&id);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    /// Remove a connection and all of its subscriptions.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(conn) = self.connections.remove(&id) else {
            return false;
        };
        for topic in &conn.topics {
            self.detach(id, topic);
        }
        true
    }

    pub fn sender(&self, id: ConnectionId) -> Option<&mpsc::Sender<Envelope>> {
        self.connections.get(&id).map(|conn| &conn.sender)
    }

    pub fn all(&self) -> impl Iterator<Item = (ConnectionId, &mpsc::Sender<Envelope>)> {
        self.connections.iter().map(|(id, conn)| (*id, &conn.sender))
    }

    pub fn subscribers(
        &self,
        topic: &str,
    ) -> impl Iterator<Item = (ConnectionId, &mpsc::Sender<Envelope>)> {
        self.topics
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id).map(|conn| (*id, &conn.sender)))
    }

    pub fn topics_of(&self, id: ConnectionId) -> Vec<String> {
        self.connections
            .get(&id)
            .map(|conn| conn.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(BTreeSet::len).unwrap_or(0)
    }
}
