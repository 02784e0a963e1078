use crate::message::Outbound;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{Identity, Topic};
use log::*;
use std::collections::HashSet;
use tokio::sync::mpsc::UnboundedSender;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection information
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Unset until the handshake succeeds, then never changes.
    pub identity: Option<Identity>,
    pub connected_at: DateTime<Utc>,
    pub sender: UnboundedSender<Outbound>,
    /// Topics this connection asked for.
    pub topics: HashSet<Topic>,
}

/// What [`ConnectionRegistry::unregister`] removed.
#[derive(Debug)]
pub struct Unregistered<R> {
    pub identity: Option<Identity>,
    /// Result of the last-connection callback, when this was the identity's
    /// last connection.
    pub last: Option<R>,
}

/// Connection registry with dual indices for O(1) lookups
pub struct ConnectionRegistry {
    /// Primary storage: lookup by connection_id for registration/cleanup - O(1)
    connections: DashMap<ConnectionId, ConnectionInfo>,

    /// Secondary index: authenticated identity to its live connections - O(1).
    /// An identity is present only while it has at least one connection.
    identity_index: DashMap<Identity, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            identity_index: DashMap::new(),
        }
    }

    /// Register a new, unauthenticated connection - O(1)
    pub fn register(&self, sender: UnboundedSender<Outbound>) -> ConnectionId {
        let connection_id = ConnectionId::new();

        self.connections.insert(
            connection_id.clone(),
            ConnectionInfo {
                identity: None,
                connected_at: Utc::now(),
                sender,
                topics: HashSet::new(),
            },
        );

        connection_id
    }

    /// Bind an identity to a registered connection and index it - O(1)
    ///
    /// Returns `false` if the connection is unknown or already authenticated.
    pub fn bind_identity(&self, connection_id: &ConnectionId, identity: Identity) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(mut info) if info.identity.is_none() => {
                info.identity = Some(identity.clone());
            }
            _ => return false,
        }

        self.identity_index
            .entry(identity)
            .or_default()
            .insert(connection_id.clone());

        true
    }

    /// Unregister a connection - O(1)
    ///
    /// If this was the last connection of its identity, the identity entry is
    /// removed and `on_last` runs while the entry is still locked, so a
    /// concurrent registration for the same identity is ordered strictly
    /// before or after it.
    pub fn unregister<R>(
        &self,
        connection_id: &ConnectionId,
        on_last: impl FnOnce(&Identity) -> R,
    ) -> Option<Unregistered<R>> {
        let (_, info) = self.connections.remove(connection_id)?;

        let Some(identity) = info.identity else {
            return Some(Unregistered {
                identity: None,
                last: None,
            });
        };

        let mut last = None;
        if let Entry::Occupied(mut entry) = self.identity_index.entry(identity.clone()) {
            entry.get_mut().remove(connection_id);
            if entry.get().is_empty() {
                last = Some(on_last(&identity));
                entry.remove();
            }
        }

        Some(Unregistered {
            identity: Some(identity),
            last,
        })
    }

    pub fn identity_of(&self, connection_id: &ConnectionId) -> Option<Identity> {
        self.connections
            .get(connection_id)
            .and_then(|info| info.identity.clone())
    }

    /// Record that a connection asked for `topic`.
    ///
    /// Returns `true` if the topic was not already recorded.
    pub fn add_topic(&self, connection_id: &ConnectionId, topic: &Topic) -> bool {
        self.connections
            .get_mut(connection_id)
            .is_some_and(|mut info| info.topics.insert(topic.clone()))
    }

    /// Returns `true` if the topic was recorded.
    pub fn remove_topic(&self, connection_id: &ConnectionId, topic: &Topic) -> bool {
        self.connections
            .get_mut(connection_id)
            .is_some_and(|mut info| info.topics.remove(topic))
    }

    /// Whether any live connection of `identity` still asked for `topic`.
    pub fn identity_wants(&self, identity: &Identity, topic: &Topic) -> bool {
        let Some(connection_ids) = self.identity_index.get(identity) else {
            return false;
        };
        connection_ids.iter().any(|conn_id| {
            self.connections
                .get(conn_id)
                .is_some_and(|info| info.topics.contains(topic))
        })
    }

    /// Send to one connection. Returns `false` if it is gone or closed.
    pub fn send(&self, connection_id: &ConnectionId, message: Outbound) -> bool {
        match self.connections.get(connection_id) {
            Some(info) => info.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Send message to every connection of an identity - O(1) lookup + O(k) send
    ///
    /// Returns the number of connections the message was handed to. Closed
    /// connections are skipped; their own loop cleans them up.
    pub fn send_to_identity(&self, identity: &Identity, message: &Outbound) -> usize {
        let Some(connection_ids) = self.identity_index.get(identity) else {
            debug!("No active connections for {identity}");
            return 0;
        };

        let mut sent = 0;
        for conn_id in connection_ids.iter() {
            if let Some(info) = self.connections.get(conn_id) {
                match info.sender.send(message.clone()) {
                    Ok(()) => sent += 1,
                    Err(_) => trace!("Skipping closed connection {conn_id}"),
                }
            }
        }
        sent
    }

    /// Broadcast message to all connections - O(n) (unavoidable, but explicit)
    pub fn broadcast(&self, message: &Outbound) {
        for entry in self.connections.iter() {
            if entry.value().sender.send(message.clone()).is_err() {
                trace!("Skipping closed connection {}", entry.key());
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn identity_count(&self) -> usize {
        self.identity_index.len()
    }

    pub fn connections_for(&self, identity: &Identity) -> usize {
        self.identity_index
            .get(identity)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
