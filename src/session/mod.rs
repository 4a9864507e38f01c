//! MQTT Session Management
//!
//! A session outlives its network connection when the client connected
//! with clean_session=false. It carries the subscriptions and the
//! per-subscriber delivery buffers; the connection currently bound to it
//! is reached through an event channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::delivery::{ConnectionEvent, DeliveryConfig, Enqueued, Outbox};
use crate::protocol::{Publish, QoS};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A connection is bound to the session
    Connected,
    /// No connection; kept until the retention period elapses
    Disconnected,
}

/// Client session
#[derive(Debug)]
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    pub state: SessionState,
    /// Clean session flag of the connection that created the session
    pub clean_session: bool,
    /// Topic filter -> granted QoS
    pub subscriptions: HashMap<String, QoS>,
    /// Delivery buffers
    pub outbox: Outbox,
    /// Disconnect timestamp
    pub disconnected_at: Option<Instant>,
    connection_id: Option<u64>,
    events: Option<mpsc::Sender<ConnectionEvent>>,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_session: bool, delivery: DeliveryConfig) -> Self {
        Self {
            client_id,
            state: SessionState::Disconnected,
            clean_session,
            subscriptions: HashMap::new(),
            outbox: Outbox::new(delivery),
            disconnected_at: Some(Instant::now()),
            connection_id: None,
            events: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Bind a connection to this session
    ///
    /// A connection already bound is told it was taken over.
    pub fn attach(&mut self, connection_id: u64, events: mpsc::Sender<ConnectionEvent>) {
        self.evict();
        self.connection_id = Some(connection_id);
        self.events = Some(events);
        self.state = SessionState::Connected;
        self.disconnected_at = None;
    }

    /// Tell the bound connection, if any, that it was taken over
    ///
    /// Dropping the sender closes the connection's event channel, so the
    /// notice cannot be lost to a full channel.
    pub fn evict(&mut self) {
        self.connection_id = None;
        if let Some(previous) = self.events.take() {
            let _ = previous.try_send(ConnectionEvent::TakenOver);
        }
    }

    /// Check whether the given connection is the one bound to this session
    pub fn is_attached(&self, connection_id: u64) -> bool {
        self.connection_id == Some(connection_id)
    }

    /// Unbind a connection
    ///
    /// Returns false if another connection has taken the session over.
    pub fn detach(&mut self, connection_id: u64) -> bool {
        if self.connection_id != Some(connection_id) {
            return false;
        }
        self.connection_id = None;
        self.events = None;
        self.state = SessionState::Disconnected;
        self.disconnected_at = Some(Instant::now());
        self.outbox.on_disconnect();
        true
    }

    /// Buffer a message for the client and wake its connection
    pub fn deliver(&mut self, publish: Publish) -> Enqueued {
        let outcome = self.outbox.push(publish, self.is_connected());
        if outcome.is_stored() {
            self.wake();
        }
        outcome
    }

    /// Notify the bound connection that the outbox has data
    pub fn wake(&self) {
        if let Some(ref events) = self.events {
            // A full channel already holds a wake-up
            let _ = events.try_send(ConnectionEvent::Wake);
        }
    }

    /// Check whether a disconnected session outlived the retention period
    pub fn is_expired(&self, retention: Duration) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        self.disconnected_at
            .is_some_and(|at| at.elapsed() >= retention)
    }

    /// Add or replace a subscription, returning the previous QoS
    pub fn add_subscription(&mut self, filter: String, qos: QoS) -> Option<QoS> {
        self.subscriptions.insert(filter, qos)
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }
}

/// What happened to a session when its connection went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// Clean session, discarded
    Removed,
    /// Persistent session, kept for the retention period
    Retained,
    /// Another connection owns the session now
    Superseded,
}

/// Thread-safe session store
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    delivery: DeliveryConfig,
}

impl SessionStore {
    pub fn new(delivery: DeliveryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            delivery,
        }
    }

    pub fn delivery_config(&self) -> &DeliveryConfig {
        &self.delivery
    }

    /// Get or create a session
    ///
    /// A session is resumed only when both the stored session and the new
    /// connection use clean_session=false. Returns the session and whether
    /// it was resumed.
    pub fn get_or_create(
        &self,
        client_id: &str,
        clean_session: bool,
    ) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean_session {
            if let Some(session) = self.sessions.get(&client_id) {
                let s = session.read();
                if !s.clean_session {
                    drop(s);
                    return (session.clone(), true);
                }
            }
        }

        let session = Arc::new(RwLock::new(Session::new(
            client_id.clone(),
            clean_session,
            self.delivery.clone(),
        )));
        if let Some(previous) = self.sessions.insert(client_id, session.clone()) {
            previous.write().evict();
        }
        (session, false)
    }

    /// Get a session by client ID
    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Insert a session restored from storage
    pub fn restore(&self, session: Session) {
        let client_id = session.client_id.clone();
        self.sessions
            .insert(client_id, Arc::new(RwLock::new(session)));
    }

    /// Remove a session
    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// Unbind a connection from its session
    pub fn disconnect(&self, client_id: &str, connection_id: u64) -> Detached {
        let outcome = match self.sessions.get(client_id) {
            Some(session) => {
                let mut s = session.write();
                if !s.detach(connection_id) {
                    Detached::Superseded
                } else if s.clean_session {
                    Detached::Removed
                } else {
                    Detached::Retained
                }
            }
            None => Detached::Superseded,
        };

        // Remove after releasing the DashMap read lock to avoid deadlock
        if outcome == Detached::Removed {
            self.sessions.remove(client_id);
        }
        outcome
    }

    /// Remove disconnected sessions older than the retention period
    ///
    /// Returns the client ids that were purged.
    pub fn purge_expired(&self, retention: Duration) -> Vec<Arc<str>> {
        let mut purged = Vec::new();
        self.sessions.retain(|client_id, session| {
            let expired = session.read().is_expired(retention);
            if expired {
                purged.push(client_id.clone());
            }
            !expired
        });
        purged
    }

    /// Visit every session
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Session),
    {
        for entry in self.sessions.iter() {
            f(&entry.value().read());
        }
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions with a bound connection
    pub fn connected_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().read().is_connected())
            .count()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DeliveryConfig::default())
    }
}
