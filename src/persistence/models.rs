//! Serializable data models for persistence
//!
//! Storage-friendly versions of the runtime session and retained types,
//! encoded with bincode.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::delivery::DeliveryConfig;
use crate::protocol::{Publish, QoS};
use crate::retained::RetainedMessage;
use crate::session::Session;

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    /// Unix timestamp in milliseconds when the message was stored
    pub stored_at_ms: u64,
}

/// Stored persistent session
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub subscriptions: Vec<StoredSubscription>,
    /// Queued QoS 1 messages in delivery order, in-flight first
    pub messages: Vec<StoredPublish>,
    /// Unix timestamp in milliseconds when the client disconnected
    pub disconnected_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

/// Data loaded from persistence at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<(String, StoredRetainedMessage)>,
    pub sessions: Vec<(String, StoredSession)>,
}

fn system_time_to_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn instant_to_unix_ms(instant: Instant) -> u64 {
    // Instant has no wall-clock mapping; go through the elapsed time
    let elapsed = Instant::now().saturating_duration_since(instant);
    SystemTime::now()
        .checked_sub(elapsed)
        .map(system_time_to_ms)
        .unwrap_or(0)
}

fn unix_ms_to_instant(ms: u64) -> Instant {
    let now = Instant::now();
    let elapsed = system_time_to_ms(SystemTime::now()).saturating_sub(ms);
    now.checked_sub(Duration::from_millis(elapsed))
        .unwrap_or(now)
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
        }
    }
}

impl From<StoredPublish> for Publish {
    fn from(stored: StoredPublish) -> Self {
        Self {
            dup: false,
            qos: QoS::from_u8(stored.qos).unwrap_or(QoS::AtLeastOnce),
            retain: false,
            topic: stored.topic.into(),
            packet_id: None,
            payload: Bytes::from(stored.payload),
        }
    }
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(message: &RetainedMessage) -> Self {
        Self {
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos as u8,
            stored_at_ms: system_time_to_ms(message.stored_at),
        }
    }
}

impl From<StoredRetainedMessage> for RetainedMessage {
    fn from(stored: StoredRetainedMessage) -> Self {
        Self {
            topic: stored.topic.into(),
            payload: Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            stored_at: UNIX_EPOCH + Duration::from_millis(stored.stored_at_ms),
        }
    }
}

impl StoredSession {
    /// Snapshot a session
    pub fn from_session(session: &Session) -> Self {
        let mut subscriptions: Vec<StoredSubscription> = session
            .subscriptions
            .iter()
            .map(|(filter, qos)| StoredSubscription {
                filter: filter.clone(),
                qos: *qos as u8,
            })
            .collect();
        subscriptions.sort_by(|a, b| a.filter.cmp(&b.filter));

        Self {
            client_id: session.client_id.to_string(),
            subscriptions,
            messages: session
                .outbox
                .qos1_messages()
                .map(StoredPublish::from)
                .collect(),
            disconnected_at_ms: session.disconnected_at.map(instant_to_unix_ms),
        }
    }

    /// Check the wall-clock disconnect time against the retention period
    ///
    /// Instants do not survive a restart; stored sessions are judged here.
    pub fn is_expired(&self, retention: Duration) -> bool {
        self.disconnected_at_ms.is_some_and(|ms| {
            let elapsed = system_time_to_ms(SystemTime::now()).saturating_sub(ms);
            Duration::from_millis(elapsed) >= retention
        })
    }

    /// Rebuild a disconnected session
    ///
    /// Messages that were in flight are queued again and re-sent with new
    /// packet ids after the client reconnects.
    pub fn into_session(self, delivery: DeliveryConfig) -> Session {
        let mut session = Session::new(self.client_id.into(), false, delivery);
        for sub in self.subscriptions {
            if let Some(qos) = QoS::from_u8(sub.qos) {
                session.add_subscription(sub.filter, qos);
            }
        }
        for message in self.messages {
            session.outbox.restore(Publish::from(message));
        }
        if let Some(ms) = self.disconnected_at_ms {
            session.disconnected_at = Some(unix_ms_to_instant(ms));
        }
        session
    }
}
