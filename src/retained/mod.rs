//! Retained message store
//!
//! Last-value cache keyed by exact topic name. A retained publish with an
//! empty payload clears the entry.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::{Publish, QoS};
use crate::topic::topic_matches_filter;

/// Retained message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub stored_at: SystemTime,
}

impl RetainedMessage {
    /// Build the publish sent to a new subscriber granted `granted` QoS
    pub fn to_publish(&self, granted: QoS) -> Publish {
        Publish {
            dup: false,
            qos: self.qos.min(granted),
            retain: true,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
        }
    }
}

/// Effect of a retained publish on the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainedUpdate {
    Stored,
    Cleared,
}

/// Thread-safe retained message store
#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: DashMap<Arc<str>, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a publish that carries the retain flag
    pub fn update(&self, publish: &Publish) -> RetainedUpdate {
        if publish.payload.is_empty() {
            self.messages.remove(&publish.topic);
            return RetainedUpdate::Cleared;
        }

        self.insert(RetainedMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            stored_at: SystemTime::now(),
        });
        RetainedUpdate::Stored
    }

    /// Insert a message, replacing any previous value for its topic
    pub fn insert(&self, message: RetainedMessage) {
        self.messages.insert(message.topic.clone(), message);
    }

    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.get(topic).map(|m| m.clone())
    }

    /// All retained messages whose topic matches a filter
    pub fn matching(&self, filter: &str) -> Vec<RetainedMessage> {
        self.messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
