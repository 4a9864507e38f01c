//! Per-subscriber delivery buffers
//!
//! Every session owns an [`Outbox`]. Publishers push into it without
//! blocking and the connection task drains it:
//!
//! - QoS 0 messages go to a bounded queue and are written once
//! - QoS 1 messages wait in a bounded buffer, move into the in-flight
//!   window when a slot is free, and stay there until PUBACK
//! - In-flight messages that are not acknowledged within the reforward
//!   interval are written again with `dup` set
//!
//! When a buffer is full the message is dropped according to
//! [`OverflowPolicy`]; the publisher is never made to wait.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::protocol::{Publish, QoS};

/// What to drop when a subscriber buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the incoming message
    #[default]
    DropNewest,
    /// Evict the oldest waiting message to make room
    DropOldest,
}

/// Largest in-flight window; each slot needs a distinct non-zero packet id
pub const MAX_INFLIGHT: usize = u16::MAX as usize;

/// Buffer sizes and timings for per-subscriber delivery
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Capacity of the QoS 0 queue
    pub qos0_buffer_size: usize,
    /// Capacity of the QoS 1 buffer (in-flight plus waiting)
    pub qos1_buffer_size: usize,
    /// Maximum unacknowledged QoS 1 messages on the wire
    pub max_inflight: usize,
    /// Time before an unacknowledged QoS 1 message is sent again
    #[serde(with = "humantime_serde")]
    pub reforward_interval: Duration,
    pub overflow_policy: OverflowPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            qos0_buffer_size: 10_000,
            qos1_buffer_size: 100,
            max_inflight: 20,
            reforward_interval: Duration::from_secs(20),
            overflow_policy: OverflowPolicy::DropNewest,
        }
    }
}

/// Event sent to a connection task over its event channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The outbox has something to write
    Wake,
    /// Another connection took over this client id
    TakenOver,
}

/// Result of pushing a message into an outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Stored for delivery
    Accepted,
    /// Stored, but the oldest waiting message was evicted
    Evicted,
    /// The buffer was full and the message was dropped
    Dropped,
    /// QoS 0 message for a disconnected subscriber
    Offline,
}

impl Enqueued {
    pub fn is_stored(self) -> bool {
        matches!(self, Enqueued::Accepted | Enqueued::Evicted)
    }
}

/// A QoS 1 message that has been assigned a packet id
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub publish: Publish,
    /// When the message was last written to the wire
    pub sent_at: Instant,
    /// Number of times the message was re-sent
    pub resend_count: u32,
}

impl InflightMessage {
    pub fn packet_id(&self) -> u16 {
        self.publish.packet_id.unwrap_or(0)
    }
}

/// Bounded delivery buffers for one subscriber
#[derive(Debug)]
pub struct Outbox {
    config: DeliveryConfig,
    qos0: VecDeque<Publish>,
    /// Sent and awaiting PUBACK, in send order
    inflight: VecDeque<InflightMessage>,
    /// QoS 1 messages waiting for an in-flight slot
    waiting: VecDeque<Publish>,
    next_packet_id: u16,
}

impl Outbox {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            qos0: VecDeque::new(),
            inflight: VecDeque::new(),
            waiting: VecDeque::new(),
            next_packet_id: 1,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    fn window(&self) -> usize {
        self.config.max_inflight.min(MAX_INFLIGHT)
    }

    /// Buffer a message for this subscriber
    ///
    /// The message must already carry the effective QoS. QoS 0 messages
    /// are only kept while the subscriber is online.
    pub fn push(&mut self, mut publish: Publish, online: bool) -> Enqueued {
        publish.dup = false;
        publish.packet_id = None;

        if publish.qos == QoS::AtMostOnce {
            if !online {
                return Enqueued::Offline;
            }
            return push_bounded(
                &mut self.qos0,
                publish,
                self.config.qos0_buffer_size,
                self.config.overflow_policy,
            );
        }

        let len = self.inflight.len() + self.waiting.len();
        if len < self.config.qos1_buffer_size {
            self.waiting.push_back(publish);
            return Enqueued::Accepted;
        }

        match self.config.overflow_policy {
            OverflowPolicy::DropNewest => Enqueued::Dropped,
            OverflowPolicy::DropOldest => {
                if self.waiting.pop_front().is_none() && self.inflight.pop_front().is_none() {
                    // Zero capacity
                    return Enqueued::Dropped;
                }
                self.waiting.push_back(publish);
                Enqueued::Evicted
            }
        }
    }

    /// Take every message that can be written now
    ///
    /// QoS 1 messages are moved into the in-flight window (and given a
    /// packet id) while slots are free.
    pub fn take_ready(&mut self, now: Instant) -> Vec<Publish> {
        let mut ready: Vec<Publish> = self.qos0.drain(..).collect();

        while self.inflight.len() < self.window() {
            let Some(mut publish) = self.waiting.pop_front() else {
                break;
            };
            publish.packet_id = Some(self.allocate_packet_id());
            ready.push(publish.clone());
            self.inflight.push_back(InflightMessage {
                publish,
                sent_at: now,
                resend_count: 0,
            });
        }

        ready
    }

    /// Release the in-flight slot for an acknowledged packet id
    pub fn acknowledge(&mut self, packet_id: u16) -> bool {
        match self
            .inflight
            .iter()
            .position(|m| m.packet_id() == packet_id)
        {
            Some(index) => {
                self.inflight.remove(index);
                true
            }
            None => false,
        }
    }

    /// In-flight messages whose reforward interval elapsed, marked `dup`
    pub fn take_due(&mut self, now: Instant) -> Vec<Publish> {
        let interval = self.config.reforward_interval;
        self.inflight
            .iter_mut()
            .filter(|m| now.saturating_duration_since(m.sent_at) >= interval)
            .map(|m| resend(m, now))
            .collect()
    }

    /// All in-flight messages marked `dup`, for a resumed session
    pub fn take_all_inflight(&mut self, now: Instant) -> Vec<Publish> {
        self.inflight.iter_mut().map(|m| resend(m, now)).collect()
    }

    /// Discard what must not outlive a network connection
    pub fn on_disconnect(&mut self) {
        self.qos0.clear();
    }

    pub fn has_ready(&self) -> bool {
        !self.qos0.is_empty()
            || (!self.waiting.is_empty() && self.inflight.len() < self.window())
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn qos0_len(&self) -> usize {
        self.qos0.len()
    }

    /// Number of QoS 1 messages held (in-flight plus waiting)
    pub fn qos1_len(&self) -> usize {
        self.inflight.len() + self.waiting.len()
    }

    /// QoS 1 messages in delivery order, for persistence
    pub fn qos1_messages(&self) -> impl Iterator<Item = &Publish> {
        self.inflight
            .iter()
            .map(|m| &m.publish)
            .chain(self.waiting.iter())
    }

    /// Restore a persisted QoS 1 message at the back of the buffer
    pub fn restore(&mut self, publish: Publish) -> Enqueued {
        self.push(publish, false)
    }

    /// Only called with a free window slot, so a free id exists
    fn allocate_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.inflight.iter().any(|m| m.packet_id() == id) {
                return id;
            }
        }
    }
}

fn resend(message: &mut InflightMessage, now: Instant) -> Publish {
    message.sent_at = now;
    message.resend_count += 1;
    let mut publish = message.publish.clone();
    publish.dup = true;
    publish
}

fn push_bounded(
    queue: &mut VecDeque<Publish>,
    publish: Publish,
    capacity: usize,
    policy: OverflowPolicy,
) -> Enqueued {
    if queue.len() < capacity {
        queue.push_back(publish);
        return Enqueued::Accepted;
    }

    match policy {
        OverflowPolicy::DropOldest if queue.pop_front().is_some() => {
            queue.push_back(publish);
            Enqueued::Evicted
        }
        _ => Enqueued::Dropped,
    }
}
