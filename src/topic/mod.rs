//! Topic matching and subscription management
//!
//! Implements topic name/filter validation and a topic trie mapping each
//! filter to the clients subscribed to it.
//!
//! - Matching uses callbacks into the trie to avoid intermediate allocations
//! - Results use SmallVec since most topics have few subscribers

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_name, validate_wildcards,
    TopicLimits,
};

use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::protocol::QoS;

/// A subscription entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Subscribed client
    pub client_id: Arc<str>,
    /// Granted QoS
    pub qos: QoS,
}

/// Thread-safe subscription index keyed by topic filter
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscription>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Add or replace a client's subscription to a filter
    ///
    /// Returns true if the client was already subscribed to this exact filter.
    pub fn subscribe(&self, filter: &str, subscription: Subscription) -> bool {
        let mut trie = self.trie.write();
        let subs = trie.entry(filter).get_or_insert_with(Vec::new);
        match subs
            .iter_mut()
            .find(|s| s.client_id == subscription.client_id)
        {
            Some(existing) => {
                existing.qos = subscription.qos;
                true
            }
            None => {
                subs.push(subscription);
                false
            }
        }
    }

    /// Remove a client's subscription to a filter
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut trie = self.trie.write();
        let Some(subs) = trie.get_mut(filter) else {
            return false;
        };

        let len_before = subs.len();
        subs.retain(|s| s.client_id.as_ref() != client_id);
        let removed = subs.len() != len_before;
        if subs.is_empty() {
            trie.remove(filter);
        }
        removed
    }

    /// Remove all subscriptions for a client
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            subs.is_empty()
        });
    }

    /// Find all matching subscriptions for a topic
    ///
    /// A client subscribed through several overlapping filters appears once
    /// per filter.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let trie = self.trie.read();
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();
        trie.matches(topic, |subs| result.extend(subs.iter().cloned()));
        result
    }

    /// Total number of (filter, client) entries
    pub fn count(&self) -> usize {
        let trie = self.trie.read();
        let mut count = 0;
        trie.for_each(|subs| count += subs.len());
        count
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
