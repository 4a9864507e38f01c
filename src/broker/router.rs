//! Message Router
//!
//! Fans a publish out to every matching subscription and feeds it to the
//! rule pipeline. Rule outputs are routed the same way until the chain
//! reaches the hop limit.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::delivery::Enqueued;
use crate::metrics::Metrics;
use crate::persistence::{PersistenceManager, PersistenceOp, StoredRetainedMessage, StoredSession};
use crate::protocol::Publish;
use crate::retained::{RetainedStore, RetainedUpdate};
use crate::rule::{MessageContext, RuleEngine};
use crate::session::SessionStore;
use crate::topic::SubscriptionStore;

pub struct MessageRouter {
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<RetainedStore>,
    rules: Arc<RuleEngine>,
    persistence: Option<Arc<PersistenceManager>>,
    metrics: Option<Arc<Metrics>>,
    max_rule_hops: usize,
}

impl MessageRouter {
    pub fn new(
        sessions: Arc<SessionStore>,
        subscriptions: Arc<SubscriptionStore>,
        retained: Arc<RetainedStore>,
        rules: Arc<RuleEngine>,
        max_rule_hops: usize,
    ) -> Self {
        Self {
            sessions,
            subscriptions,
            retained,
            rules,
            persistence: None,
            metrics: None,
            max_rule_hops,
        }
    }

    pub fn with_persistence(mut self, persistence: Option<Arc<PersistenceManager>>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Route a publish and everything the rules derive from it
    ///
    /// Returns the number of subscriber buffers the original message was
    /// stored in.
    pub fn publish(&self, publish: &Publish, origin: &MessageContext) -> usize {
        let delivered = self.route(publish);
        if self.rules.is_empty() {
            return delivered;
        }

        let mut queue: VecDeque<(Publish, usize)> = VecDeque::new();
        self.run_rules(publish, origin, 0, &mut queue);

        while let Some((derived, hops)) = queue.pop_front() {
            self.route(&derived);
            self.run_rules(&derived, origin, hops, &mut queue);
        }

        delivered
    }

    fn run_rules(
        &self,
        publish: &Publish,
        origin: &MessageContext,
        hops: usize,
        queue: &mut VecDeque<(Publish, usize)>,
    ) {
        // Rule SQL sees the topic and QoS of the message it is applied to
        let context = MessageContext {
            client_id: origin.client_id.clone(),
            client_ip: origin.client_ip,
            topic: publish.topic.clone(),
            qos: publish.qos,
        };

        for output in self.rules.process(publish, &context) {
            if hops >= self.max_rule_hops {
                debug!(
                    rule = %output.rule,
                    topic = %output.publish.topic,
                    "rule chain reached {} hops, dropping output",
                    self.max_rule_hops
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.rule_hop_limit_total.inc();
                }
                continue;
            }
            if let Some(ref metrics) = self.metrics {
                metrics.rule_output(&output.rule);
            }
            trace!(rule = %output.rule, target = %output.publish.topic, "rule output");
            queue.push_back((output.publish, hops + 1));
        }
    }

    /// Apply the retain flag and buffer the message for each subscription
    fn route(&self, publish: &Publish) -> usize {
        if publish.retain {
            self.update_retained(publish);
        }

        let mut delivered = 0;
        for sub in self.subscriptions.matches(&publish.topic) {
            let Some(session) = self.sessions.get(&sub.client_id) else {
                continue;
            };

            let mut outgoing = publish.clone();
            outgoing.qos = publish.qos.min(sub.qos);
            outgoing.retain = false;

            let mut s = session.write();
            let outcome = s.deliver(outgoing);
            match outcome {
                Enqueued::Accepted => delivered += 1,
                Enqueued::Evicted => {
                    delivered += 1;
                    self.count_drop();
                }
                Enqueued::Dropped => {
                    debug!(
                        "Buffer full for {}, dropping message on {}",
                        sub.client_id, publish.topic
                    );
                    self.count_drop();
                }
                Enqueued::Offline => {}
            }

            if outcome.is_stored() && !s.is_connected() && !s.clean_session {
                if let Some(ref persistence) = self.persistence {
                    persistence.write(PersistenceOp::SetSession {
                        client_id: s.client_id.to_string(),
                        session: StoredSession::from_session(&s),
                    });
                }
            }
        }

        delivered
    }

    fn update_retained(&self, publish: &Publish) {
        let update = self.retained.update(publish);

        if let Some(ref persistence) = self.persistence {
            let topic = publish.topic.to_string();
            match update {
                RetainedUpdate::Stored => {
                    if let Some(message) = self.retained.get(&topic) {
                        persistence.write(PersistenceOp::SetRetained {
                            topic,
                            message: StoredRetainedMessage::from(&message),
                        });
                    }
                }
                RetainedUpdate::Cleared => {
                    persistence.write(PersistenceOp::DeleteRetained { topic });
                }
            }
        }

        if let Some(ref metrics) = self.metrics {
            metrics.retained_messages_current.set(self.retained.len() as i64);
        }
    }

    fn count_drop(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.messages_dropped_total.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuleConfig, RuleEndpoint};
    use crate::delivery::ConnectionEvent;
    use crate::protocol::QoS;
    use crate::topic::Subscription;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct Fixture {
        sessions: Arc<SessionStore>,
        subscriptions: Arc<SubscriptionStore>,
        retained: Arc<RetainedStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                sessions: Arc::new(SessionStore::default()),
                subscriptions: Arc::new(SubscriptionStore::new()),
                retained: Arc::new(RetainedStore::new()),
            }
        }

        fn router(&self, rules: Vec<RuleConfig>, max_hops: usize) -> MessageRouter {
            MessageRouter::new(
                self.sessions.clone(),
                self.subscriptions.clone(),
                self.retained.clone(),
                Arc::new(RuleEngine::new(&rules).unwrap()),
                max_hops,
            )
        }

        /// Connected subscriber; the receiver must be kept alive
        fn subscriber(
            &self,
            client_id: &str,
            filter: &str,
            qos: QoS,
        ) -> mpsc::Receiver<ConnectionEvent> {
            let (session, _) = self.sessions.get_or_create(client_id, true);
            let (tx, rx) = mpsc::channel(4);
            session.write().attach(1, tx);
            session.write().add_subscription(filter.to_string(), qos);
            self.subscriptions.subscribe(
                filter,
                Subscription {
                    client_id: client_id.into(),
                    qos,
                },
            );
            rx
        }

        fn ready(&self, client_id: &str) -> Vec<Publish> {
            let session = self.sessions.get(client_id).unwrap();
            let mut s = session.write();
            s.outbox.take_ready(std::time::Instant::now())
        }
    }

    fn publish(topic: &str, payload: &'static [u8], qos: QoS, retain: bool) -> Publish {
        Publish {
            qos,
            retain,
            topic: topic.into(),
            packet_id: Some(9),
            payload: Bytes::from_static(payload),
            ..Default::default()
        }
    }

    fn origin(topic: &str) -> MessageContext {
        MessageContext {
            client_id: "publisher".into(),
            client_ip: None,
            topic: topic.into(),
            qos: QoS::AtLeastOnce,
        }
    }

    fn rule(name: &str, source: &str, target: &str, sql: Option<&str>) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            source: RuleEndpoint {
                topic: source.to_string(),
                qos: 1,
            },
            target: RuleEndpoint {
                topic: target.to_string(),
                qos: 1,
            },
            sql: sql.map(str::to_string),
        }
    }

    #[test]
    fn test_delivery_uses_minimum_qos() {
        let fx = Fixture::new();
        let _a = fx.subscriber("low", "t/#", QoS::AtMostOnce);
        let _b = fx.subscriber("high", "t/+", QoS::AtLeastOnce);
        let router = fx.router(vec![], 8);

        let retained = publish("t/1", b"x", QoS::AtLeastOnce, true);
        assert_eq!(router.publish(&retained, &origin("t/1")), 2);

        let low = fx.ready("low");
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].qos, QoS::AtMostOnce);
        assert!(!low[0].retain);

        let high = fx.ready("high");
        assert_eq!(high[0].qos, QoS::AtLeastOnce);
        assert!(fx.retained.get("t/1").is_some());
    }

    #[test]
    fn test_overlapping_filters_deliver_per_subscription() {
        let fx = Fixture::new();
        let _rx = fx.subscriber("c1", "a/+", QoS::AtMostOnce);
        fx.sessions.get("c1").unwrap().write().add_subscription("a/#".into(), QoS::AtLeastOnce);
        fx.subscriptions.subscribe(
            "a/#",
            Subscription {
                client_id: "c1".into(),
                qos: QoS::AtLeastOnce,
            },
        );
        let router = fx.router(vec![], 8);

        router.publish(&publish("a/b", b"x", QoS::AtLeastOnce, false), &origin("a/b"));
        let mut qos: Vec<QoS> = fx.ready("c1").iter().map(|p| p.qos).collect();
        qos.sort();
        assert_eq!(qos, vec![QoS::AtMostOnce, QoS::AtLeastOnce]);
    }

    #[test]
    fn test_empty_retained_payload_clears() {
        let fx = Fixture::new();
        let router = fx.router(vec![], 8);
        router.publish(&publish("r", b"on", QoS::AtMostOnce, true), &origin("r"));
        assert_eq!(fx.retained.len(), 1);
        router.publish(&publish("r", b"", QoS::AtMostOnce, true), &origin("r"));
        assert!(fx.retained.is_empty());
    }

    #[test]
    fn test_rule_chain_is_routed() {
        let fx = Fixture::new();
        let _rx = fx.subscriber("sink", "out", QoS::AtLeastOnce);
        let router = fx.router(
            vec![
                rule("first", "in", "mid", Some("SELECT value * 2 AS value")),
                rule("second", "mid", "out", Some("SELECT value + 1 AS value")),
            ],
            8,
        );

        router.publish(&publish("in", br#"{"value": 20}"#, QoS::AtLeastOnce, false), &origin("in"));

        let out = fx.ready("sink");
        assert_eq!(out.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&out[0].payload).unwrap();
        assert_eq!(json["value"], serde_json::json!(41));
    }

    #[test]
    fn test_rule_loop_stops_at_hop_limit() {
        let fx = Fixture::new();
        let _rx = fx.subscriber("watcher", "loop", QoS::AtMostOnce);
        let router = fx.router(vec![rule("echo", "loop", "loop", None)], 3);

        router.publish(&publish("loop", b"{}", QoS::AtMostOnce, false), &origin("loop"));
        // The original plus three rule hops
        assert_eq!(fx.ready("watcher").len(), 4);
    }

    #[test]
    fn test_offline_persistent_session_keeps_qos1_only() {
        let fx = Fixture::new();
        let (session, _) = fx.sessions.get_or_create("offline", false);
        session.write().add_subscription("t".into(), QoS::AtLeastOnce);
        fx.subscriptions.subscribe(
            "t",
            Subscription {
                client_id: "offline".into(),
                qos: QoS::AtLeastOnce,
            },
        );
        let router = fx.router(vec![], 8);

        assert_eq!(router.publish(&publish("t", b"1", QoS::AtLeastOnce, false), &origin("t")), 1);
        assert_eq!(router.publish(&publish("t", b"0", QoS::AtMostOnce, false), &origin("t")), 0);
        assert_eq!(session.read().outbox.qos1_len(), 1);
    }
}
