//! Prometheus metrics
//!
//! Exposed at the /metrics endpoint when the metrics server is enabled.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// Broker metrics
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connections
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    /// Refused CONNECTs by CONNACK reason
    pub connections_refused_total: IntCounterVec,

    // Sessions
    pub sessions_current: IntGauge,
    pub sessions_expired_total: IntCounter,

    // Messages
    pub publish_received_total: IntCounter,
    pub publish_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub messages_dropped_total: IntCounter,
    pub reforwards_total: IntCounter,

    // Subscriptions and retained messages
    pub subscriptions_current: IntGauge,
    pub retained_messages_current: IntGauge,

    // Rules
    pub rule_messages_total: IntCounterVec,
    pub rule_hop_limit_total: IntCounter,
}

fn counter(name: &str, help: &str) -> prometheus::Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help))
}

fn gauge(name: &str, help: &str) -> prometheus::Result<IntGauge> {
    IntGauge::with_opts(Opts::new(name, help))
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let metrics = Self {
            connections_total: counter(
                "edgehub_connections_total",
                "Client connections accepted since startup",
            )?,
            connections_current: gauge(
                "edgehub_connections_current",
                "Currently connected clients",
            )?,
            connections_refused_total: IntCounterVec::new(
                Opts::new(
                    "edgehub_connections_refused_total",
                    "CONNECT packets refused, by reason",
                ),
                &["reason"],
            )?,
            sessions_current: gauge("edgehub_sessions_current", "Sessions held by the broker")?,
            sessions_expired_total: counter(
                "edgehub_sessions_expired_total",
                "Persistent sessions purged after the retention period",
            )?,
            publish_received_total: counter(
                "edgehub_publish_received_total",
                "PUBLISH packets received from clients",
            )?,
            publish_sent_total: counter(
                "edgehub_publish_sent_total",
                "PUBLISH packets written to clients",
            )?,
            bytes_received_total: counter(
                "edgehub_bytes_received_total",
                "Bytes read from clients",
            )?,
            bytes_sent_total: counter("edgehub_bytes_sent_total", "Bytes written to clients")?,
            messages_dropped_total: counter(
                "edgehub_messages_dropped_total",
                "Messages dropped because a subscriber buffer was full",
            )?,
            reforwards_total: counter(
                "edgehub_reforwards_total",
                "QoS 1 messages re-sent after the reforward interval",
            )?,
            subscriptions_current: gauge(
                "edgehub_subscriptions_current",
                "Active subscriptions",
            )?,
            retained_messages_current: gauge(
                "edgehub_retained_messages_current",
                "Retained messages",
            )?,
            rule_messages_total: IntCounterVec::new(
                Opts::new(
                    "edgehub_rule_messages_total",
                    "Messages republished by each rule",
                ),
                &["rule"],
            )?,
            rule_hop_limit_total: counter(
                "edgehub_rule_hop_limit_total",
                "Rule outputs discarded at the chain hop limit",
            )?,
            registry,
        };

        metrics.register()?;
        Ok(metrics)
    }

    fn register(&self) -> prometheus::Result<()> {
        let r = &self.registry;
        r.register(Box::new(self.connections_total.clone()))?;
        r.register(Box::new(self.connections_current.clone()))?;
        r.register(Box::new(self.connections_refused_total.clone()))?;
        r.register(Box::new(self.sessions_current.clone()))?;
        r.register(Box::new(self.sessions_expired_total.clone()))?;
        r.register(Box::new(self.publish_received_total.clone()))?;
        r.register(Box::new(self.publish_sent_total.clone()))?;
        r.register(Box::new(self.bytes_received_total.clone()))?;
        r.register(Box::new(self.bytes_sent_total.clone()))?;
        r.register(Box::new(self.messages_dropped_total.clone()))?;
        r.register(Box::new(self.reforwards_total.clone()))?;
        r.register(Box::new(self.subscriptions_current.clone()))?;
        r.register(Box::new(self.retained_messages_current.clone()))?;
        r.register(Box::new(self.rule_messages_total.clone()))?;
        r.register(Box::new(self.rule_hop_limit_total.clone()))?;
        Ok(())
    }

    pub fn client_connected(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
    }

    pub fn client_disconnected(&self) {
        self.connections_current.dec();
    }

    pub fn connection_refused(&self, reason: &str) {
        self.connections_refused_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn publish_received(&self, bytes: usize) {
        self.publish_received_total.inc();
        self.bytes_received_total.inc_by(bytes as u64);
    }

    pub fn publish_sent(&self, count: usize, bytes: usize) {
        self.publish_sent_total.inc_by(count as u64);
        self.bytes_sent_total.inc_by(bytes as u64);
    }

    pub fn rule_output(&self, rule: &str) {
        self.rule_messages_total.with_label_values(&[rule]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_metrics_render() {
        let metrics = Metrics::new().unwrap();
        metrics.client_connected();
        metrics.client_connected();
        metrics.client_disconnected();
        metrics.connection_refused("not_authorized");
        metrics.publish_sent(3, 120);
        metrics.rule_output("forward");

        assert_eq!(metrics.connections_total.get(), 2);
        assert_eq!(metrics.connections_current.get(), 1);
        assert_eq!(metrics.publish_sent_total.get(), 3);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("edgehub_connections_current 1"));
        assert!(text.contains("edgehub_connections_refused_total{reason=\"not_authorized\"} 1"));
        assert!(text.contains("edgehub_rule_messages_total{rule=\"forward\"} 1"));
    }
}
