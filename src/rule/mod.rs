//! Rule pipeline
//!
//! Each rule acts as an internal subscriber on its source filter. Matching
//! messages pass through the optional SQL handler and the result is
//! republished to the target topic with `min(message qos, source qos,
//! target qos)`. Rule output may feed other rules; the router bounds the
//! chain length.

pub mod sql;

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::config::RuleConfig;
use crate::protocol::{Publish, QoS};
use crate::topic::{validate_topic_filter, validate_topic_name, TopicLimits, TopicTrie};
pub use sql::{SqlError, SqlQuery};

/// Errors raised while loading rule definitions
#[derive(Debug)]
pub enum RuleError {
    DuplicateName(String),
    InvalidSource { rule: String, reason: &'static str },
    InvalidTarget { rule: String, reason: &'static str },
    InvalidQos { rule: String, qos: u8 },
    Sql { rule: String, source: SqlError },
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::DuplicateName(name) => write!(f, "duplicate rule name: {}", name),
            RuleError::InvalidSource { rule, reason } => {
                write!(f, "rule {}: invalid source filter: {}", rule, reason)
            }
            RuleError::InvalidTarget { rule, reason } => {
                write!(f, "rule {}: invalid target topic: {}", rule, reason)
            }
            RuleError::InvalidQos { rule, qos } => {
                write!(f, "rule {}: unsupported qos {}", rule, qos)
            }
            RuleError::Sql { rule, source } => write!(f, "rule {}: {}", rule, source),
        }
    }
}

impl std::error::Error for RuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuleError::Sql { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Message attributes visible to the SQL functions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Client that published the message; preserved along a rule chain
    pub client_id: Arc<str>,
    pub client_ip: Option<IpAddr>,
    pub topic: Arc<str>,
    pub qos: QoS,
}

/// A compiled rule
#[derive(Debug)]
pub struct Rule {
    pub name: Arc<str>,
    pub source: String,
    pub source_qos: QoS,
    pub target: Arc<str>,
    pub target_qos: QoS,
    query: Option<SqlQuery>,
}

impl Rule {
    fn compile(config: &RuleConfig) -> Result<Self, RuleError> {
        // Rules are internal and may use `$` topics
        let limits = TopicLimits {
            system_prefixes: vec!["$".to_string()],
            ..TopicLimits::unbounded()
        };
        let name = config.name.clone();

        validate_topic_filter(&config.source.topic, &limits).map_err(|reason| {
            RuleError::InvalidSource {
                rule: name.clone(),
                reason,
            }
        })?;
        validate_topic_name(&config.target.topic, &limits).map_err(|reason| {
            RuleError::InvalidTarget {
                rule: name.clone(),
                reason,
            }
        })?;

        let qos = |value: u8| match QoS::from_u8(value) {
            Some(qos) if qos.is_supported() => Ok(qos),
            _ => Err(RuleError::InvalidQos {
                rule: name.clone(),
                qos: value,
            }),
        };
        let source_qos = qos(config.source.qos)?;
        let target_qos = qos(config.target.qos)?;

        let query = match config.sql.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Some(SqlQuery::parse(text).map_err(|source| {
                RuleError::Sql {
                    rule: name.clone(),
                    source,
                }
            })?),
            _ => None,
        };

        Ok(Self {
            name: config.name.as_str().into(),
            source: config.source.topic.clone(),
            source_qos,
            target: config.target.topic.as_str().into(),
            target_qos,
            query,
        })
    }

    /// Transform one message; `None` when the rule filters it out
    fn apply(&self, publish: &Publish, origin: &MessageContext) -> Option<Publish> {
        let qos = publish.qos.min(self.source_qos);
        let payload = match self.query {
            Some(ref query) => {
                let context = MessageContext {
                    client_id: origin.client_id.clone(),
                    client_ip: origin.client_ip,
                    topic: publish.topic.clone(),
                    qos,
                };
                Bytes::from(query.apply(&publish.payload, &context)?)
            }
            None => publish.payload.clone(),
        };

        Some(Publish {
            dup: false,
            qos: qos.min(self.target_qos),
            retain: false,
            topic: self.target.clone(),
            packet_id: None,
            payload,
        })
    }
}

/// Output of one rule for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutput {
    pub rule: Arc<str>,
    pub publish: Publish,
}

/// Rule set indexed by source filter
#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    index: TopicTrie<Vec<usize>>,
}

impl RuleEngine {
    pub fn new(configs: &[RuleConfig]) -> Result<Self, RuleError> {
        let mut engine = Self::default();
        let mut names = HashSet::new();

        for config in configs {
            if !names.insert(config.name.as_str()) {
                return Err(RuleError::DuplicateName(config.name.clone()));
            }
            let rule = Rule::compile(config)?;
            engine
                .index
                .entry(&rule.source)
                .get_or_insert_with(Vec::new)
                .push(engine.rules.len());
            engine.rules.push(rule);
        }

        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Run every rule whose source filter matches the message topic
    ///
    /// Outputs are returned in rule definition order.
    pub fn process(&self, publish: &Publish, origin: &MessageContext) -> Vec<RuleOutput> {
        if self.rules.is_empty() {
            return Vec::new();
        }

        let mut matched = Vec::new();
        self.index
            .matches(&publish.topic, |ids| matched.extend_from_slice(ids));
        matched.sort_unstable();

        matched
            .into_iter()
            .filter_map(|id| {
                let rule = &self.rules[id];
                match rule.apply(publish, origin) {
                    Some(publish) => Some(RuleOutput {
                        rule: rule.name.clone(),
                        publish,
                    }),
                    None => {
                        trace!(rule = %rule.name, topic = %publish.topic, "message filtered");
                        None
                    }
                }
            })
            .collect()
    }
}
