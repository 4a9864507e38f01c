//! EdgeHub - MQTT v3.1/v3.1.1 edge broker
//!
//! A single-node broker for edge deployments: QoS 0/1 delivery with bounded
//! per-subscriber buffers, retained messages, persistent sessions and a
//! rule pipeline that republishes messages transformed by SQL expressions.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod hooks;
pub mod metrics;
pub mod persistence;
pub mod protocol;
pub mod retained;
pub mod rule;
pub mod session;
pub mod topic;
pub mod transport;

pub use acl::AclProvider;
pub use auth::AuthProvider;
pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use metrics::{Metrics, MetricsServer};
pub use persistence::{FjallBackend, PersistenceManager, StorageBackend};
pub use protocol::{ProtocolVersion, QoS};
pub use rule::RuleEngine;
