//! Rule definitions

use serde::{Deserialize, Serialize};

/// One rule: messages on `source` are optionally transformed by `sql` and
/// republished to `target`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleConfig {
    pub name: String,
    pub source: RuleEndpoint,
    pub target: RuleEndpoint,
    /// SQL handler; without one the payload is forwarded unchanged
    #[serde(default)]
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleEndpoint {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
}
