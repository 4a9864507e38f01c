//! ACL (Access Control List) Module
//!
//! Topic permissions per principal:
//! - Permission entries are topic filters (`+` and `#` allowed)
//! - Variable substitution (%c = client_id, %u = username)
//! - Principals get the permissions of their role, everyone gets the defaults
//! - No matching entry means denial

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::auth::AuthProvider;
use crate::config::AclConfig;
use crate::hooks::{HookResult, Hooks};
use crate::protocol::QoS;

#[cfg(test)]
mod tests;

/// Operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Publish,
    Subscribe,
}

struct AclRoleEntry {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

impl AclRoleEntry {
    fn filters(&self, operation: Operation) -> &[String] {
        match operation {
            Operation::Publish => &self.publish,
            Operation::Subscribe => &self.subscribe,
        }
    }
}

/// ACL provider
pub struct AclProvider {
    enabled: bool,
    roles: HashMap<String, AclRoleEntry>,
    default: AclRoleEntry,
    /// Source of the principal -> role mapping
    auth_provider: Arc<AuthProvider>,
}

impl AclProvider {
    pub fn new(config: &AclConfig, auth_provider: Arc<AuthProvider>) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    AclRoleEntry {
                        publish: role.publish.clone(),
                        subscribe: role.subscribe.clone(),
                    },
                )
            })
            .collect();

        Self {
            enabled: config.enabled,
            roles,
            default: AclRoleEntry {
                publish: config.default.publish.clone(),
                subscribe: config.default.subscribe.clone(),
            },
            auth_provider,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check one operation on a topic name or requested filter
    ///
    /// A requested subscription filter is granted only when the permission
    /// covers every topic it can match: `a/+` needs `a/+` or `a/#`, `a/#`
    /// needs `a/#`.
    pub fn authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        operation: Operation,
        topic: &str,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        let role = username
            .and_then(|u| self.auth_provider.user_role(u))
            .and_then(|name| self.roles.get(name));

        let allowed = role
            .into_iter()
            .chain(std::iter::once(&self.default))
            .flat_map(|entry| entry.filters(operation))
            .any(|pattern| Self::matches_pattern(pattern, topic, client_id, username));

        if !allowed {
            debug!(
                "ACL denied {:?} on {} for client {} ({:?})",
                operation, topic, client_id, username
            );
        }
        allowed
    }

    fn matches_pattern(
        pattern: &str,
        topic: &str,
        client_id: &str,
        username: Option<&str>,
    ) -> bool {
        if !pattern.contains('%') {
            return filter_covers(pattern, topic);
        }
        let pattern = pattern
            .replace("%c", client_id)
            .replace("%u", username.unwrap_or(""));
        filter_covers(&pattern, topic)
    }
}

/// Whether every topic matched by `requested` is matched by `permission`
///
/// For a plain topic name this is ordinary filter matching, `$` exclusion
/// included.
fn filter_covers(permission: &str, requested: &str) -> bool {
    if requested.starts_with('$') && (permission.starts_with('+') || permission.starts_with('#')) {
        return false;
    }

    let mut permission_levels = permission.split('/');
    let mut requested_levels = requested.split('/');

    loop {
        match (permission_levels.next(), requested_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(level)) if level != "#" => {}
            (Some(p), Some(r)) if p == r => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[async_trait]
impl Hooks for AclProvider {
    async fn on_publish_check(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        _qos: QoS,
        _retain: bool,
    ) -> HookResult<bool> {
        Ok(self.authorize(client_id, username, Operation::Publish, topic))
    }

    async fn on_subscribe_check(
        &self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
        _qos: QoS,
    ) -> HookResult<bool> {
        Ok(self.authorize(client_id, username, Operation::Subscribe, filter))
    }
}

#[cfg(test)]
mod pattern_tests {
    use super::*;

    #[test]
    fn test_variable_substitution() {
        assert!(AclProvider::matches_pattern(
            "sensors/%c/#",
            "sensors/client1/temp",
            "client1",
            None
        ));
        assert!(!AclProvider::matches_pattern(
            "sensors/%c/#",
            "sensors/client2/temp",
            "client1",
            None
        ));
        assert!(AclProvider::matches_pattern(
            "users/%u/data",
            "users/admin/data",
            "client1",
            Some("admin")
        ));
    }

    #[test]
    fn test_filter_covers() {
        assert!(filter_covers("a/+", "a/b"));
        assert!(filter_covers("a/+", "a/+"));
        assert!(!filter_covers("a/+", "a/#"));
        assert!(filter_covers("a/#", "a/#"));
        assert!(filter_covers("a/#", "a/+/c"));
        assert!(!filter_covers("a/b", "a/+"));
        assert!(!filter_covers("#", "$SYS/x"));
        assert!(filter_covers("$SYS/#", "$SYS/x"));
    }

    #[test]
    fn test_parent_level_matches_multi_wildcard() {
        assert!(AclProvider::matches_pattern("foo/#", "foo", "c", None));
        assert!(!AclProvider::matches_pattern("foo/+", "foo", "c", None));
    }
}
