//! ACL module tests

use super::*;
use crate::config::{AclConfig, AclPermissions, AclRole, AuthConfig, UserConfig};
use std::sync::Arc;

fn user(username: &str, role: Option<&str>) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: Some(format!("{}_pass", username)),
        password_hash: None,
        role: role.map(str::to_string),
    }
}

fn make_test_auth_provider() -> Arc<AuthProvider> {
    let auth_config = AuthConfig {
        enabled: true,
        allow_anonymous: false,
        users: vec![
            user("admin", Some("admin")),
            user("sensor", Some("device")),
            user("readonly", Some("reader")),
            user("tester", Some("permit")),
            user("orphan", Some("missing")),
        ],
    };
    Arc::new(AuthProvider::new(&auth_config))
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn make_test_acl_config() -> AclConfig {
    AclConfig {
        enabled: true,
        roles: vec![
            AclRole {
                name: "admin".to_string(),
                publish: strings(&["#"]),
                subscribe: strings(&["#"]),
            },
            AclRole {
                name: "device".to_string(),
                publish: strings(&["sensors/%c/#"]),
                subscribe: strings(&["commands/%c/#"]),
            },
            AclRole {
                name: "reader".to_string(),
                publish: vec![],
                subscribe: strings(&["sensors/#"]),
            },
            AclRole {
                name: "permit".to_string(),
                publish: strings(&["test/permit/plus/+", "test/permit/exact"]),
                subscribe: strings(&["test/permit/plus/+", "test/permit/hash/#"]),
            },
        ],
        default: AclPermissions {
            publish: strings(&["public/%u/out"]),
            subscribe: strings(&["public/#"]),
        },
    }
}

fn provider() -> AclProvider {
    AclProvider::new(&make_test_acl_config(), make_test_auth_provider())
}

#[tokio::test]
async fn test_acl_disabled_allows_all() {
    let acl_config = AclConfig {
        enabled: false,
        roles: vec![],
        default: AclPermissions::default(),
    };
    let provider = AclProvider::new(&acl_config, make_test_auth_provider());
    assert!(!provider.is_enabled());

    let result = provider
        .on_publish_check("client1", Some("anyone"), "any/topic", QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert!(result, "Should allow when ACL is disabled");
}

#[tokio::test]
async fn test_admin_can_publish_anywhere() {
    let provider = provider();

    let result = provider
        .on_publish_check(
            "admin_client",
            Some("admin"),
            "any/topic/here",
            QoS::AtMostOnce,
            false,
        )
        .await
        .unwrap();
    assert!(result, "Admin should be able to publish anywhere");
}

#[tokio::test]
async fn test_device_can_publish_to_own_topic() {
    let provider = provider();

    let own = provider
        .on_publish_check(
            "sensor_client",
            Some("sensor"),
            "sensors/sensor_client/temperature",
            QoS::AtLeastOnce,
            false,
        )
        .await
        .unwrap();
    assert!(own, "Device should publish to its own topic");

    let other = provider
        .on_publish_check(
            "sensor_client",
            Some("sensor"),
            "sensors/other_client/temperature",
            QoS::AtLeastOnce,
            false,
        )
        .await
        .unwrap();
    assert!(!other, "Device should not publish to another client's topic");
}

#[tokio::test]
async fn test_readonly_permissions() {
    let provider = provider();

    assert!(!provider
        .on_publish_check("reader", Some("readonly"), "sensors/temp", QoS::AtMostOnce, false)
        .await
        .unwrap());
    assert!(provider
        .on_subscribe_check("reader", Some("readonly"), "sensors/temperature", QoS::AtMostOnce)
        .await
        .unwrap());
    assert!(provider
        .on_subscribe_check("reader", Some("readonly"), "sensors/#", QoS::AtMostOnce)
        .await
        .unwrap());
    assert!(!provider
        .on_subscribe_check("reader", Some("readonly"), "commands/device1", QoS::AtMostOnce)
        .await
        .unwrap());
}

#[test]
fn test_requested_wildcards_need_covering_permission() {
    let provider = provider();
    let check = |filter: &str| {
        provider.authorize("c1", Some("tester"), Operation::Subscribe, filter)
    };

    // `+` in the permission covers any single level, including a literal `+`
    assert!(check("test/permit/plus/a"));
    assert!(check("test/permit/plus/+"));
    // `#` is a level the permission does not cover
    assert!(!check("test/permit/plus/#"));
    assert!(!check("test/permit/plus/a/b"));

    assert!(check("test/permit/hash"));
    assert!(check("test/permit/hash/a/b"));
    assert!(check("test/permit/hash/#"));

    assert!(!check("test/permit/+/a"));
    assert!(!check("test/#"));
}

#[test]
fn test_publish_exact_permission() {
    let provider = provider();
    assert!(provider.authorize("c1", Some("tester"), Operation::Publish, "test/permit/exact"));
    assert!(!provider.authorize(
        "c1",
        Some("tester"),
        Operation::Publish,
        "test/permit/exact/more"
    ));
    assert!(provider.authorize("c1", Some("tester"), Operation::Publish, "test/permit/plus/x"));
}

#[test]
fn test_default_permissions_apply_to_everyone() {
    let provider = provider();

    // Anonymous clients only get the defaults
    assert!(provider.authorize("anon", None, Operation::Subscribe, "public/news"));
    assert!(!provider.authorize("anon", None, Operation::Subscribe, "sensors/x"));

    // %u substitutes the empty string without a username
    assert!(provider.authorize("anon", None, Operation::Publish, "public//out"));
    assert!(provider.authorize("c1", Some("tester"), Operation::Publish, "public/tester/out"));
    assert!(!provider.authorize("c1", Some("tester"), Operation::Publish, "public/other/out"));

    // Role holders keep the defaults as well
    assert!(provider.authorize("c1", Some("readonly"), Operation::Subscribe, "public/a"));
}

#[test]
fn test_unknown_role_falls_back_to_defaults() {
    let provider = provider();
    assert!(provider.authorize("c1", Some("orphan"), Operation::Subscribe, "public/a"));
    assert!(!provider.authorize("c1", Some("orphan"), Operation::Subscribe, "sensors/a"));
    assert!(!provider.authorize("c1", Some("stranger"), Operation::Publish, "anything"));
}

#[test]
fn test_system_topics_not_granted_by_root_wildcard() {
    let provider = provider();
    assert!(!provider.authorize("c1", Some("admin"), Operation::Subscribe, "$SYS/uptime"));
}
