//! Auth module tests

use argon2::password_hash::{PasswordHasher, SaltString};

use super::*;
use crate::config::{AuthConfig, UserConfig};

fn make_auth_config(enabled: bool, allow_anonymous: bool, users: Vec<UserConfig>) -> AuthConfig {
    AuthConfig {
        enabled,
        allow_anonymous,
        users,
    }
}

fn make_user_plaintext(username: &str, password: &str, role: Option<&str>) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: Some(password.to_string()),
        password_hash: None,
        role: role.map(|s| s.to_string()),
    }
}

fn make_user_hashed(username: &str, password: &str) -> UserConfig {
    let salt = SaltString::encode_b64(b"edgehub-test-salt").unwrap();
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string();
    UserConfig {
        username: username.to_string(),
        password: None,
        password_hash: Some(hash),
        role: None,
    }
}

fn make_user_certificate(username: &str) -> UserConfig {
    UserConfig {
        username: username.to_string(),
        password: None,
        password_hash: None,
        role: None,
    }
}

#[tokio::test]
async fn test_auth_disabled_allows_all() {
    let provider = AuthProvider::new(&make_auth_config(false, false, vec![]));

    let result = provider
        .on_authenticate("client1", Some("user"), Some(b"pass"))
        .await
        .unwrap();
    assert!(result, "Should allow when auth is disabled");
}

#[tokio::test]
async fn test_auth_enabled_rejects_unknown_user() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![make_user_plaintext("admin", "secret", None)],
    ));

    let result = provider
        .on_authenticate("client1", Some("unknown"), Some(b"pass"))
        .await
        .unwrap();
    assert!(!result, "Should reject unknown user");
}

#[tokio::test]
async fn test_plaintext_password() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![make_user_plaintext("admin", "secret", Some("admin"))],
    ));

    assert!(provider
        .on_authenticate("client1", Some("admin"), Some(b"secret"))
        .await
        .unwrap());
    assert!(!provider
        .on_authenticate("client1", Some("admin"), Some(b"wrong"))
        .await
        .unwrap());
    assert!(!provider
        .on_authenticate("client1", Some("admin"), None)
        .await
        .unwrap());
    assert_eq!(provider.user_role("admin"), Some("admin"));
}

#[tokio::test]
async fn test_anonymous() {
    let users = vec![make_user_plaintext("admin", "secret", None)];

    let provider = AuthProvider::new(&make_auth_config(true, false, users.clone()));
    assert!(!provider.on_authenticate("c", None, None).await.unwrap());

    let provider = AuthProvider::new(&make_auth_config(true, true, users));
    assert!(provider.on_authenticate("c", None, None).await.unwrap());
}

#[tokio::test]
async fn test_password_hash() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![
            make_user_hashed("hash_user", "secret"),
            make_user_plaintext("plain_user", "plain", None),
        ],
    ));

    assert!(provider
        .on_authenticate("client1", Some("hash_user"), Some(b"secret"))
        .await
        .unwrap());
    assert!(!provider
        .on_authenticate("client1", Some("hash_user"), Some(b"wrong"))
        .await
        .unwrap());
    assert!(provider
        .on_authenticate("client2", Some("plain_user"), Some(b"plain"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_certificate_principal() {
    let provider = AuthProvider::new(&make_auth_config(
        true,
        false,
        vec![make_user_certificate("device-1")],
    ));

    assert!(provider
        .on_authenticate_certificate("c1", Some("device-1"))
        .await
        .unwrap());
    assert!(!provider
        .on_authenticate_certificate("c1", Some("device-2"))
        .await
        .unwrap());
    assert!(!provider
        .on_authenticate_certificate("c1", None)
        .await
        .unwrap());

    // A certificate-only principal cannot log in with a password
    assert!(!provider
        .on_authenticate("c1", Some("device-1"), Some(b""))
        .await
        .unwrap());
}
