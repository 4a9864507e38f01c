//! Authentication Module
//!
//! Username/password authentication against the configured principals.
//! Passwords are stored either in plaintext or as argon2 PHC hashes.
//! Connections over a verified client certificate only need a username that
//! names a principal.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::hooks::{HookResult, Hooks};

#[cfg(test)]
mod tests;

/// Stored credential of a principal
enum Credential {
    Plain(String),
    /// argon2 PHC string
    Hash(String),
    /// Certificate-only principal
    None,
}

struct UserEntry {
    credential: Credential,
    role: Option<String>,
}

/// Authentication provider
pub struct AuthProvider {
    enabled: bool,
    allow_anonymous: bool,
    users: HashMap<String, UserEntry>,
}

impl AuthProvider {
    pub fn new(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|user| {
                let credential = match (&user.password, &user.password_hash) {
                    (_, Some(hash)) => Credential::Hash(hash.clone()),
                    (Some(password), None) => Credential::Plain(password.clone()),
                    (None, None) => Credential::None,
                };
                (
                    user.username.clone(),
                    UserEntry {
                        credential,
                        role: user.role.clone(),
                    },
                )
            })
            .collect();

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a username names a configured principal
    pub fn has_principal(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Permission role of a principal
    pub fn user_role(&self, username: &str) -> Option<&str> {
        self.users.get(username).and_then(|u| u.role.as_deref())
    }

    fn verify_password(credential: &Credential, password: &[u8]) -> bool {
        match credential {
            Credential::Plain(stored) => password == stored.as_bytes(),
            Credential::Hash(stored) => match PasswordHash::new(stored) {
                Ok(parsed) => Argon2::default()
                    .verify_password(password, &parsed)
                    .is_ok(),
                Err(e) => {
                    warn!("unparseable password hash: {}", e);
                    false
                }
            },
            Credential::None => false,
        }
    }
}

#[async_trait]
impl Hooks for AuthProvider {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }

        let username = match username {
            Some(username) => username,
            None => return Ok(self.allow_anonymous),
        };

        let allowed = match self.users.get(username) {
            Some(user) => Self::verify_password(&user.credential, password.unwrap_or(&[])),
            None => false,
        };
        if !allowed {
            debug!("Client {} failed authentication as {}", client_id, username);
        }
        Ok(allowed)
    }

    async fn on_authenticate_certificate(
        &self,
        client_id: &str,
        username: Option<&str>,
    ) -> HookResult<bool> {
        let allowed = username.is_some_and(|u| self.has_principal(u));
        if !allowed {
            debug!(
                "Client {} presented a certificate without a known principal",
                client_id
            );
        }
        Ok(allowed)
    }
}
