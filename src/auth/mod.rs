//! Authentication Module
//!
//! Provides username/password authentication with plaintext password storage.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordVerifier};
use argon2::Argon2;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::config::AuthConfig;
use crate::hooks::{HookResult, Hooks};


/// Authentication provider
pub struct AuthProvider {
    /// Whether auth is enabled
    enabled: bool,
    /// Allow anonymous connections
    allow_anonymous: bool,
    /// User credentials map (username -> UserEntry)
    users: RwLock<HashMap<String, UserEntry>>,
    /// Connected client usernames (for ACL lookups)
    client_usernames: Arc<RwLock<HashMap<String, Option<String>>>>,
}

/// Internal user entry. Either `password` (plaintext, config-file convenience
/// for local development) or `password_hash` (argon2 PHC string) is set;
/// `password_hash` wins when both are present.
struct UserEntry {
    password: Option<String>,
    password_hash: Option<String>,
    role: Option<String>,
}

impl AuthProvider {
    /// Create a new auth provider from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let mut users = HashMap::new();

        for user in &config.users {
            users.insert(
                user.username.clone(),
                UserEntry {
                    password: user.password.clone(),
                    password_hash: user.password_hash.clone(),
                    role: user.role.clone(),
                },
            );
        }

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users: RwLock::new(users),
            client_usernames: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert or replace a user loaded from durable storage (argon2 hash only).
    pub fn set_user(&self, username: String, password_hash: String, role: Option<String>) {
        self.users.write().insert(
            username,
            UserEntry {
                password: None,
                password_hash: Some(password_hash),
                role,
            },
        );
    }

    /// Remove a user previously added with `set_user`.
    pub fn remove_user(&self, username: &str) {
        self.users.write().remove(username);
    }

    /// Check if auth is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Get the ACL role for a username
    pub fn get_user_role(&self, username: &str) -> Option<String> {
        self.users.read().get(username).and_then(|u| u.role.clone())
    }

    /// Get the username for a connected client
    pub fn get_client_username(&self, client_id: &str) -> Option<String> {
        self.client_usernames
            .read()
            .get(client_id)
            .and_then(|u| u.clone())
    }

    /// Verify a password against a stored entry. An argon2 hash, when
    /// present, always takes precedence over a plaintext password.
    fn verify_password(password: &[u8], entry: &UserEntry) -> bool {
        if let Some(hash) = &entry.password_hash {
            return match PasswordHash::new(hash) {
                Ok(parsed) => Argon2::default().verify_password(password, &parsed).is_ok(),
                Err(e) => {
                    warn!("stored password_hash is not a valid PHC string: {}", e);
                    false
                }
            };
        }

        if let Some(plaintext) = &entry.password {
            return std::str::from_utf8(password)
                .map(|pwd| pwd == plaintext)
                .unwrap_or(false);
        }

        false
    }

    /// Store client username mapping
    fn store_client_username(&self, client_id: &str, username: Option<&str>) {
        self.client_usernames
            .write()
            .insert(client_id.to_string(), username.map(|s| s.to_string()));
    }

    /// Remove client username mapping
    pub fn remove_client_username(&self, client_id: &str) {
        self.client_usernames.write().remove(client_id);
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
        // If auth is disabled, allow all
        if !self.enabled {
            self.store_client_username(client_id, username);
            return Ok(true);
        }

        // Check for anonymous connection
        if username.is_none() {
            if self.allow_anonymous {
                self.store_client_username(client_id, None);
                return Ok(true);
            } else {
                return Ok(false);
            }
        }

        let username = username.unwrap();
        let password = password.unwrap_or(&[]);

        // Look up user
        let verified = match self.users.read().get(username) {
            Some(entry) => Self::verify_password(password, entry),
            None => false,
        };

        if verified {
            self.store_client_username(client_id, Some(username));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, _graceful: bool) {
        self.remove_client_username(client_id);
    }
}
