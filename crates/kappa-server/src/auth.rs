//! Authorized keys: which ed25519 keys may log in as which user.
//!
//! File format, one entry per line:
//!
//! ```text
//! # user  key (hex)                                                          comment
//! admin   3d4017c3e843895a92b70aa74d1b7ebc9c982ccf2ec4968cc0cd55f12af4660c   laptop
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use kappa_transport::auth::parse_public_key;
use kappa_transport::{
    AuthError, AuthLogCallback, AuthMethod, ConnMetadata, Permissions, PublicKeyAuthenticator,
    VerifyingKey,
};

use crate::config::ConfigError;

/// Permission extension carrying the hex public key used to log in.
pub const EXT_PUBKEY: &str = "pubkey";
/// Permission extension carrying the authenticated user name.
pub const EXT_USERNAME: &str = "username";

#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    keys: HashMap<String, Vec<VerifyingKey>>,
}

impl AuthorizedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut keys = Self::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(user), Some(key)) = (fields.next(), fields.next()) else {
                return Err(ConfigError::AuthorizedKeys {
                    line: idx + 1,
                    reason: "expected `<user> <key> [comment]`".into(),
                });
            };
            let key = parse_public_key(key).map_err(|e| ConfigError::AuthorizedKeys {
                line: idx + 1,
                reason: e.to_string(),
            })?;
            keys.insert(user, key);
        }
        Ok(keys)
    }

    pub fn insert(&mut self, user: impl Into<String>, key: VerifyingKey) {
        let entry = self.keys.entry(user.into()).or_default();
        if !entry.contains(&key) {
            entry.push(key);
        }
    }

    pub fn with_key(mut self, user: impl Into<String>, key: VerifyingKey) -> Self {
        self.insert(user, key);
        self
    }

    pub fn is_authorized(&self, user: &str, key: &VerifyingKey) -> bool {
        self.keys.get(user).is_some_and(|keys| keys.contains(key))
    }

    /// Number of users with at least one key.
    pub fn users(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl PublicKeyAuthenticator for AuthorizedKeys {
    fn authenticate(&self, meta: &ConnMetadata, key: &VerifyingKey) -> Result<Permissions, AuthError> {
        let Some(keys) = self.keys.get(&meta.user) else {
            return Err(AuthError::UnknownUser(meta.user.clone()));
        };
        if !keys.contains(key) {
            return Err(AuthError::Denied(format!(
                "key is not authorized for {}",
                meta.user
            )));
        }
        Ok(Permissions::new()
            .with_extension(EXT_PUBKEY, hex::encode(key.as_bytes()))
            .with_extension(EXT_USERNAME, meta.user.clone()))
    }
}

/// Auth log hook recording every attempt.
pub fn auth_log() -> AuthLogCallback {
    Arc::new(|meta: &ConnMetadata, method: AuthMethod, err: Option<&AuthError>| match err {
        None => info!(
            user = %meta.user,
            remote = %meta.remote_addr,
            %method,
            "authentication succeeded"
        ),
        Some(err) => warn!(
            user = %meta.user,
            remote = %meta.remote_addr,
            %method,
            error = %err,
            "authentication failed"
        ),
    })
}
