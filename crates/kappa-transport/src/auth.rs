//! Client authentication.
//!
//! After TLS the server issues a random nonce. The client answers with an
//! [`AuthRequest`] carrying either an ed25519 public key plus a signature
//! over `nonce || user`, or a password. Signatures are verified here;
//! whether the key or password is *acceptable* is decided by the injected
//! [`PublicKeyAuthenticator`] / [`PasswordAuthenticator`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Length of the server's challenge nonce.
pub const NONCE_LEN: usize = 32;

/// What the server knows about a connection while authenticating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnMetadata {
    pub user: String,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Facts established by a successful authentication, handed to every
/// channel handler on the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    pub extensions: HashMap<String, String>,
}

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }
}

/// Authentication method of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    PublicKey,
    Password,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey => f.write_str("publickey"),
            Self::Password => f.write_str("password"),
        }
    }
}

/// Decides whether a (verified) public key may log in as the user.
pub trait PublicKeyAuthenticator: Send + Sync {
    fn authenticate(&self, meta: &ConnMetadata, key: &VerifyingKey) -> Result<Permissions, AuthError>;
}

/// Decides whether a password is valid for the user.
pub trait PasswordAuthenticator: Send + Sync {
    fn authenticate(&self, meta: &ConnMetadata, password: &str) -> Result<Permissions, AuthError>;
}

impl<F> PublicKeyAuthenticator for F
where
    F: Fn(&ConnMetadata, &VerifyingKey) -> Result<Permissions, AuthError> + Send + Sync,
{
    fn authenticate(&self, meta: &ConnMetadata, key: &VerifyingKey) -> Result<Permissions, AuthError> {
        self(meta, key)
    }
}

impl<F> PasswordAuthenticator for F
where
    F: Fn(&ConnMetadata, &str) -> Result<Permissions, AuthError> + Send + Sync,
{
    fn authenticate(&self, meta: &ConnMetadata, password: &str) -> Result<Permissions, AuthError> {
        self(meta, password)
    }
}

/// Observer invoked after every authentication attempt.
pub type AuthLogCallback = Arc<dyn Fn(&ConnMetadata, AuthMethod, Option<&AuthError>) + Send + Sync>;

/// The set of authenticators a server accepts.
#[derive(Clone, Default)]
pub struct Authenticators {
    public_key: Option<Arc<dyn PublicKeyAuthenticator>>,
    password: Option<Arc<dyn PasswordAuthenticator>>,
    auth_log: Option<AuthLogCallback>,
}

impl Authenticators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_public_key(mut self, auth: impl PublicKeyAuthenticator + 'static) -> Self {
        self.public_key = Some(Arc::new(auth));
        self
    }

    pub fn with_password(mut self, auth: impl PasswordAuthenticator + 'static) -> Self {
        self.password = Some(Arc::new(auth));
        self
    }

    pub fn with_auth_log(mut self, callback: AuthLogCallback) -> Self {
        self.auth_log = Some(callback);
        self
    }

    /// True when no method is configured; such a server cannot accept anyone.
    pub fn is_empty(&self) -> bool {
        self.public_key.is_none() && self.password.is_none()
    }

    /// Check one attempt and report it to the auth log.
    pub(crate) fn authenticate(
        &self,
        meta: &ConnMetadata,
        credential: &Credential,
        nonce: &[u8],
    ) -> Result<Permissions, AuthError> {
        let method = credential.method();
        let result = match credential {
            Credential::PublicKey { key, signature } => match &self.public_key {
                Some(auth) => verify_signature(key, signature, nonce, &meta.user)
                    .and_then(|key| auth.authenticate(meta, &key)),
                None => Err(AuthError::MethodNotAllowed(method.to_string())),
            },
            Credential::Password { password } => match &self.password {
                Some(auth) => auth.authenticate(meta, password),
                None => Err(AuthError::MethodNotAllowed(method.to_string())),
            },
        };
        if let Some(log) = &self.auth_log {
            log(meta, method, result.as_ref().err());
        }
        result
    }
}

/// Credential presented by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum Credential {
    /// Hex ed25519 public key and hex signature over `nonce || user`.
    PublicKey { key: String, signature: String },
    Password { password: String },
}

impl Credential {
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::PublicKey { .. } => AuthMethod::PublicKey,
            Self::Password { .. } => AuthMethod::Password,
        }
    }

    /// Sign the challenge with `key`.
    pub fn sign(key: &SigningKey, nonce: &[u8], user: &str) -> Self {
        let signature = key.sign(&challenge(nonce, user));
        Self::PublicKey {
            key: hex::encode(key.verifying_key().as_bytes()),
            signature: hex::encode(signature.to_bytes()),
        }
    }
}

/// Body of an `AuthRequest` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub user: String,
    #[serde(flatten)]
    pub credential: Credential,
}

fn challenge(nonce: &[u8], user: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(nonce.len() + user.len());
    msg.extend_from_slice(nonce);
    msg.extend_from_slice(user.as_bytes());
    msg
}

/// Parse a hex-encoded ed25519 public key.
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey, AuthError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| AuthError::InvalidKey("expected 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| AuthError::InvalidKey(e.to_string()))
}

fn verify_signature(
    hex_key: &str,
    hex_signature: &str,
    nonce: &[u8],
    user: &str,
) -> Result<VerifyingKey, AuthError> {
    let key = parse_public_key(hex_key)?;
    let sig_bytes = hex::decode(hex_signature).map_err(|_| AuthError::BadSignature)?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| AuthError::BadSignature)?;
    key.verify_strict(&challenge(nonce, user), &signature)
        .map_err(|_| AuthError::BadSignature)?;
    Ok(key)
}
