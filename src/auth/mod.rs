// ABOUTME: Authentication capability: resolves an opaque credential into a principal.
// ABOUTME: One backend (shared secret or token table) is selected from config at startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;
use crate::error::Result;

/// The identity a credential resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Principal {
    pub user: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,

    #[error("malformed credential: {0}")]
    Malformed(&'static str),

    #[error("credential rejected")]
    Rejected,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> std::result::Result<Principal, AuthError>;
}

/// Credentials of the form `user:secret` checked against one shared secret.
pub struct SharedSecretAuth {
    secret: String,
}

impl SharedSecretAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for SharedSecretAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretAuth").finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for SharedSecretAuth {
    async fn authenticate(&self, credential: &str) -> std::result::Result<Principal, AuthError> {
        let (user, secret) = credential
            .split_once(':')
            .ok_or(AuthError::Malformed("expected user:secret"))?;
        if user.is_empty() {
            return Err(AuthError::Malformed("empty user"));
        }
        if !constant_time_eq(secret.as_bytes(), self.secret.as_bytes()) {
            return Err(AuthError::Rejected);
        }

        Ok(Principal {
            user: user.to_string(),
            groups: Vec::new(),
        })
    }
}

/// Static table of bearer tokens.
pub struct TokenAuth {
    tokens: HashMap<String, Principal>,
}

impl TokenAuth {
    pub fn new(tokens: HashMap<String, Principal>) -> Self {
        Self { tokens }
    }
}

impl std::fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuth")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

#[async_trait]
impl Authenticator for TokenAuth {
    async fn authenticate(&self, credential: &str) -> std::result::Result<Principal, AuthError> {
        self.tokens
            .iter()
            .find(|(token, _)| constant_time_eq(token.as_bytes(), credential.as_bytes()))
            .map(|(_, principal)| principal.clone())
            .ok_or(AuthError::Rejected)
    }
}

/// Build the configured backend. Secrets referencing env vars are resolved here.
pub fn from_config(config: &AuthConfig) -> Result<Arc<dyn Authenticator>> {
    match config {
        AuthConfig::SharedSecret { secret } => Ok(Arc::new(SharedSecretAuth::new(secret.resolve()?))),
        AuthConfig::Tokens { tokens } => Ok(Arc::new(TokenAuth::new(tokens.clone()))),
    }
}

/// Length mismatches return early; contents are compared in constant time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
