//! Authentication boundary.
//!
//! Credential storage and verification live outside this system; the core
//! only needs "given credentials, return a user identity or fail". The
//! default implementation issues guest identities for a claimed username and
//! hands back an opaque session token. A real verifier plugs in behind the
//! same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Not authorized, token failed")]
    InvalidToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserIdentity {
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub token: String,
    pub username: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Exchanges credentials for a session.
    async fn login(&self, username: &str) -> Result<Session, AuthError>;

    /// Resolves an opaque session token back to an identity.
    async fn identify(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

/// Guest-identity issuer: any non-empty username gets a session.
#[derive(Default)]
pub struct GuestAuthenticator {
    sessions: DashMap<String, String>,
}

impl GuestAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Authenticator for GuestAuthenticator {
    async fn login(&self, username: &str) -> Result<Session, AuthError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        let token = Uuid::new_v4().to_string();
        self.sessions.insert(token.clone(), username.to_string());
        Ok(Session {
            token,
            username: username.to_string(),
        })
    }

    async fn identify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        self.sessions
            .get(token)
            .map(|entry| UserIdentity {
                username: entry.value().clone(),
            })
            .ok_or(AuthError::InvalidToken)
    }
}
