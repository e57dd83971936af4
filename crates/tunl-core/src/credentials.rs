//! Credentials
//!
//! Key and certificate material a tunnel authenticates with. The manager
//! asks the [`CredentialService`] before every connect and clears it on
//! logout.

use crate::keys::KeyPair;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key and certificate material for one session
#[derive(Debug, Clone)]
pub struct Credential {
    /// Client key pair
    pub keys: KeyPair,
    /// Client certificate (PEM), when the service issues one
    pub certificate: Option<String>,
    /// Expiry of the certificate
    pub expires_at: Option<SystemTime>,
}

impl Credential {
    /// Credential with only a key pair
    pub fn from_keys(keys: KeyPair) -> Self {
        Self {
            keys,
            certificate: None,
            expires_at: None,
        }
    }

    /// Has it expired?
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at <= SystemTime::now())
    }
}

/// Key/certificate issuance boundary
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Current credential for a session
    async fn get_credential(&self, session: &SessionId) -> Result<Credential, CredentialError>;

    /// Forget everything held for a session
    async fn clear(&self, session: &SessionId);
}

/// Credential store generating a key pair per session
pub struct LocalCredentialStore {
    entries: RwLock<HashMap<SessionId, Credential>>,
    validity: Duration,
}

impl LocalCredentialStore {
    /// Create a store whose credentials live for `validity`
    pub fn new(validity: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            validity,
        }
    }

    /// Number of sessions holding a credential
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for LocalCredentialStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait]
impl CredentialService for LocalCredentialStore {
    async fn get_credential(&self, session: &SessionId) -> Result<Credential, CredentialError> {
        if session.0.is_empty() {
            return Err(CredentialError::NoSession);
        }
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(session) {
            if !existing.is_expired() {
                return Ok(existing.clone());
            }
            debug!("Credential for session {} expired, regenerating", session);
        }
        let credential = Credential {
            keys: KeyPair::generate(),
            certificate: None,
            expires_at: Some(SystemTime::now() + self.validity),
        };
        info!("Issued credential {} for session {}", credential.keys.public, session);
        entries.insert(session.clone(), credential.clone());
        Ok(credential)
    }

    async fn clear(&self, session: &SessionId) {
        if self.entries.write().await.remove(session).is_some() {
            info!("Cleared credential for session {}", session);
        }
    }
}

/// Credential errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("No active session")]
    NoSession,

    #[error("Credential rejected: {0}")]
    Rejected(String),

    #[error("Credential service unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_credential_cached_per_session() {
        let store = LocalCredentialStore::default();
        let session = SessionId::new("s1");
        let a = store.get_credential(&session).await.unwrap();
        let b = store.get_credential(&session).await.unwrap();
        assert_eq!(a.keys.public, b.keys.public);

        let other = store.get_credential(&SessionId::new("s2")).await.unwrap();
        assert_ne!(a.keys.public, other.keys.public);
    }

    #[tokio::test]
    async fn test_clear_regenerates() {
        let store = LocalCredentialStore::default();
        let session = SessionId::new("s1");
        let a = store.get_credential(&session).await.unwrap();
        store.clear(&session).await;
        assert_eq!(store.len().await, 0);
        let b = store.get_credential(&session).await.unwrap();
        assert_ne!(a.keys.public, b.keys.public);
    }

    #[tokio::test]
    async fn test_expired_credential_regenerates() {
        let store = LocalCredentialStore::new(Duration::ZERO);
        let session = SessionId::new("s1");
        let a = store.get_credential(&session).await.unwrap();
        assert!(a.is_expired());
        let b = store.get_credential(&session).await.unwrap();
        assert_ne!(a.keys.public, b.keys.public);
    }

    #[tokio::test]
    async fn test_empty_session_rejected() {
        let store = LocalCredentialStore::default();
        let result = store.get_credential(&SessionId::new("")).await;
        assert!(matches!(result, Err(CredentialError::NoSession)));
    }
}
