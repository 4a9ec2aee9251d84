//! Credential gateway capability
//!
//! Secret material flows from a gateway implementation straight into the
//! engine's process environment. Nothing here is ever logged or written to
//! the audit chain; audit entries only record opaque actor/action pairs.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials configured for repository {0}")]
    NotFound(String),

    #[error("credential backend unavailable: {0}")]
    Unavailable(String),
}

/// Repository secret with a redacted Debug so it cannot leak through
/// error formatting or tracing fields.
#[derive(Clone)]
pub struct Credentials {
    secret: String,
}

impl Credentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("secret", &"<redacted>").finish()
    }
}

#[async_trait]
pub trait CredentialGateway: Send + Sync {
    async fn resolve(&self, repository_id: &str) -> Result<Credentials, CredentialError>;
}

/// Gateway backed by process environment variables.
///
/// Looks up `TIMELOCKER_PASSWORD_<REPOSITORY_ID>` first, then falls back to
/// `TIMELOCKER_PASSWORD`. The OS keyring backend is out of scope; this is
/// the minimal deployment-friendly default.
pub struct EnvCredentialGateway;

#[async_trait]
impl CredentialGateway for EnvCredentialGateway {
    async fn resolve(&self, repository_id: &str) -> Result<Credentials, CredentialError> {
        let scoped = format!(
            "TIMELOCKER_PASSWORD_{}",
            repository_id.to_uppercase().replace('-', "_")
        );
        if let Ok(secret) = std::env::var(&scoped) {
            return Ok(Credentials::new(secret));
        }
        if let Ok(secret) = std::env::var("TIMELOCKER_PASSWORD") {
            return Ok(Credentials::new(secret));
        }
        Err(CredentialError::NotFound(repository_id.to_string()))
    }
}
