//! Account identity verification.
//!
//! Secure handshakes prove account ownership through the Mojang session
//! server: the client performs a `join` against the auth token derived from
//! the handshake secret, and we ask `hasJoined` whether that happened. The
//! trait seam keeps the driver testable without network access.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

const SESSION_SERVER_URL: &str = "https://sessionserver.mojang.com";

const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum VerifyError {
    /// The identity service answered and did not vouch for this login.
    #[error("identity service rejected the login")]
    Rejected,
    /// The identity service could not be reached or answered incoherently.
    /// Callers treat this as an outage, not as proof of anything.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Answers whether `username` completed a session-service join against
/// `auth_key`, and with which account id.
#[async_trait]
pub trait AccountVerifier: Send + Sync {
    async fn verify(&self, username: &str, auth_key: &str) -> Result<Uuid, VerifyError>;
}

#[derive(Debug, Deserialize)]
struct HasJoinedResponse {
    /// The account id, 32 hex digits without dashes.
    id: String,
}

/// Production verifier backed by the Mojang session server.
pub struct MojangVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl MojangVerifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: SESSION_SERVER_URL.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for MojangVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountVerifier for MojangVerifier {
    async fn verify(&self, username: &str, auth_key: &str) -> Result<Uuid, VerifyError> {
        let url = format!(
            "{}/session/minecraft/hasJoined?username={username}&serverId={auth_key}",
            self.base_url
        );
        let response = self
            .client
            .get(&url)
            .timeout(VERIFY_TIMEOUT)
            .send()
            .await
            .map_err(|err| VerifyError::Unavailable(err.to_string()))?;

        let status = response.status();
        // 204 means the session server has no record of this join. Other
        // client errors mean the query itself was malformed, which a real
        // client never produces.
        if status == reqwest::StatusCode::NO_CONTENT || status.is_client_error() {
            return Err(VerifyError::Rejected);
        }
        if !status.is_success() {
            return Err(VerifyError::Unavailable(format!(
                "session server answered {status}"
            )));
        }

        let body: HasJoinedResponse = response
            .json()
            .await
            .map_err(|err| VerifyError::Unavailable(err.to_string()))?;
        Uuid::parse_str(&body.id)
            .map_err(|err| VerifyError::Unavailable(format!("malformed profile id: {err}")))
    }
}
