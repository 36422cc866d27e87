//! OpenID Connect client-credentials grant against a Keycloak realm.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{IssuedToken, TokenProvider};
use crate::config::IdentityProviderConfig;
use crate::errors::CredentialError;

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    DEFAULT_EXPIRES_IN_SECS
}

/// Fetches service tokens from `<url>/realms/<realm>/protocol/openid-connect/token`.
pub struct KeycloakTokenProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl KeycloakTokenProvider {
    /// Build a provider with its own HTTP client.
    pub fn new(config: &IdentityProviderConfig) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()?;

        Ok(Self {
            client,
            token_url: config.token_url(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }

    /// Token endpoint this provider posts to.
    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl TokenProvider for KeycloakTokenProvider {
    async fn fetch_token(&self) -> Result<IssuedToken, CredentialError> {
        debug!(url = %self.token_url, client_id = %self.client_id, "Requesting client-credentials token");

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "openid"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| CredentialError::InvalidResponse(e.to_string()))?;

        if parsed.access_token.is_empty() {
            return Err(CredentialError::InvalidResponse(
                "access_token is empty".to_string(),
            ));
        }

        Ok(IssuedToken {
            access_token: parsed.access_token,
            expires_in: Duration::from_secs(parsed.expires_in),
        })
    }
}
