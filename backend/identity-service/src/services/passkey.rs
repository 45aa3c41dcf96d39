/// Passkey (WebAuthn) support through a hosted passkey provider
///
/// The provider runs the WebAuthn ceremonies; this service only relays the
/// opaque ceremony payloads and receives a signed token once a ceremony
/// completes. Tokens are RS256 JWTs verifiable against the tenant JWKS.
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::verifier::{verify_rs256, IdentityVerifier, JwksCache, VerifiedIdentity, VerifyOptions};
use crate::domain::UserId;
use crate::error::{IdentityError, Result};

const API_KEY_HEADER: &str = "apiKey";

fn tenant_url(base_url: &str, tenant_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), tenant_id)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct FailureResponse {
    #[serde(default)]
    message: String,
}

/// HTTP client for the passkey provider's ceremony endpoints
pub struct PasskeyClient {
    http: Client,
    tenant_url: String,
    api_key: String,
}

impl PasskeyClient {
    pub fn new(
        http: Client,
        base_url: &str,
        tenant_id: &str,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tenant_url: tenant_url(base_url, tenant_id),
            api_key: api_key.into(),
        }
    }

    /// Begin registering a new passkey for `user_id`
    pub async fn initialize_registration(&self, user_id: &UserId, username: &str) -> Result<Value> {
        debug!(user_id = %user_id, "Initializing passkey registration");
        self.post(
            "registration/initialize",
            &json!({ "user_id": user_id.to_string(), "username": username }),
        )
        .await
    }

    /// Complete registration with the authenticator's response; returns the
    /// provider token
    pub async fn finalize_registration(&self, credential: &Value) -> Result<String> {
        let response = self.post("registration/finalize", credential).await?;
        let token: TokenResponse = serde_json::from_value(response)?;
        info!("Passkey registration finalized");
        Ok(token.token)
    }

    /// Begin a login ceremony, optionally scoped to a known user
    pub async fn initialize_login(&self, user_id: Option<&UserId>) -> Result<Value> {
        let body = match user_id {
            Some(id) => json!({ "user_id": id.to_string() }),
            None => json!({}),
        };
        self.post("login/initialize", &body).await
    }

    /// Complete a login ceremony; returns the provider token
    pub async fn finalize_login(&self, credential: &Value) -> Result<String> {
        let response = self.post("login/finalize", credential).await?;
        let token: TokenResponse = serde_json::from_value(response)?;
        Ok(token.token)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(format!("{}/{}", self.tenant_url, path))
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(provider_failure(path, response).await);
        }

        Ok(response.json().await?)
    }
}

async fn provider_failure(path: &str, response: Response) -> IdentityError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<FailureResponse>(&text) {
        Ok(failure) if !failure.message.is_empty() => failure.message,
        _ if !text.is_empty() => text,
        _ => status.to_string(),
    };

    warn!(status = status.as_u16(), "Passkey provider rejected {}: {}", path, message);
    IdentityError::PasskeyProvider {
        status: status.as_u16(),
        message,
    }
}

/// Verifies tokens issued by the passkey provider
pub struct PasskeysVerifier {
    jwks: JwksCache,
}

impl PasskeysVerifier {
    pub fn new(http: Client, base_url: &str, tenant_id: &str) -> Self {
        let url = format!("{}/.well-known/jwks.json", tenant_url(base_url, tenant_id));
        Self {
            jwks: JwksCache::new(http, url),
        }
    }

    pub fn jwks_url(&self) -> &str {
        self.jwks.url()
    }
}

#[async_trait]
impl IdentityVerifier for PasskeysVerifier {
    async fn verify(
        &self,
        credential: &str,
        options: &VerifyOptions<'_>,
    ) -> Result<VerifiedIdentity> {
        let identity = verify_rs256(&self.jwks, credential, options.audience, &[]).await?;
        identity.check_nonce(options.nonce)?;
        Ok(identity)
    }
}
