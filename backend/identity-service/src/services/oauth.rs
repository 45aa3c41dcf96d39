/// OAuth identity providers
///
/// Supports:
/// - Google (ID tokens verified against Google's JWKS)
/// - LINE (ID tokens verified by LINE's verify endpoint, plus the
///   authorization-code login flow)
///
/// ## Security
///
/// - LINE state tokens live for 10 minutes and are consumed on first use
/// - Each LINE login carries a nonce that the returned ID token must echo
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::verifier::{verify_rs256, IdentityVerifier, JwksCache, VerifiedIdentity, VerifyOptions};
use crate::error::{IdentityError, Result};

pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

const LINE_AUTHORIZE_URL: &str = "https://access.line.me/oauth2/v2.1/authorize";
pub const LINE_API_BASE_URL: &str = "https://api.line.me";
const LINE_STATE_TTL_SECS: i64 = 600; // 10 minutes
const RANDOM_TOKEN_LEN: usize = 32;

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Google ID token verifier
pub struct GoogleVerifier {
    jwks: JwksCache,
}

impl GoogleVerifier {
    pub fn new(http: Client) -> Self {
        Self::with_jwks_url(http, GOOGLE_JWKS_URL)
    }

    pub fn with_jwks_url(http: Client, url: impl Into<String>) -> Self {
        Self {
            jwks: JwksCache::new(http, url),
        }
    }
}

#[async_trait]
impl IdentityVerifier for GoogleVerifier {
    async fn verify(
        &self,
        credential: &str,
        options: &VerifyOptions<'_>,
    ) -> Result<VerifiedIdentity> {
        let identity = verify_rs256(&self.jwks, credential, options.audience, &GOOGLE_ISSUERS).await?;
        identity.check_nonce(options.nonce)?;

        debug!("Verified Google ID token for sub={}", identity.subject);
        Ok(identity)
    }
}

#[derive(Debug, Deserialize)]
struct LineErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

impl LineErrorResponse {
    fn reason(&self) -> String {
        if self.error_description.is_empty() {
            self.error.clone()
        } else {
            format!("{}: {}", self.error, self.error_description)
        }
    }
}

async fn line_error(response: reqwest::Response) -> IdentityError {
    let status = response.status();
    let reason = match response.json::<LineErrorResponse>().await {
        Ok(body) => body.reason(),
        Err(_) => status.to_string(),
    };
    warn!("LINE request rejected ({}): {}", status, reason);
    IdentityError::VerificationFailed(reason)
}

/// LINE ID token verifier backed by `POST /oauth2/v2.1/verify`
pub struct LineVerifier {
    http: Client,
    base_url: String,
}

impl LineVerifier {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, LINE_API_BASE_URL)
    }

    pub fn with_base_url(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl IdentityVerifier for LineVerifier {
    async fn verify(
        &self,
        credential: &str,
        options: &VerifyOptions<'_>,
    ) -> Result<VerifiedIdentity> {
        let mut form = vec![("id_token", credential), ("client_id", options.audience)];
        if let Some(nonce) = options.nonce {
            form.push(("nonce", nonce));
        }

        let response = self
            .http
            .post(format!("{}/oauth2/v2.1/verify", self.base_url))
            .form(&form)
            .send()
            .await
            .map_err(|e| IdentityError::VerificationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(line_error(response).await);
        }

        let claims: Map<String, Value> = response
            .json()
            .await
            .map_err(|e| IdentityError::VerificationFailed(e.to_string()))?;

        let identity = VerifiedIdentity::from_claims(claims)?;
        identity.check_nonce(options.nonce)?;

        debug!("Verified LINE ID token for sub={}", identity.subject);
        Ok(identity)
    }
}

/// Authorization URL response
#[derive(Debug, Serialize)]
pub struct LineAuthorizationUrl {
    pub url: String,
    pub state: String,
}

/// ID token obtained from a completed LINE login, with the nonce it must carry
#[derive(Debug, Clone)]
pub struct LineAuthorization {
    pub id_token: String,
    pub nonce: String,
}

#[derive(Debug, Clone)]
struct PendingLogin {
    nonce: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct LineTokenResponse {
    id_token: String,
}

/// LINE authorization-code login flow
pub struct LineLogin {
    channel_id: String,
    channel_secret: String,
    redirect_uri: String,
    http: Client,
    base_url: String,
    pending: DashMap<String, PendingLogin>,
}

impl LineLogin {
    pub fn new(
        http: Client,
        channel_id: impl Into<String>,
        channel_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_secret: channel_secret.into(),
            redirect_uri: redirect_uri.into(),
            http,
            base_url: LINE_API_BASE_URL.to_string(),
            pending: DashMap::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Start a login: remember `state -> nonce` and build the authorize URL
    pub fn authorization_url(&self) -> LineAuthorizationUrl {
        self.purge_expired();

        let state = random_token();
        let nonce = random_token();

        let url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&state={}&scope=openid%20profile%20email&nonce={}",
            LINE_AUTHORIZE_URL,
            urlencoding::encode(&self.channel_id),
            urlencoding::encode(&self.redirect_uri),
            state,
            nonce
        );

        self.pending.insert(
            state.clone(),
            PendingLogin {
                nonce,
                expires_at: Utc::now() + Duration::seconds(LINE_STATE_TTL_SECS),
            },
        );

        LineAuthorizationUrl { url, state }
    }

    /// Finish a login: consume `state` and exchange `code` for an ID token
    pub async fn exchange(&self, code: &str, state: &str) -> Result<LineAuthorization> {
        let (_, pending) = self
            .pending
            .remove(state)
            .ok_or(IdentityError::InvalidOAuthState)?;
        if pending.expires_at < Utc::now() {
            return Err(IdentityError::InvalidOAuthState);
        }

        let response = self
            .http
            .post(format!("{}/oauth2/v2.1/token", self.base_url))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("client_id", self.channel_id.as_str()),
                ("client_secret", self.channel_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| IdentityError::VerificationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(line_error(response).await);
        }

        let tokens: LineTokenResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::VerificationFailed(e.to_string()))?;

        Ok(LineAuthorization {
            id_token: tokens.id_token,
            nonce: pending.nonce,
        })
    }

    /// Number of logins still awaiting a callback
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn purge_expired(&self) {
        let now = Utc::now();
        self.pending.retain(|_, login| login.expires_at >= now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::verifier::test_support::{claims, jwks_body, sign};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_google_verifier_accepts_both_issuer_forms() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth2/v3/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body()))
            .mount(&server)
            .await;

        let verifier =
            GoogleVerifier::with_jwks_url(Client::new(), format!("{}/oauth2/v3/certs", server.uri()));
        let options = VerifyOptions {
            audience: "google-client",
            nonce: None,
        };

        for issuer in GOOGLE_ISSUERS {
            let mut token_claims = claims(issuer, "google-client", "100043685676652067799");
            token_claims["email"] = json!("mirror@x.com");
            let identity = verifier.verify(&sign(token_claims), &options).await.unwrap();
            assert_eq!(identity.subject.as_str(), "100043685676652067799");
            assert_eq!(identity.claim("email"), Some("mirror@x.com"));
        }

        let foreign = sign(claims("https://evil.example.com", "google-client", "x"));
        assert!(matches!(
            verifier.verify(&foreign, &options).await,
            Err(IdentityError::VerificationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_line_verifier_sends_client_id_and_nonce() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v2.1/verify"))
            .and(body_string_contains("client_id=channel-1"))
            .and(body_string_contains("nonce=n-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "iss": "https://access.line.me",
                "sub": "U1234",
                "aud": "channel-1",
                "nonce": "n-123",
                "name": "Lin",
                "email": "lin@example.com",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let verifier = LineVerifier::with_base_url(Client::new(), server.uri());
        let identity = verifier
            .verify(
                "line-id-token",
                &VerifyOptions {
                    audience: "channel-1",
                    nonce: Some("n-123"),
                },
            )
            .await
            .unwrap();

        assert_eq!(identity.subject.as_str(), "U1234");
        assert_eq!(identity.claim("name"), Some("Lin"));
    }

    #[tokio::test]
    async fn test_line_verifier_surfaces_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v2.1/verify"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_request",
                "error_description": "Invalid IdToken Nonce.",
            })))
            .mount(&server)
            .await;

        let verifier = LineVerifier::with_base_url(Client::new(), server.uri());
        let result = verifier
            .verify(
                "replayed-token",
                &VerifyOptions {
                    audience: "channel-1",
                    nonce: Some("stale"),
                },
            )
            .await;

        match result {
            Err(IdentityError::VerificationFailed(reason)) => {
                assert!(reason.contains("Invalid IdToken Nonce."))
            }
            other => panic!("unexpected result: {:?}", other.map(|i| i.subject)),
        }
    }

    #[tokio::test]
    async fn test_line_verifier_detects_nonce_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v2.1/verify"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"sub": "U1", "nonce": "other"})),
            )
            .mount(&server)
            .await;

        let verifier = LineVerifier::with_base_url(Client::new(), server.uri());
        let result = verifier
            .verify(
                "token",
                &VerifyOptions {
                    audience: "channel-1",
                    nonce: Some("expected"),
                },
            )
            .await;
        assert!(matches!(result, Err(IdentityError::NonceMismatch)));
    }

    #[test]
    fn test_line_authorization_url() {
        let login = LineLogin::new(
            Client::new(),
            "channel-1",
            "secret",
            "https://id.example.com/auth/line/callback",
        );

        let auth = login.authorization_url();
        assert!(auth.url.starts_with(LINE_AUTHORIZE_URL));
        assert!(auth.url.contains("client_id=channel-1"));
        assert!(auth
            .url
            .contains("redirect_uri=https%3A%2F%2Fid.example.com%2Fauth%2Fline%2Fcallback"));
        assert!(auth.url.contains(&format!("state={}", auth.state)));
        assert_eq!(auth.state.len(), RANDOM_TOKEN_LEN);
        assert_eq!(login.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_line_exchange_consumes_state_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v2.1/token"))
            .and(body_string_contains("code=auth-code"))
            .and(body_string_contains("client_secret=secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "id_token": "line-id-token",
                "token_type": "Bearer",
                "expires_in": 2592000,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let login = LineLogin::new(Client::new(), "channel-1", "secret", "https://cb")
            .with_base_url(server.uri());
        let auth = login.authorization_url();
        let expected_nonce = login.pending.get(&auth.state).unwrap().nonce.clone();

        let result = login.exchange("auth-code", &auth.state).await.unwrap();
        assert_eq!(result.id_token, "line-id-token");
        assert_eq!(result.nonce, expected_nonce);

        assert!(matches!(
            login.exchange("auth-code", &auth.state).await,
            Err(IdentityError::InvalidOAuthState)
        ));
    }

    #[tokio::test]
    async fn test_line_exchange_rejects_expired_state() {
        let login = LineLogin::new(Client::new(), "channel-1", "secret", "https://cb");
        login.pending.insert(
            "old-state".into(),
            PendingLogin {
                nonce: "n".into(),
                expires_at: Utc::now() - Duration::seconds(1),
            },
        );

        assert!(matches!(
            login.exchange("code", "old-state").await,
            Err(IdentityError::InvalidOAuthState)
        ));
        assert!(matches!(
            login.exchange("code", "never-issued").await,
            Err(IdentityError::InvalidOAuthState)
        ));
    }

    #[test]
    fn test_expired_logins_are_purged() {
        let login = LineLogin::new(Client::new(), "channel-1", "secret", "https://cb");
        login.pending.insert(
            "old-state".into(),
            PendingLogin {
                nonce: "n".into(),
                expires_at: Utc::now() - Duration::seconds(1),
            },
        );

        login.authorization_url();
        assert_eq!(login.pending_count(), 1);
        assert!(login.pending.get("old-state").is_none());
    }
}
