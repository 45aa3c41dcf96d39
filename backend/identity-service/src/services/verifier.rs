//! Identity-provider verification.
//!
//! Each provider turns a credential into a [`VerifiedIdentity`]: the
//! provider-scoped subject plus the raw claims. Providers that sign ID tokens
//! with RS256 share [`JwksCache`] and [`verify_rs256`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

use crate::domain::{SocialId, SocialProvider};
use crate::error::{IdentityError, Result};

const JWKS_CACHE_TTL_SECS: i64 = 3600; // 1 hour
const JWKS_MIN_REFETCH_SECS: i64 = 60;
const JWKS_FETCH_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions<'a> {
    /// Expected `aud` (client id or channel id)
    pub audience: &'a str,
    /// Replay-protection nonce the credential must carry
    pub nonce: Option<&'a str>,
}

/// Subject and claims produced by a successful verification
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub subject: SocialId,
    pub claims: Map<String, Value>,
}

impl VerifiedIdentity {
    /// Build from a claims object carrying a string `sub`
    pub fn from_claims(claims: Map<String, Value>) -> Result<Self> {
        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|sub| !sub.is_empty())
            .map(SocialId::new)
            .ok_or(IdentityError::ClaimMissing("sub"))?;

        Ok(Self { subject, claims })
    }

    pub fn claim(&self, key: &str) -> Option<&str> {
        self.claims.get(key).and_then(Value::as_str)
    }

    pub fn require_claim(&self, key: &'static str) -> Result<&str> {
        self.claim(key).ok_or(IdentityError::ClaimMissing(key))
    }

    /// Compare the `nonce` claim against the expected one, if any
    pub fn check_nonce(&self, expected: Option<&str>) -> Result<()> {
        match expected {
            Some(expected) if self.claim("nonce") != Some(expected) => {
                Err(IdentityError::NonceMismatch)
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(
        &self,
        credential: &str,
        options: &VerifyOptions<'_>,
    ) -> Result<VerifiedIdentity>;
}

/// Individual RSA key from a JWKS document
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key ID, matched against the JWT header
    pub kid: String,
    /// RSA public key modulus (Base64URL encoded)
    pub n: String,
    /// RSA public key exponent (Base64URL encoded)
    pub e: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Default)]
struct CachedKeys {
    keys: HashMap<String, Jwk>,
    fetched_at: Option<DateTime<Utc>>,
}

impl CachedKeys {
    fn is_expired(&self, ttl: Duration) -> bool {
        match self.fetched_at {
            Some(t) => Utc::now() - t > ttl,
            None => true,
        }
    }

    /// Unknown `kid`s only trigger a refetch once per `interval`
    fn refetch_allowed(&self, interval: Duration) -> bool {
        match self.fetched_at {
            Some(t) => Utc::now() - t >= interval,
            None => true,
        }
    }
}

/// Public keys of one issuer, refetched when stale or on an unknown `kid`.
///
/// Refetches for unknown `kid`s are spaced at least `min_refetch` apart.
pub struct JwksCache {
    url: String,
    http: Client,
    ttl: Duration,
    min_refetch: Duration,
    cache: RwLock<CachedKeys>,
}

impl JwksCache {
    pub fn new(http: Client, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http,
            ttl: Duration::seconds(JWKS_CACHE_TTL_SECS),
            min_refetch: Duration::seconds(JWKS_MIN_REFETCH_SECS),
            cache: RwLock::new(CachedKeys::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn key(&self, kid: &str) -> Result<Jwk> {
        {
            let cache = self
                .cache
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !cache.is_expired(self.ttl) {
                if let Some(key) = cache.keys.get(kid) {
                    debug!("Using cached public key for kid={}", kid);
                    return Ok(key.clone());
                }
                if !cache.refetch_allowed(self.min_refetch) {
                    warn!("Unknown kid={} within refetch interval", kid);
                    return Err(IdentityError::VerificationFailed(format!(
                        "unknown signing key: {}",
                        kid
                    )));
                }
            }
        }

        let keys = self.fetch().await?;

        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.keys = keys.into_iter().map(|key| (key.kid.clone(), key)).collect();
        cache.fetched_at = Some(Utc::now());

        cache.keys.get(kid).cloned().ok_or_else(|| {
            error!("Public key not found for kid={}", kid);
            IdentityError::VerificationFailed(format!("unknown signing key: {}", kid))
        })
    }

    async fn fetch(&self) -> Result<Vec<Jwk>> {
        debug!("Fetching JWKS from {}", self.url);

        let response = self
            .http
            .get(&self.url)
            .timeout(std::time::Duration::from_secs(JWKS_FETCH_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to fetch JWKS: {}", e);
                IdentityError::VerificationFailed(format!("failed to fetch public keys: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            error!("JWKS request failed with status: {}", status);
            return Err(IdentityError::VerificationFailed(format!(
                "JWKS request failed: {}",
                status
            )));
        }

        let jwks: JwksResponse = response.json().await.map_err(|e| {
            error!("Failed to parse JWKS response: {}", e);
            IdentityError::VerificationFailed(format!("failed to parse public keys: {}", e))
        })?;

        info!("Fetched {} public keys from {}", jwks.keys.len(), self.url);
        Ok(jwks.keys)
    }
}

/// Verify an RS256 ID token against `jwks`, then its issuer, audience and
/// expiry. Returns the verified claims.
pub async fn verify_rs256(
    jwks: &JwksCache,
    token: &str,
    audience: &str,
    issuers: &[&str],
) -> Result<VerifiedIdentity> {
    let header = decode_header(token).map_err(|e| {
        IdentityError::VerificationFailed(format!("invalid token header: {}", e))
    })?;

    let kid = header
        .kid
        .ok_or_else(|| IdentityError::VerificationFailed("token missing key ID".to_string()))?;

    if header.alg != Algorithm::RS256 {
        return Err(IdentityError::VerificationFailed(format!(
            "unexpected JWT algorithm: {:?}",
            header.alg
        )));
    }

    let jwk = jwks.key(&kid).await?;
    let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e).map_err(|e| {
        IdentityError::VerificationFailed(format!("invalid public key format: {}", e))
    })?;

    let mut validation = Validation::new(Algorithm::RS256);
    if !issuers.is_empty() {
        validation.set_issuer(issuers);
    }
    validation.set_audience(&[audience]);

    let data = decode::<Map<String, Value>>(token, &decoding_key, &validation).map_err(|e| {
        use jsonwebtoken::errors::ErrorKind;

        let reason = match e.kind() {
            ErrorKind::InvalidSignature => "signature verification failed".to_string(),
            ErrorKind::ExpiredSignature => "token has expired".to_string(),
            ErrorKind::InvalidIssuer => "token has invalid issuer".to_string(),
            ErrorKind::InvalidAudience => "token has invalid audience".to_string(),
            _ => e.to_string(),
        };
        debug!("ID token rejected: {}", reason);
        IdentityError::VerificationFailed(reason)
    })?;

    VerifiedIdentity::from_claims(data.claims)
}

struct Registration {
    verifier: Arc<dyn IdentityVerifier>,
    audience: Option<String>,
}

/// Provider to verifier lookup
#[derive(Default)]
pub struct VerifierRegistry {
    providers: HashMap<SocialProvider, Registration>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        provider: SocialProvider,
        verifier: Arc<dyn IdentityVerifier>,
        audience: Option<String>,
    ) -> &mut Self {
        self.providers.insert(
            provider,
            Registration {
                verifier,
                audience: audience.filter(|aud| !aud.is_empty()),
            },
        );
        self
    }

    pub fn supports(&self, provider: SocialProvider) -> bool {
        self.providers.contains_key(&provider)
    }

    pub async fn verify(
        &self,
        provider: SocialProvider,
        credential: &str,
        nonce: Option<&str>,
    ) -> Result<VerifiedIdentity> {
        let registration = self
            .providers
            .get(&provider)
            .ok_or_else(|| IdentityError::ProviderNotSupported(provider.to_string()))?;

        let audience = registration
            .audience
            .as_deref()
            .ok_or_else(|| IdentityError::AudienceNotFound(provider.to_string()))?;

        let options = VerifyOptions { audience, nonce };
        registration.verifier.verify(credential, &options).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub const TEST_KID: &str = "test-kid";
    pub const TEST_RSA_PEM: &str = include_str!("../../tests/fixtures/rsa_test_key.pem");
    pub const TEST_N: &str = "o2y7E-yBJSyRNCkztywRylqjaF6-J5jfu0zzPEt2DtFYPODBcxw1_sX6l-FovCvDHjXD-xqJcBN-Xv2EQPamqxxN7S4jD5T6046pGR2iDHw7RjpkP6Abpeom-YB89rOvM0XWBkSqURLK_CjeCdUQgfQC8GIqZePGSUhMzjYo3IpU8oYz_dki-MauTTBU6IEnVmaL744yYFIp_pwtUSH96pW8tJeLVpGxwATogGz4MaoFevbrE6uE16YzhcfCcNE9_qdSuqgdB3JhAifdQQwfpfW7X1EdTaR-Diqk4ihD3iUsn_kk5RnPCYX7AexxNng49rqBeldk1tEOpyxvBdJd4Q";
    pub const TEST_E: &str = "AQAB";

    pub fn jwks_body() -> Value {
        serde_json::json!({
            "keys": [{
                "kid": TEST_KID,
                "kty": "RSA",
                "alg": "RS256",
                "use": "sig",
                "n": TEST_N,
                "e": TEST_E,
            }]
        })
    }

    pub fn sign(claims: Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(TEST_KID.to_string());
        let key = EncodingKey::from_rsa_pem(TEST_RSA_PEM.as_bytes()).unwrap();
        encode(&header, &claims, &key).unwrap()
    }

    pub fn claims(iss: &str, aud: &str, sub: &str) -> Value {
        let now = Utc::now().timestamp();
        serde_json::json!({
            "iss": iss,
            "aud": aud,
            "sub": sub,
            "iat": now,
            "exp": now + 600,
        })
    }
}
