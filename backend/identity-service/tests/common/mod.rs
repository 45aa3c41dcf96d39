#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Duration;
use identity_service::db::{InMemoryUserRepository, UserRepository};
use identity_service::domain::{CapturingSink, EventPublisher, SocialProvider, UserEvent};
use identity_service::security::TokenIssuer;
use identity_service::services::{
    IdentityService, IdentityVerifier, ProjectionHandler, VerifiedIdentity, VerifierRegistry,
    VerifyOptions,
};
use identity_service::{IdentityError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const PRIVATE_KEY: &str = include_str!("../fixtures/ed25519_private.pem");
pub const PUBLIC_KEY: &str = include_str!("../fixtures/ed25519_public.pem");
pub const ISSUER: &str = "https://id.example.com";
pub const AUDIENCE: &str = "client-1";

/// Verifier answering from a fixed credential table
#[derive(Default)]
pub struct StaticVerifier {
    identities: HashMap<String, Value>,
}

impl StaticVerifier {
    pub fn with(mut self, credential: &str, claims: Value) -> Self {
        self.identities.insert(credential.to_string(), claims);
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(
        &self,
        credential: &str,
        options: &VerifyOptions<'_>,
    ) -> Result<VerifiedIdentity> {
        assert_eq!(options.audience, AUDIENCE);
        let claims = self
            .identities
            .get(credential)
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| IdentityError::VerificationFailed("unknown credential".into()))?;

        let identity = VerifiedIdentity::from_claims(claims)?;
        identity.check_nonce(options.nonce)?;
        Ok(identity)
    }
}

pub fn claims(sub: &str, email: Option<&str>, name: Option<&str>) -> Value {
    let mut claims = Map::new();
    claims.insert("sub".into(), sub.into());
    if let Some(email) = email {
        claims.insert("email".into(), email.into());
    }
    if let Some(name) = name {
        claims.insert("name".into(), name.into());
    }
    Value::Object(claims)
}

pub fn token_issuer() -> TokenIssuer {
    TokenIssuer::from_pem(
        PRIVATE_KEY,
        PUBLIC_KEY,
        ISSUER,
        vec!["web".into()],
        Duration::seconds(3600),
    )
    .unwrap()
}

/// Service wired to an in-memory repository, with published events held
/// until [`Harness::pump`] applies them
pub struct Harness {
    pub service: IdentityService,
    pub repo: Arc<InMemoryUserRepository>,
    pub sink: Arc<CapturingSink>,
    pub handler: ProjectionHandler,
    pub tokens: Arc<TokenIssuer>,
}

impl Harness {
    pub fn new(verifiers: Vec<(SocialProvider, StaticVerifier)>) -> Self {
        let mut registry = VerifierRegistry::new();
        for (provider, verifier) in verifiers {
            registry.register(provider, Arc::new(verifier), Some(AUDIENCE.to_string()));
        }
        Self::with_registry(registry)
    }

    pub fn with_registry(registry: VerifierRegistry) -> Self {
        let repo = Arc::new(InMemoryUserRepository::new());
        let sink = Arc::new(CapturingSink::new());
        let tokens = Arc::new(token_issuer());
        let service = IdentityService::new(
            repo.clone(),
            Arc::new(registry),
            EventPublisher::new(sink.clone()),
            tokens.clone(),
        );

        Self {
            service,
            handler: ProjectionHandler::new(repo.clone() as Arc<dyn UserRepository>),
            repo,
            sink,
            tokens,
        }
    }

    /// Apply and clear every captured event; returns them in order
    pub async fn pump(&self) -> Vec<UserEvent> {
        let events = self.sink.events().unwrap();
        self.sink.clear();
        for event in &events {
            self.handler.handle(event).await.unwrap();
        }
        events
    }
}
