/// Identity use cases
///
/// Each command loads the aggregate, applies the change inside a
/// [`Pending`](crate::domain::Pending) scope and lets the scope publish the
/// resulting events. The repository is written only by the projection
/// handlers that consume those events.
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use validator::Validate;

use super::oauth::{LineAuthorizationUrl, LineLogin};
use super::passkey::PasskeyClient;
use super::verifier::{VerifiedIdentity, VerifierRegistry};
use crate::db::UserRepository;
use crate::domain::{EventPublisher, SocialId, SocialProvider, Status, User, UserId};
use crate::error::{IdentityError, Result};
use crate::security::TokenIssuer;
use crate::validators::{username_from_email, validate_otp, Registration};

/// Numbered variants tried before falling back to a random suffix
const USERNAME_SUFFIX_ATTEMPTS: u32 = 20;
const RANDOM_SUFFIX_LEN: usize = 6;

#[derive(Debug, Clone, Serialize)]
pub struct SignInResponse {
    pub user: User,
    pub token: String,
}

pub struct IdentityService {
    repo: Arc<dyn UserRepository>,
    verifiers: Arc<VerifierRegistry>,
    publisher: EventPublisher,
    tokens: Arc<TokenIssuer>,
    passkeys: Option<Arc<PasskeyClient>>,
    line_login: Option<Arc<LineLogin>>,
}

impl IdentityService {
    pub fn new(
        repo: Arc<dyn UserRepository>,
        verifiers: Arc<VerifierRegistry>,
        publisher: EventPublisher,
        tokens: Arc<TokenIssuer>,
    ) -> Self {
        Self {
            repo,
            verifiers,
            publisher,
            tokens,
            passkeys: None,
            line_login: None,
        }
    }

    pub fn with_passkeys(mut self, client: Arc<PasskeyClient>) -> Self {
        self.passkeys = Some(client);
        self
    }

    pub fn with_line_login(mut self, login: Arc<LineLogin>) -> Self {
        self.line_login = Some(login);
        self
    }

    /// Register a pending user under an unused username
    pub async fn register(&self, username: &str, name: &str, email: &str) -> Result<User> {
        Registration {
            username: username.to_string(),
            name: name.to_string(),
            email: email.to_string(),
        }
        .validate()?;

        self.ensure_username_free(username).await?;

        let mut user = User::new(username, name, email);
        self.publisher.track(&mut user).register();

        info!(user_id = %user.id(), username = %user.username, "Registered user");
        Ok(user)
    }

    /// Activate a user once their one-time password has been checked
    pub async fn otp_verify(&self, otp: &str, user_id: UserId) -> Result<User> {
        if !validate_otp(otp) {
            return Err(IdentityError::InvalidOtp);
        }

        let mut user = self.repo.find(user_id).await?;
        self.publisher.track(&mut user).activate();

        info!(user_id = %user_id, "User activated by OTP");
        Ok(user)
    }

    /// Sign in with a provider credential, creating the user on first use
    pub async fn sign_in(&self, credential: &str, provider: SocialProvider) -> Result<SignInResponse> {
        let identity = self.verifiers.verify(provider, credential, None).await?;
        self.complete_sign_in(provider, identity).await
    }

    pub fn line_authorization_url(&self) -> Result<LineAuthorizationUrl> {
        Ok(self.line_login()?.authorization_url())
    }

    /// Finish a LINE login started with [`Self::line_authorization_url`]
    pub async fn sign_in_with_line(&self, code: &str, state: &str) -> Result<SignInResponse> {
        let authorization = self.line_login()?.exchange(code, state).await?;
        let identity = self
            .verifiers
            .verify(
                SocialProvider::Line,
                &authorization.id_token,
                Some(&authorization.nonce),
            )
            .await?;
        self.complete_sign_in(SocialProvider::Line, identity).await
    }

    /// Bind another provider identity to an existing user
    pub async fn add_social_account(
        &self,
        credential: &str,
        provider: SocialProvider,
        user_id: UserId,
    ) -> Result<User> {
        let identity = self.verifiers.verify(provider, credential, None).await?;
        self.bind_social_account(provider, identity.subject, user_id)
            .await
    }

    pub async fn remove_social_account(
        &self,
        provider: SocialProvider,
        social_id: &SocialId,
        user_id: UserId,
    ) -> Result<User> {
        let mut user = self.repo.find(user_id).await?;
        self.publisher
            .track(&mut user)
            .remove_social_account(provider, social_id)?;

        info!(user_id = %user_id, provider = %provider, "Removed social account");
        Ok(user)
    }

    pub async fn delete_user(&self, user_id: UserId) -> Result<User> {
        let mut user = self.repo.find(user_id).await?;
        self.publisher.track(&mut user).delete();

        info!(user_id = %user_id, "Deleted user");
        Ok(user)
    }

    pub async fn user(&self, username: &str) -> Result<User> {
        self.repo.find_by_username(username).await
    }

    pub async fn user_by_social_id(&self, social_id: &SocialId) -> Result<User> {
        self.repo.find_by_social_id(social_id).await
    }

    /// Start a passkey registration ceremony for an existing user
    pub async fn initialize_passkey_registration(&self, user_id: UserId) -> Result<Value> {
        let client = self.passkeys()?;
        let user = self.repo.find(user_id).await?;
        client.initialize_registration(&user.id(), &user.username).await
    }

    /// Complete a passkey registration; the provider token's subject becomes
    /// a `passkeys` social account of the user
    pub async fn finalize_passkey_registration(
        &self,
        user_id: UserId,
        credential: &Value,
    ) -> Result<User> {
        let token = self.passkeys()?.finalize_registration(credential).await?;
        let identity = self
            .verifiers
            .verify(SocialProvider::Passkeys, &token, None)
            .await?;
        self.bind_social_account(SocialProvider::Passkeys, identity.subject, user_id)
            .await
    }

    /// Start a passkey login, scoped to `username` when given
    pub async fn initialize_passkey_login(&self, username: Option<&str>) -> Result<Value> {
        let client = self.passkeys()?;
        let user_id = match username {
            Some(username) => Some(self.repo.find_by_username(username).await?.id()),
            None => None,
        };
        client.initialize_login(user_id.as_ref()).await
    }

    pub async fn finalize_passkey_login(&self, credential: &Value) -> Result<SignInResponse> {
        let token = self.passkeys()?.finalize_login(credential).await?;
        self.sign_in(&token, SocialProvider::Passkeys).await
    }

    async fn complete_sign_in(
        &self,
        provider: SocialProvider,
        identity: VerifiedIdentity,
    ) -> Result<SignInResponse> {
        let user = match self.repo.find_by_social_id(&identity.subject).await {
            Ok(mut user) => {
                match user.status() {
                    Status::Locked => {
                        warn!(
                            user_id = %user.id(),
                            provider = %provider,
                            "Sign-in refused for locked user"
                        );
                        return Err(IdentityError::AccountLocked);
                    }
                    Status::Activated => {}
                    _ => {
                        self.publisher.track(&mut user).activate();
                    }
                }
                if let Some(picture) = identity.claim("picture") {
                    user.set_avatar(picture);
                }
                user
            }
            Err(IdentityError::UserNotFound) => {
                self.create_from_identity(provider, &identity).await?
            }
            Err(e) => return Err(e),
        };

        let token = self.tokens.issue(&user)?;
        info!(user_id = %user.id(), provider = %provider, "User signed in");
        Ok(SignInResponse { user, token })
    }

    async fn create_from_identity(
        &self,
        provider: SocialProvider,
        identity: &VerifiedIdentity,
    ) -> Result<User> {
        let email = identity.require_claim("email")?;
        let name = identity.require_claim("name")?;
        let local = username_from_email(email).ok_or(IdentityError::ClaimMissing("email"))?;
        let username = self.free_username(local).await?;

        let mut user = User::new(username, name, email);
        if let Some(picture) = identity.claim("picture") {
            user.set_avatar(picture);
        }

        {
            let mut pending = self.publisher.track(&mut user);
            pending.register();
            pending.activate();
            pending.add_social_account(provider, identity.subject.clone())?;
        }

        info!(user_id = %user.id(), provider = %provider, "Created user from social sign-in");
        Ok(user)
    }

    async fn bind_social_account(
        &self,
        provider: SocialProvider,
        social_id: SocialId,
        user_id: UserId,
    ) -> Result<User> {
        match self.repo.find_by_social_id(&social_id).await {
            Ok(owner) => {
                warn!(
                    user_id = %user_id,
                    owner_id = %owner.id(),
                    provider = %provider,
                    "Social account already bound"
                );
                return Err(IdentityError::AccountExists);
            }
            Err(IdentityError::UserNotFound) => {}
            Err(e) => return Err(e),
        }

        let mut user = self.repo.find(user_id).await?;
        self.publisher
            .track(&mut user)
            .add_social_account(provider, social_id)?;

        info!(user_id = %user_id, provider = %provider, "Added social account");
        Ok(user)
    }

    /// `base`, else `base2`, `base3`, ..., else `base-<random>`
    async fn free_username(&self, base: &str) -> Result<String> {
        let candidates = std::iter::once(base.to_string())
            .chain((2..=USERNAME_SUFFIX_ATTEMPTS).map(|n| format!("{}{}", base, n)));

        for candidate in candidates {
            match self.ensure_username_free(&candidate).await {
                Ok(()) => return Ok(candidate),
                Err(IdentityError::UserAlreadyExists) => continue,
                Err(e) => return Err(e),
            }
        }

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_SUFFIX_LEN)
            .map(char::from)
            .collect();
        Ok(format!("{}-{}", base, suffix.to_lowercase()))
    }

    async fn ensure_username_free(&self, username: &str) -> Result<()> {
        match self.repo.find_by_username(username).await {
            Ok(_) => Err(IdentityError::UserAlreadyExists),
            Err(IdentityError::UserNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn passkeys(&self) -> Result<&PasskeyClient> {
        self.passkeys
            .as_deref()
            .ok_or_else(|| IdentityError::ProviderNotSupported(SocialProvider::Passkeys.to_string()))
    }

    fn line_login(&self) -> Result<&LineLogin> {
        self.line_login
            .as_deref()
            .ok_or_else(|| IdentityError::ProviderNotSupported(SocialProvider::Line.to_string()))
    }
}
