/// Projection of user events into the repository
///
/// Every handler is safe to replay: registration overwrites the snapshot,
/// account additions upsert on `(provider, social_id)`, removals of absent
/// accounts succeed, and deleting a tombstoned user is a no-op.
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::db::UserRepository;
use crate::domain::events::{
    UserActivated, UserDeleted, UserRegistered, UserSocialAccountAdded, UserSocialAccountRemoved,
};
use crate::domain::UserEvent;
use crate::error::{IdentityError, Result};

/// Backoff applied to transient handler failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; `None` retries until success
    pub max_retries: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(5),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// Keep retrying until the handler succeeds
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            max_backoff: Duration::from_secs(30),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct ProjectionHandler {
    repo: Arc<dyn UserRepository>,
}

impl ProjectionHandler {
    pub fn new(repo: Arc<dyn UserRepository>) -> Self {
        Self { repo }
    }

    /// Decode a transport message and apply it
    pub async fn handle_message(&self, subject: &str, payload: &[u8]) -> Result<()> {
        let event = UserEvent::decode(subject, payload)?;
        self.handle(&event).await
    }

    /// [`Self::handle_message`], retrying transient failures with
    /// exponential backoff. Other errors are returned at once.
    pub async fn handle_message_with_retry(
        &self,
        subject: &str,
        payload: &[u8],
        config: &RetryConfig,
    ) -> Result<()> {
        let mut attempt = 0;
        let mut backoff = config.initial_backoff;

        loop {
            match self.handle_message(subject, payload).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if config.max_retries.is_some_and(|max| attempt > max) {
                        warn!(subject, attempts = attempt, "Giving up on event: {}", e);
                        return Err(e);
                    }

                    warn!(
                        subject,
                        attempt,
                        "Transient failure applying event, retrying in {:?}: {}",
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * config.backoff_multiplier).min(config.max_backoff);
                }
            }
        }
    }

    pub async fn handle(&self, event: &UserEvent) -> Result<()> {
        debug!(
            user_id = %event.user_id(),
            event = %event.name(),
            "Applying user event"
        );

        match event {
            UserEvent::Registered(e) => self.on_registered(e).await,
            UserEvent::Activated(e) => self.on_activated(e).await,
            UserEvent::SocialAccountAdded(e) => self.on_social_account_added(e).await,
            UserEvent::SocialAccountRemoved(e) => self.on_social_account_removed(e).await,
            UserEvent::Deleted(e) => self.on_deleted(e).await,
        }
    }

    async fn on_registered(&self, event: &UserRegistered) -> Result<()> {
        self.repo.store(&event.user).await?;
        info!(user_id = %event.user.id(), username = %event.user.username, "User registered");
        Ok(())
    }

    async fn on_activated(&self, event: &UserActivated) -> Result<()> {
        let (status, at) = (event.status, event.occurred_at);
        self.repo
            .update(
                event.user_id,
                Box::new(move |user| {
                    user.replicate_status(status, at);
                    Ok(())
                }),
            )
            .await?;

        info!(user_id = %event.user_id, status = %status, "User activated");
        Ok(())
    }

    async fn on_social_account_added(&self, event: &UserSocialAccountAdded) -> Result<()> {
        let (account, at) = (event.account.clone(), event.occurred_at);
        self.repo
            .update(
                event.user_id,
                Box::new(move |user| {
                    user.replicate_account_added(account, at);
                    Ok(())
                }),
            )
            .await?;

        info!(
            user_id = %event.user_id,
            provider = %event.account.provider,
            "Social account added"
        );
        Ok(())
    }

    async fn on_social_account_removed(&self, event: &UserSocialAccountRemoved) -> Result<()> {
        let (account, at) = (event.account.clone(), event.occurred_at);
        self.repo
            .update(
                event.user_id,
                Box::new(move |user| {
                    if !user.replicate_account_removed(&account, at) {
                        debug!(user_id = %user.id(), "Social account already absent");
                    }
                    Ok(())
                }),
            )
            .await?;

        info!(
            user_id = %event.user_id,
            provider = %event.account.provider,
            "Social account removed"
        );
        Ok(())
    }

    async fn on_deleted(&self, event: &UserDeleted) -> Result<()> {
        let mut user = match self.repo.find(event.user_id).await {
            Ok(user) => user,
            Err(IdentityError::UserNotFound) => {
                if self.repo.is_tombstoned(event.user_id).await? {
                    debug!(user_id = %event.user_id, "User already deleted");
                    return Ok(());
                }
                return Err(IdentityError::UserNotFound);
            }
            Err(e) => return Err(e),
        };

        user.replicate_deleted(event.occurred_at);
        self.repo.delete(&user).await?;

        info!(user_id = %event.user_id, "User deleted");
        Ok(())
    }
}
