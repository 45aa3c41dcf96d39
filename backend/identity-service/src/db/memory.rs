/// DashMap-backed repository for single-process deployments and tests
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{UserMutation, UserRepository};
use crate::domain::{SocialId, SocialProvider, User, UserId};
use crate::error::{IdentityError, Result};

type SocialKey = (SocialProvider, SocialId);

/// Lock order is always `users` before either index, and index guards are
/// never held while touching `users`.
#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    users: DashMap<UserId, User>,
    usernames: DashMap<String, UserId>,
    social_ids: DashMap<SocialKey, UserId>,
}

fn social_key(provider: SocialProvider, social_id: &SocialId) -> SocialKey {
    (provider, social_id.clone())
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the username and social lookups at `next`, releasing whatever
    /// `previous` held
    fn reindex(&self, previous: Option<&User>, next: &User) -> Result<()> {
        let id = next.id();

        match self.usernames.entry(next.username.clone()) {
            Entry::Occupied(entry) if *entry.get() != id => {
                return Err(IdentityError::UsernameAlreadyExists);
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                entry.insert(id);
            }
        }

        if let Some(previous) = previous {
            if previous.username != next.username {
                self.usernames
                    .remove_if(&previous.username, |_, owner| *owner == id);
            }
            for account in previous.accounts() {
                self.social_ids.remove_if(
                    &social_key(account.provider, &account.social_id),
                    |_, owner| *owner == id,
                );
            }
        }

        for account in next.accounts() {
            self.social_ids
                .insert(social_key(account.provider, &account.social_id), id);
        }

        Ok(())
    }

    fn unindex(&self, user: &User) {
        let id = user.id();
        self.usernames
            .remove_if(&user.username, |_, owner| *owner == id);
        for account in user.accounts() {
            self.social_ids.remove_if(
                &social_key(account.provider, &account.social_id),
                |_, owner| *owner == id,
            );
        }
    }

    fn live(&self, id: UserId) -> Result<User> {
        self.users
            .get(&id)
            .filter(|user| !user.is_deleted())
            .map(|user| user.value().clone())
            .ok_or(IdentityError::UserNotFound)
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn store(&self, user: &User) -> Result<()> {
        let mut stored = user.clone();
        stored.take_events();

        match self.users.entry(user.id()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().clone();
                if previous.is_deleted() {
                    self.reindex(None, &stored)?;
                } else {
                    self.reindex(Some(&previous), &stored)?;
                }
                entry.insert(stored);
            }
            Entry::Vacant(entry) => {
                self.reindex(None, &stored)?;
                entry.insert(stored);
            }
        }

        debug!(user_id = %user.id(), "Stored user");
        Ok(())
    }

    async fn delete(&self, user: &User) -> Result<()> {
        let mut tombstone = user.clone();
        tombstone.take_events();
        if !tombstone.is_deleted() {
            tombstone.replicate_deleted(chrono::Utc::now());
        }

        match self.users.entry(user.id()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_deleted() {
                    self.unindex(entry.get());
                }
                entry.insert(tombstone);
            }
            Entry::Vacant(_) => return Err(IdentityError::UserNotFound),
        }

        debug!(user_id = %user.id(), "Tombstoned user");
        Ok(())
    }

    async fn find(&self, id: UserId) -> Result<User> {
        self.live(id)
    }

    async fn find_by_username(&self, username: &str) -> Result<User> {
        let id = self
            .usernames
            .get(username)
            .map(|entry| *entry.value())
            .ok_or(IdentityError::UserNotFound)?;
        self.live(id)
    }

    /// Lowest user id among the owners of `social_id` under any provider
    async fn find_by_social_id(&self, social_id: &SocialId) -> Result<User> {
        let id = SocialProvider::ALL
            .into_iter()
            .filter_map(|provider| {
                self.social_ids
                    .get(&social_key(provider, social_id))
                    .map(|entry| *entry.value())
            })
            .min()
            .ok_or(IdentityError::UserNotFound)?;
        self.live(id)
    }

    async fn list_all(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .filter(|entry| !entry.is_deleted())
            .map(|entry| entry.value().clone())
            .collect();
        users.sort_by_key(|user| user.id());
        Ok(users)
    }

    async fn update(&self, id: UserId, mutation: UserMutation) -> Result<User> {
        let mut entry = self
            .users
            .get_mut(&id)
            .filter(|user| !user.is_deleted())
            .ok_or(IdentityError::UserNotFound)?;

        let mut next = entry.value().clone();
        mutation(&mut next)?;
        next.take_events();

        self.reindex(Some(entry.value()), &next)?;
        *entry = next.clone();

        Ok(next)
    }

    async fn is_tombstoned(&self, id: UserId) -> Result<bool> {
        Ok(self
            .users
            .get(&id)
            .map(|user| user.is_deleted())
            .unwrap_or(false))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn truncate(&self) -> Result<()> {
        self.users.clear();
        self.usernames.clear();
        self.social_ids.clear();
        Ok(())
    }
}
