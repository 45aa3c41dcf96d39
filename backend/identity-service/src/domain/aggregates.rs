use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{
    UserActivated, UserDeleted, UserEvent, UserRegistered, UserSocialAccountAdded,
    UserSocialAccountRemoved,
};
use super::publisher::EventPublisher;
use super::value_objects::{SocialAccount, SocialId, SocialProvider, Status, UserId};
use crate::error::{IdentityError, Result};

/// User Aggregate Root
///
/// Owns the lifecycle status and the set of bound social accounts. Every
/// mutating method buffers exactly one domain event per change; the buffer is
/// drained by [`User::notify`] (usually through a [`Pending`] scope).
///
/// [`Pending`]: super::publisher::Pending
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    id: UserId,
    pub username: String,
    pub name: String,
    pub email: String,
    status: Status,
    accounts: Vec<SocialAccount>,
    #[serde(default)]
    avatar: String,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    deleted_at: Option<DateTime<Utc>>,

    // Event tracking
    #[serde(skip)]
    pending_events: Vec<UserEvent>,
}

impl User {
    /// Build a pending user; no event is recorded until [`User::register`]
    pub fn new(
        username: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        let id = UserId::new();
        let created_at = id.timestamp();

        Self {
            id,
            username: username.into(),
            name: name.into(),
            email: email.into(),
            status: Status::Pending,
            accounts: Vec::new(),
            avatar: String::new(),
            created_at,
            updated_at: created_at,
            deleted_at: None,
            pending_events: Vec::new(),
        }
    }

    pub fn register(&mut self) {
        self.status = Status::Registered;
        self.updated_at = Utc::now();

        let snapshot = self.snapshot();
        self.record_event(UserEvent::Registered(UserRegistered {
            user: snapshot,
            occurred_at: self.updated_at,
        }));
    }

    pub fn activate(&mut self) {
        self.status = Status::Activated;
        self.updated_at = Utc::now();

        self.record_event(UserEvent::Activated(UserActivated {
            user_id: self.id,
            status: self.status,
            occurred_at: self.updated_at,
        }));
    }

    /// Bind an external identity.
    ///
    /// Fails with [`IdentityError::AccountExists`] when the pair is already
    /// bound; the account list is left untouched in that case.
    pub fn add_social_account(
        &mut self,
        provider: SocialProvider,
        social_id: impl Into<SocialId>,
    ) -> Result<()> {
        let social_id = social_id.into();
        if self.has_social_account(provider, &social_id) {
            return Err(IdentityError::AccountExists);
        }

        let account = SocialAccount::new(provider, social_id);
        self.updated_at = account.updated_at;
        self.accounts.push(account.clone());

        self.record_event(UserEvent::SocialAccountAdded(UserSocialAccountAdded {
            user_id: self.id,
            account,
            occurred_at: self.updated_at,
        }));

        Ok(())
    }

    /// Unbind an external identity, one event per removed binding
    pub fn remove_social_account(
        &mut self,
        provider: SocialProvider,
        social_id: &SocialId,
    ) -> Result<()> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.accounts)
            .into_iter()
            .partition(|account| account.matches(provider, social_id));
        self.accounts = kept;

        if removed.is_empty() {
            return Err(IdentityError::AccountNotFound);
        }

        self.updated_at = Utc::now();
        for account in removed {
            self.record_event(UserEvent::SocialAccountRemoved(UserSocialAccountRemoved {
                user_id: self.id,
                account,
                occurred_at: self.updated_at,
            }));
        }

        Ok(())
    }

    /// Revoke the user. Accounts are retained on the tombstone.
    pub fn delete(&mut self) {
        let now = Utc::now();
        self.status = Status::Revoked;
        self.updated_at = now;
        self.deleted_at = Some(now);

        self.record_event(UserEvent::Deleted(UserDeleted {
            user_id: self.id,
            occurred_at: now,
        }));
    }

    pub fn has_social_account(&self, provider: SocialProvider, social_id: &SocialId) -> bool {
        self.accounts
            .iter()
            .any(|account| account.matches(provider, social_id))
    }

    /// Profile picture refresh from provider claims; not an event
    pub fn set_avatar(&mut self, avatar: impl Into<String>) {
        self.avatar = avatar.into();
    }

    /// Drain buffered events into the publisher in emission order.
    ///
    /// Returns how many events were drained; a second call drains nothing.
    pub fn notify(&mut self, publisher: &EventPublisher) -> usize {
        publisher.publish_all(self.take_events())
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn accounts(&self) -> &[SocialAccount] {
        &self.accounts
    }

    pub fn avatar(&self) -> &str {
        &self.avatar
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn pending_events(&self) -> &[UserEvent] {
        &self.pending_events
    }

    /// Take pending events (for publishing)
    pub fn take_events(&mut self) -> Vec<UserEvent> {
        std::mem::take(&mut self.pending_events)
    }

    fn record_event(&mut self, event: UserEvent) {
        self.pending_events.push(event);
    }

    /// Copy of the persisted state without the event buffer
    fn snapshot(&self) -> User {
        User {
            id: self.id,
            username: self.username.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            status: self.status,
            accounts: self.accounts.clone(),
            avatar: self.avatar.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            pending_events: Vec::new(),
        }
    }

    // Replication paths used by projection handlers and repositories

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: UserId,
        username: String,
        name: String,
        email: String,
        status: Status,
        accounts: Vec<SocialAccount>,
        avatar: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            username,
            name,
            email,
            status,
            accounts,
            avatar,
            created_at,
            updated_at,
            deleted_at,
            pending_events: Vec::new(),
        }
    }

    pub(crate) fn replicate_status(&mut self, status: Status, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
    }

    /// Insert or replace the binding keyed by `(provider, social_id)`
    pub(crate) fn replicate_account_added(&mut self, account: SocialAccount, at: DateTime<Utc>) {
        match self
            .accounts
            .iter_mut()
            .find(|existing| existing.matches(account.provider, &account.social_id))
        {
            Some(existing) => *existing = account,
            None => self.accounts.push(account),
        }
        self.updated_at = at;
    }

    /// Returns whether a binding was actually dropped
    pub(crate) fn replicate_account_removed(
        &mut self,
        account: &SocialAccount,
        at: DateTime<Utc>,
    ) -> bool {
        let before = self.accounts.len();
        self.accounts
            .retain(|existing| !existing.matches(account.provider, &account.social_id));
        let removed = self.accounts.len() != before;
        if removed {
            self.updated_at = at;
        }
        removed
    }

    pub(crate) fn replicate_deleted(&mut self, at: DateTime<Utc>) {
        self.status = Status::Revoked;
        self.updated_at = at;
        self.deleted_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventName;
    use crate::domain::publisher::CapturingSink;
    use std::sync::Arc;

    fn mirror() -> User {
        User::new("mirror", "Lin", "mirror@x.com")
    }

    #[test]
    fn test_new_user_is_pending_without_events() {
        let user = mirror();
        assert_eq!(user.status(), Status::Pending);
        assert!(user.accounts().is_empty());
        assert!(user.pending_events().is_empty());
        assert_eq!(user.created_at(), user.id().timestamp());
        assert!(!user.is_deleted());
    }

    #[test]
    fn test_register_records_snapshot() {
        let mut user = mirror();
        user.register();

        assert_eq!(user.status(), Status::Registered);
        match &user.pending_events()[0] {
            UserEvent::Registered(e) => {
                assert_eq!(e.user.id(), user.id());
                assert_eq!(e.user.username, "mirror");
                assert_eq!(e.user.status(), Status::Registered);
                assert!(e.user.pending_events().is_empty());
            }
            other => panic!("unexpected event: {}", other.name()),
        }
    }

    #[test]
    fn test_activate_records_status() {
        let mut user = mirror();
        user.register();
        user.activate();

        assert_eq!(user.status(), Status::Activated);
        match &user.pending_events()[1] {
            UserEvent::Activated(e) => {
                assert_eq!(e.user_id, user.id());
                assert_eq!(e.status, Status::Activated);
            }
            other => panic!("unexpected event: {}", other.name()),
        }
    }

    #[test]
    fn test_add_social_account_scenario() {
        let mut user = mirror();
        user.add_social_account(SocialProvider::Google, "100043685676652067799")
            .unwrap();

        assert_eq!(user.accounts().len(), 1);
        assert_eq!(user.accounts()[0].provider, SocialProvider::Google);
        assert_eq!(
            user.accounts()[0].social_id.as_str(),
            "100043685676652067799"
        );
        assert_eq!(user.pending_events().len(), 1);
    }

    #[test]
    fn test_duplicate_social_account_conflicts() {
        let mut user = mirror();
        user.add_social_account(SocialProvider::Line, "U1").unwrap();

        let result = user.add_social_account(SocialProvider::Line, "U1");
        assert!(matches!(result, Err(IdentityError::AccountExists)));
        assert_eq!(user.accounts().len(), 1);
        assert_eq!(user.pending_events().len(), 1);

        // Same subject under another provider is a different binding
        user.add_social_account(SocialProvider::Google, "U1").unwrap();
        assert_eq!(user.accounts().len(), 2);
    }

    #[test]
    fn test_remove_missing_social_account() {
        let mut user = mirror();
        let result = user.remove_social_account(SocialProvider::Google, &SocialId::new("nope"));
        assert!(matches!(result, Err(IdentityError::AccountNotFound)));
        assert!(user.pending_events().is_empty());
    }

    #[test]
    fn test_remove_then_readd_social_account() {
        let mut user = mirror();
        let social_id = SocialId::new("g-1");
        user.add_social_account(SocialProvider::Google, social_id.clone())
            .unwrap();
        user.remove_social_account(SocialProvider::Google, &social_id)
            .unwrap();
        assert!(user.accounts().is_empty());

        user.add_social_account(SocialProvider::Google, social_id.clone())
            .unwrap();
        assert_eq!(user.accounts().len(), 1);

        let names: Vec<_> = user.pending_events().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                EventName::UserSocialAccountAdded,
                EventName::UserSocialAccountRemoved,
                EventName::UserSocialAccountAdded,
            ]
        );
    }

    #[test]
    fn test_delete_keeps_accounts() {
        let mut user = mirror();
        user.add_social_account(SocialProvider::Passkeys, "pk-1").unwrap();
        user.delete();

        assert_eq!(user.status(), Status::Revoked);
        assert!(user.is_deleted());
        assert_eq!(user.deleted_at(), Some(user.updated_at()));
        assert_eq!(user.accounts().len(), 1);
        assert_eq!(
            user.pending_events().last().map(|e| e.name()),
            Some(EventName::UserDeleted)
        );
    }

    #[test]
    fn test_notify_publishes_in_order_once() {
        let sink = Arc::new(CapturingSink::new());
        let publisher = EventPublisher::new(sink.clone());

        let mut user = mirror();
        user.register();
        user.activate();
        user.add_social_account(SocialProvider::Google, "g").unwrap();
        user.add_social_account(SocialProvider::Line, "l").unwrap();
        user.add_social_account(SocialProvider::Facebook, "f").unwrap();

        assert_eq!(user.notify(&publisher), 5);
        assert_eq!(user.notify(&publisher), 0);
        assert!(user.pending_events().is_empty());

        let id = user.id();
        assert_eq!(
            sink.subjects(),
            vec![
                format!("users.{}.registered", id),
                format!("users.{}.activated", id),
                format!("users.{}.social_account_added", id),
                format!("users.{}.social_account_added", id),
                format!("users.{}.social_account_added", id),
            ]
        );
    }

    #[test]
    fn test_notify_without_sink_is_noop() {
        let mut user = mirror();
        user.register();
        assert_eq!(user.notify(&EventPublisher::disabled()), 1);
        assert!(user.pending_events().is_empty());
    }

    #[test]
    fn test_serialized_user_omits_pending_events() {
        let mut user = mirror();
        user.register();

        let value = serde_json::to_value(&user).unwrap();
        assert!(value.get("pending_events").is_none());
        assert_eq!(value["status"], "registered");

        let restored: User = serde_json::from_value(value).unwrap();
        assert_eq!(restored.id(), user.id());
        assert!(restored.pending_events().is_empty());
    }

    #[test]
    fn test_replicated_account_upsert_does_not_duplicate() {
        let mut user = mirror();
        let account = SocialAccount::new(SocialProvider::Google, SocialId::new("g"));
        let at = Utc::now();

        user.replicate_account_added(account.clone(), at);
        user.replicate_account_added(account.clone(), at);
        assert_eq!(user.accounts().len(), 1);

        assert!(user.replicate_account_removed(&account, at));
        assert!(!user.replicate_account_removed(&account, at));
        assert!(user.accounts().is_empty());
    }
}
