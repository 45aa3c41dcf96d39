/// User storage for identity-service
pub mod memory;
pub mod users;

use async_trait::async_trait;

use crate::domain::{SocialId, User, UserId};
use crate::error::Result;

pub use memory::InMemoryUserRepository;
pub use users::PostgresUserRepository;

/// In-place change applied under the repository's per-user lock
pub type UserMutation = Box<dyn FnOnce(&mut User) -> Result<()> + Send>;

/// Durable keyed storage for users and their social accounts.
///
/// Lookups never return tombstoned users. `store` is a full replace of the
/// user, including its account set.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert or overwrite a user
    async fn store(&self, user: &User) -> Result<()>;

    /// Tombstone a user and drop its username and social lookups
    async fn delete(&self, user: &User) -> Result<()>;

    async fn find(&self, id: UserId) -> Result<User>;

    async fn find_by_username(&self, username: &str) -> Result<User>;

    /// Owner of `social_id` under any provider; when several live users
    /// hold it, the one with the lowest id
    async fn find_by_social_id(&self, social_id: &SocialId) -> Result<User>;

    async fn list_all(&self) -> Result<Vec<User>>;

    /// Atomic read-modify-write of one live user.
    ///
    /// Nothing is written if the mutation fails.
    async fn update(&self, id: UserId, mutation: UserMutation) -> Result<User>;

    /// Whether `id` was stored and later deleted
    async fn is_tombstoned(&self, id: UserId) -> Result<bool>;

    async fn close(&self) -> Result<()>;

    /// Remove every row (tests only)
    async fn truncate(&self) -> Result<()>;
}
