/// PostgreSQL user repository
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{UserMutation, UserRepository};
use crate::domain::{SocialAccount, SocialId, User, UserId};
use crate::error::{IdentityError, Result};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const USER_COLUMNS: &str =
    "id, username, name, email, status, avatar, created_at, updated_at, deleted_at";

#[derive(Debug, Clone, sqlx::FromRow)]
struct UserRow {
    id: String,
    username: String,
    name: String,
    email: String,
    status: String,
    avatar: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl UserRow {
    fn into_user(self, accounts: Vec<SocialAccount>) -> Result<User> {
        Ok(User::restore(
            UserId::parse(&self.id)?,
            self.username,
            self.name,
            self.email,
            self.status.parse()?,
            accounts,
            self.avatar,
            self.created_at,
            self.updated_at,
            self.deleted_at,
        ))
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AccountRow {
    user_id: String,
    provider: String,
    social_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AccountRow {
    fn into_account(self) -> Result<SocialAccount> {
        Ok(SocialAccount {
            social_id: SocialId::new(self.social_id),
            provider: self.provider.parse()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Username collisions surface as a domain conflict
fn map_conflict(err: sqlx::Error) -> IdentityError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return IdentityError::UsernameAlreadyExists;
        }
    }
    err.into()
}

async fn load_accounts(conn: &mut PgConnection, user_id: &str) -> Result<Vec<SocialAccount>> {
    let rows = sqlx::query_as::<_, AccountRow>(
        r#"
        SELECT user_id, provider, social_id, created_at, updated_at
        FROM social_accounts
        WHERE user_id = $1
        ORDER BY created_at, provider, social_id
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(AccountRow::into_account).collect()
}

/// Upsert the user row and replace its account set
async fn write_user(conn: &mut PgConnection, user: &User) -> Result<()> {
    let id = user.id().to_string();

    sqlx::query(
        r#"
        INSERT INTO users (id, username, name, email, status, avatar, created_at, updated_at, deleted_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
            username = EXCLUDED.username,
            name = EXCLUDED.name,
            email = EXCLUDED.email,
            status = EXCLUDED.status,
            avatar = EXCLUDED.avatar,
            updated_at = EXCLUDED.updated_at,
            deleted_at = EXCLUDED.deleted_at
        "#,
    )
    .bind(&id)
    .bind(&user.username)
    .bind(&user.name)
    .bind(&user.email)
    .bind(user.status().as_str())
    .bind(user.avatar())
    .bind(user.created_at())
    .bind(user.updated_at())
    .bind(user.deleted_at())
    .execute(&mut *conn)
    .await
    .map_err(map_conflict)?;

    sqlx::query("DELETE FROM social_accounts WHERE user_id = $1")
        .bind(&id)
        .execute(&mut *conn)
        .await?;

    for account in user.accounts() {
        sqlx::query(
            r#"
            INSERT INTO social_accounts (user_id, provider, social_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, provider, social_id) DO UPDATE SET
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&id)
        .bind(account.provider.as_str())
        .bind(account.social_id.as_str())
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

pub struct PostgresUserRepository {
    pool: PgPool,
}

impl PostgresUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        MIGRATOR.run(&pool).await?;
        info!("Database migrations applied");

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_one(&self, query: &str, bind: &str) -> Result<User> {
        let mut conn = self.pool.acquire().await?;

        let row = sqlx::query_as::<_, UserRow>(query)
            .bind(bind)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(IdentityError::UserNotFound)?;

        let accounts = load_accounts(&mut conn, &row.id).await?;
        row.into_user(accounts)
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn store(&self, user: &User) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_user(&mut tx, user).await?;
        tx.commit().await?;

        debug!(user_id = %user.id(), "Stored user");
        Ok(())
    }

    async fn delete(&self, user: &User) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<String> =
            sqlx::query_scalar("SELECT id FROM users WHERE id = $1 FOR UPDATE")
                .bind(user.id().to_string())
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(IdentityError::UserNotFound);
        }

        let mut tombstone = user.clone();
        if !tombstone.is_deleted() {
            tombstone.replicate_deleted(Utc::now());
        }
        write_user(&mut tx, &tombstone).await?;
        tx.commit().await?;

        debug!(user_id = %user.id(), "Tombstoned user");
        Ok(())
    }

    async fn find(&self, id: UserId) -> Result<User> {
        let query = format!(
            "SELECT {} FROM users WHERE id = $1 AND deleted_at IS NULL",
            USER_COLUMNS
        );
        self.find_one(&query, &id.to_string()).await
    }

    async fn find_by_username(&self, username: &str) -> Result<User> {
        let query = format!(
            "SELECT {} FROM users WHERE username = $1 AND deleted_at IS NULL",
            USER_COLUMNS
        );
        self.find_one(&query, username).await
    }

    async fn find_by_social_id(&self, social_id: &SocialId) -> Result<User> {
        let query = format!(
            r#"
            SELECT {} FROM users
            WHERE deleted_at IS NULL
              AND id IN (SELECT user_id FROM social_accounts WHERE social_id = $1)
            ORDER BY id
            LIMIT 1
            "#,
            USER_COLUMNS
        );
        self.find_one(&query, social_id.as_str()).await
    }

    async fn list_all(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE deleted_at IS NULL ORDER BY id",
            USER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();
        let account_rows = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT user_id, provider, social_id, created_at, updated_at
            FROM social_accounts
            WHERE user_id = ANY($1)
            ORDER BY created_at, provider, social_id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut accounts: HashMap<String, Vec<SocialAccount>> = HashMap::new();
        for row in account_rows {
            let user_id = row.user_id.clone();
            accounts.entry(user_id).or_default().push(row.into_account()?);
        }

        rows.into_iter()
            .map(|row| {
                let owned = accounts.remove(&row.id).unwrap_or_default();
                row.into_user(owned)
            })
            .collect()
    }

    async fn update(&self, id: UserId, mutation: UserMutation) -> Result<User> {
        let mut tx = self.pool.begin().await?;
        let user_id = id.to_string();

        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
            USER_COLUMNS
        ))
        .bind(&user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(IdentityError::UserNotFound)?;

        let accounts = load_accounts(&mut tx, &user_id).await?;
        let mut user = row.into_user(accounts)?;

        mutation(&mut user)?;
        user.take_events();

        write_user(&mut tx, &user).await?;
        tx.commit().await?;

        Ok(user)
    }

    async fn is_tombstoned(&self, id: UserId) -> Result<bool> {
        let tombstoned: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM users WHERE id = $1 AND deleted_at IS NOT NULL)",
        )
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(tombstoned)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn truncate(&self) -> Result<()> {
        sqlx::query("TRUNCATE social_accounts, users")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
