//! Credential store: user records and refresh-token rows.
//!
//! The session manager only sees the [`CredentialStore`] trait. Two backends
//! exist: PostgreSQL for deployments and an in-memory map for tests and local
//! runs without a database.

pub mod memory;
pub mod postgres;

use std::{future::Future, pin::Pin};

use chrono::{DateTime, NaiveDate, Utc};
use earnings_common::types::{PublicUser, Role};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryCredentialStore;
pub use postgres::PgCredentialStore;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a user with this email already exists")]
    DuplicateEmail,

    #[error("user {0} does not exist")]
    UserMissing(Uuid),

    #[error("credential store query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("credential store returned invalid data: {0}")]
    Corrupt(String),
}

/// Full user record, including the secret. Never serialized to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub password_hash: Option<String>,
    pub role: Role,
    pub is_verified: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn to_public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            email: self.email.clone(),
            username: self.username.clone(),
            role: self.role,
            is_verified: self.is_verified,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            date_of_birth: self.date_of_birth,
            avatar_url: self.avatar_url.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: Option<String>,
    pub role: Role,
    pub is_verified: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub avatar_url: Option<String>,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub password_hash: Option<String>,
    pub is_verified: Option<bool>,
    pub role: Option<Role>,
}

impl UserUpdate {
    pub fn verified() -> Self {
        Self { is_verified: Some(true), ..Self::default() }
    }

    pub fn password(hash: String) -> Self {
        Self { password_hash: Some(hash), ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    /// SHA-256 hex of the raw value held by the client.
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub user_id: Uuid,
}

pub trait CredentialStore: Send + Sync {
    /// Exact, case-sensitive email match.
    fn find_user_by_email<'a>(&'a self, email: &'a str) -> StoreFuture<'a, Option<User>>;

    fn find_user_by_id(&self, id: Uuid) -> StoreFuture<'_, Option<User>>;

    /// Fails with [`StoreError::DuplicateEmail`] when the email is taken.
    fn create_user(&self, user: NewUser) -> StoreFuture<'_, User>;

    fn update_user(&self, id: Uuid, update: UserUpdate) -> StoreFuture<'_, User>;

    fn create_refresh_token(&self, record: RefreshTokenRecord) -> StoreFuture<'_, ()>;

    fn find_refresh_token<'a>(
        &'a self,
        token_hash: &'a str,
    ) -> StoreFuture<'a, Option<(RefreshTokenRecord, User)>>;

    /// Returns the number of rows removed (0 or 1). Callers rely on the count
    /// to detect a concurrent redemption of the same row.
    fn delete_refresh_token(&self, id: Uuid) -> StoreFuture<'_, u64>;
}
