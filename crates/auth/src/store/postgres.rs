use chrono::{DateTime, NaiveDate, Utc};
use earnings_common::types::Role;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    CredentialStore, NewUser, RefreshTokenRecord, StoreError, StoreFuture, User, UserUpdate,
};

const USER_COLUMNS: &str = "id, email, username, password_hash, role, is_verified, first_name, \
                            last_name, date_of_birth, avatar_url, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    username: String,
    password_hash: Option<String>,
    role: String,
    is_verified: bool,
    first_name: Option<String>,
    last_name: Option<String>,
    date_of_birth: Option<NaiveDate>,
    avatar_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = row
            .role
            .parse::<Role>()
            .map_err(|error| StoreError::Corrupt(format!("user {}: {error}", row.id)))?;

        Ok(User {
            id: row.id,
            email: row.email,
            username: row.username,
            password_hash: row.password_hash,
            role,
            is_verified: row.is_verified,
            first_name: row.first_name,
            last_name: row.last_name,
            date_of_birth: row.date_of_birth,
            avatar_url: row.avatar_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefreshTokenJoinRow {
    token_id: Uuid,
    token_hash: String,
    expires_at: DateTime<Utc>,
    #[sqlx(flatten)]
    user: UserRow,
}

/// PostgreSQL-backed credential store. Schema lives in `src/db/migrations`.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CredentialStore for PgCredentialStore {
    fn find_user_by_email<'a>(&'a self, email: &'a str) -> StoreFuture<'a, Option<User>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, UserRow>(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
            ))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

            row.map(User::try_from).transpose()
        })
    }

    fn find_user_by_id(&self, id: Uuid) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move {
            let row =
                sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;

            row.map(User::try_from).transpose()
        })
    }

    fn create_user(&self, user: NewUser) -> StoreFuture<'_, User> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, UserRow>(&format!(
                r#"
                INSERT INTO users (
                    email, username, password_hash, role, is_verified,
                    first_name, last_name, date_of_birth, avatar_url
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING {USER_COLUMNS}
                "#
            ))
            .bind(&user.email)
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(user.role.as_str())
            .bind(user.is_verified)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(user.date_of_birth)
            .bind(&user.avatar_url)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            User::try_from(row)
        })
    }

    fn update_user(&self, id: Uuid, update: UserUpdate) -> StoreFuture<'_, User> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, UserRow>(&format!(
                r#"
                UPDATE users
                SET
                    password_hash = COALESCE($2, password_hash),
                    is_verified = COALESCE($3, is_verified),
                    role = COALESCE($4, role),
                    updated_at = now()
                WHERE id = $1
                RETURNING {USER_COLUMNS}
                "#
            ))
            .bind(id)
            .bind(update.password_hash)
            .bind(update.is_verified)
            .bind(update.role.map(|role| role.as_str()))
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::UserMissing(id))?;

            User::try_from(row)
        })
    }

    fn create_refresh_token(&self, record: RefreshTokenRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO refresh_tokens (id, token_hash, expires_at, user_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(record.id)
            .bind(&record.token_hash)
            .bind(record.expires_at)
            .bind(record.user_id)
            .execute(&self.pool)
            .await?;

            Ok(())
        })
    }

    fn find_refresh_token<'a>(
        &'a self,
        token_hash: &'a str,
    ) -> StoreFuture<'a, Option<(RefreshTokenRecord, User)>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, RefreshTokenJoinRow>(
                r#"
                SELECT
                    rt.id AS token_id, rt.token_hash, rt.expires_at,
                    u.id, u.email, u.username, u.password_hash, u.role, u.is_verified,
                    u.first_name, u.last_name, u.date_of_birth, u.avatar_url,
                    u.created_at, u.updated_at
                FROM refresh_tokens rt
                JOIN users u ON u.id = rt.user_id
                WHERE rt.token_hash = $1
                "#,
            )
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let user = User::try_from(row.user)?;
            let record = RefreshTokenRecord {
                id: row.token_id,
                token_hash: row.token_hash,
                expires_at: row.expires_at,
                user_id: user.id,
            };
            Ok(Some((record, user)))
        })
    }

    fn delete_refresh_token(&self, id: Uuid) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM refresh_tokens WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;

            Ok(result.rows_affected())
        })
    }
}

fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(database_error) = &error {
        if database_error.code().as_deref() == Some("23505") {
            return StoreError::DuplicateEmail;
        }
    }

    StoreError::Database(error)
}
