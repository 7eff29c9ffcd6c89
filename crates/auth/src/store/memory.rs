use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CredentialStore, NewUser, RefreshTokenRecord, StoreError, StoreFuture, User, UserUpdate,
};

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    email_index: HashMap<String, Uuid>,
    refresh_tokens: HashMap<Uuid, RefreshTokenRecord>,
}

/// In-process credential store. All mutations happen under one write lock, so
/// uniqueness and delete-count semantics match the PostgreSQL backend.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    state: RwLock<MemoryState>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh_token_count(&self) -> usize {
        self.state.read().await.refresh_tokens.len()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn find_user_by_email<'a>(&'a self, email: &'a str) -> StoreFuture<'a, Option<User>> {
        Box::pin(async move {
            let guard = self.state.read().await;
            Ok(guard.email_index.get(email).and_then(|id| guard.users.get(id)).cloned())
        })
    }

    fn find_user_by_id(&self, id: Uuid) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move { Ok(self.state.read().await.users.get(&id).cloned()) })
    }

    fn create_user(&self, user: NewUser) -> StoreFuture<'_, User> {
        Box::pin(async move {
            let mut guard = self.state.write().await;
            if guard.email_index.contains_key(&user.email) {
                return Err(StoreError::DuplicateEmail);
            }

            let now = Utc::now();
            let record = User {
                id: Uuid::new_v4(),
                email: user.email,
                username: user.username,
                password_hash: user.password_hash,
                role: user.role,
                is_verified: user.is_verified,
                first_name: user.first_name,
                last_name: user.last_name,
                date_of_birth: user.date_of_birth,
                avatar_url: user.avatar_url,
                created_at: now,
                updated_at: now,
            };
            guard.email_index.insert(record.email.clone(), record.id);
            guard.users.insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn update_user(&self, id: Uuid, update: UserUpdate) -> StoreFuture<'_, User> {
        Box::pin(async move {
            let mut guard = self.state.write().await;
            let user = guard.users.get_mut(&id).ok_or(StoreError::UserMissing(id))?;
            if let Some(hash) = update.password_hash {
                user.password_hash = Some(hash);
            }
            if let Some(is_verified) = update.is_verified {
                user.is_verified = is_verified;
            }
            if let Some(role) = update.role {
                user.role = role;
            }
            user.updated_at = Utc::now();
            Ok(user.clone())
        })
    }

    fn create_refresh_token(&self, record: RefreshTokenRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.state.write().await;
            if !guard.users.contains_key(&record.user_id) {
                return Err(StoreError::UserMissing(record.user_id));
            }
            guard.refresh_tokens.insert(record.id, record);
            Ok(())
        })
    }

    fn find_refresh_token<'a>(
        &'a self,
        token_hash: &'a str,
    ) -> StoreFuture<'a, Option<(RefreshTokenRecord, User)>> {
        Box::pin(async move {
            let guard = self.state.read().await;
            let found = guard
                .refresh_tokens
                .values()
                .find(|record| record.token_hash == token_hash)
                .and_then(|record| {
                    guard.users.get(&record.user_id).map(|user| (record.clone(), user.clone()))
                });
            Ok(found)
        })
    }

    fn delete_refresh_token(&self, id: Uuid) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let removed = self.state.write().await.refresh_tokens.remove(&id);
            Ok(u64::from(removed.is_some()))
        })
    }
}
