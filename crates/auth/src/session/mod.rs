//! Session lifecycle: signup with email codes, password login, refresh-token
//! rotation, password reset and OAuth account linking.
//!
//! Single-use guarantees rest on the collaborators' atomic primitives: codes
//! are redeemed with [`CodeCache::take`], refresh rows with a delete that
//! reports its row count. Only the caller that removes the row may issue a
//! replacement.

pub mod rate_limit;
pub mod tokens;

use std::sync::Arc;

use chrono::Duration;
use earnings_common::{
    types::{MessageResponse, PublicUser, Role, TokenBundle},
    validation::{
        default_username, email_domain, parse_date_of_birth, validate_code, validate_email,
        validate_new_password, validate_username, ValidationError,
    },
};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use self::{
    rate_limit::{ForgotPasswordLimiter, RateLimitDecision},
    tokens::{constant_time_eq, generate_code, generate_csrf_token, generate_refresh_token},
};
use crate::{
    auth::{
        jwt::JwtAccessTokenService,
        password::{hash_password_blocking, verify_password_blocking},
    },
    cache::{CacheError, CodeCache},
    clock::Clock,
    config::SessionConfig,
    notify::Notifier,
    store::{CredentialStore, NewUser, RefreshTokenRecord, StoreError, User, UserUpdate},
};

pub const SIGNUP_MESSAGE: &str = "Signup successful. Check your email for a verification code.";
pub const FORGOT_PASSWORD_MESSAGE: &str =
    "If an account exists for this email, a password reset code has been sent.";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("an account with this email already exists")]
    DuplicateEmail,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("account is not verified")]
    AccountNotVerified,

    #[error("invalid or expired code")]
    InvalidOrExpiredCode,

    #[error("invalid or expired refresh token")]
    InvalidOrExpiredToken,

    #[error("too many password reset requests")]
    RateLimitExceeded,

    #[error("user not found")]
    UserNotFound,

    #[error("oauth profile has no email address")]
    NoEmailOnProfile,

    #[error("email domain is not allowed")]
    DomainNotAllowed,

    #[error("credential store failure: {0}")]
    Store(StoreError),

    #[error("code cache failure: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AuthError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DuplicateEmail => Self::DuplicateEmail,
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    pub password: String,
    pub confirm_password: String,
    /// `MM/DD/YYYY`.
    #[serde(default, alias = "dob")]
    pub date_of_birth: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    pub email: String,
    pub code: String,
    pub new_password: String,
    pub confirm_password: String,
}

/// Identity asserted by an external provider after a successful OAuth exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthProfile {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub avatar_url: Option<String>,
}

pub struct SessionManager {
    config: SessionConfig,
    store: Arc<dyn CredentialStore>,
    cache: Arc<dyn CodeCache>,
    notifier: Arc<dyn Notifier>,
    tokens: Arc<JwtAccessTokenService>,
    clock: Arc<dyn Clock>,
    limiter: ForgotPasswordLimiter,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn CredentialStore>,
        cache: Arc<dyn CodeCache>,
        notifier: Arc<dyn Notifier>,
        tokens: Arc<JwtAccessTokenService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = ForgotPasswordLimiter::new(
            cache.clone(),
            config.forgot_cooldown,
            config.forgot_max_attempts,
            config.forgot_window,
        );
        Self { config, store, cache, notifier, tokens, clock, limiter }
    }

    /// Create an unverified account and send it a verification code. If the
    /// email cannot be delivered the code comes back as `dev_code` so signup
    /// is never blocked on the mail relay.
    pub async fn signup(&self, request: SignupRequest) -> Result<MessageResponse, AuthError> {
        let email = validate_email(&request.email)?;
        validate_new_password(&request.password, &request.confirm_password)?;
        let date_of_birth = request
            .date_of_birth
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(parse_date_of_birth)
            .transpose()?;
        let username = match request.username.as_deref() {
            Some(name) if !name.trim().is_empty() => validate_username(name)?,
            _ => default_username(&email),
        };

        if self.store.find_user_by_email(&email).await?.is_some() {
            return Err(AuthError::DuplicateEmail);
        }

        let password_hash = hash_password_blocking(request.password).await?;
        let user = self
            .store
            .create_user(NewUser {
                email: email.clone(),
                username,
                password_hash: Some(password_hash),
                role: Role::User,
                is_verified: false,
                first_name: None,
                last_name: None,
                date_of_birth,
                avatar_url: None,
            })
            .await?;

        let code = self.issue_code(&email).await?;
        let dev_code = match self.notifier.send_verification_code(&email, &code).await {
            Ok(()) => None,
            Err(error) => {
                tracing::warn!(
                    user_id = %user.id,
                    error = %error,
                    "verification email failed, returning fallback code"
                );
                Some(code)
            }
        };

        tracing::info!(user_id = %user.id, "user signed up");
        Ok(MessageResponse::new(SIGNUP_MESSAGE).with_dev_code(dev_code))
    }

    pub async fn verify_code(&self, email: &str, code: &str) -> Result<TokenBundle, AuthError> {
        let email = validate_email(email)?;
        validate_code(code).map_err(|_| AuthError::InvalidOrExpiredCode)?;
        self.consume_code(&email, code).await?;

        let user = self.store.find_user_by_email(&email).await?.ok_or(AuthError::UserNotFound)?;
        let user = self.store.update_user(user.id, UserUpdate::verified()).await.map_err(
            |error| match error {
                StoreError::UserMissing(_) => AuthError::UserNotFound,
                other => other.into(),
            },
        )?;

        tracing::info!(user_id = %user.id, "email verified");
        self.generate_tokens(&user).await
    }

    /// Missing user, missing password hash and wrong password all collapse
    /// into `InvalidCredentials`.
    pub async fn signin(&self, email: &str, password: &str) -> Result<TokenBundle, AuthError> {
        let email = validate_email(email)?;
        let user =
            self.store.find_user_by_email(&email).await?.ok_or(AuthError::InvalidCredentials)?;
        let stored_hash = user.password_hash.clone().ok_or(AuthError::InvalidCredentials)?;

        if !verify_password_blocking(password.to_string(), stored_hash).await? {
            tracing::info!(user_id = %user.id, "signin rejected: password mismatch");
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_verified {
            return Err(AuthError::AccountNotVerified);
        }

        tracing::info!(user_id = %user.id, "user signed in");
        self.generate_tokens(&user).await
    }

    /// Redeem a refresh token for a new bundle. The presented token is burned
    /// whether or not the redemption succeeds.
    pub async fn refresh(&self, refresh_id: &str) -> Result<TokenBundle, AuthError> {
        if refresh_id.trim().is_empty() {
            return Err(AuthError::InvalidOrExpiredToken);
        }

        let token_hash = tokens::hash_refresh_token(refresh_id);
        let (record, user) = self
            .store
            .find_refresh_token(&token_hash)
            .await?
            .ok_or(AuthError::InvalidOrExpiredToken)?;

        if record.expires_at <= self.clock.now() {
            self.store.delete_refresh_token(record.id).await?;
            return Err(AuthError::InvalidOrExpiredToken);
        }

        if self.store.delete_refresh_token(record.id).await? == 0 {
            tracing::warn!(user_id = %user.id, "refresh token already redeemed");
            return Err(AuthError::InvalidOrExpiredToken);
        }

        self.generate_tokens(&user).await
    }

    /// Rate limits apply before anything else. Unknown emails get the same
    /// message as known ones; unverified accounts do not.
    pub async fn forgot_password(&self, email: &str) -> Result<MessageResponse, AuthError> {
        let email = validate_email(email)?;

        if self.limiter.acquire(&email).await? == RateLimitDecision::Limited {
            tracing::warn!(email = %email, "password reset rate limited");
            return Err(AuthError::RateLimitExceeded);
        }

        let Some(user) = self.store.find_user_by_email(&email).await? else {
            return Ok(MessageResponse::new(FORGOT_PASSWORD_MESSAGE));
        };
        if !user.is_verified {
            return Err(AuthError::AccountNotVerified);
        }

        let code = self.issue_code(&email).await?;
        if let Err(error) = self.notifier.send_reset_code(&email, &code).await {
            tracing::warn!(user_id = %user.id, error = %error, "password reset email failed");
        }

        let dev_code = self.config.expose_dev_codes.then_some(code);
        Ok(MessageResponse::new(FORGOT_PASSWORD_MESSAGE).with_dev_code(dev_code))
    }

    pub async fn reset_password(
        &self,
        request: ResetPasswordRequest,
    ) -> Result<TokenBundle, AuthError> {
        let email = validate_email(&request.email)?;
        validate_code(&request.code).map_err(|_| AuthError::InvalidOrExpiredCode)?;
        validate_new_password(&request.new_password, &request.confirm_password)?;

        let user = self.store.find_user_by_email(&email).await?.ok_or(AuthError::UserNotFound)?;
        if !user.is_verified {
            return Err(AuthError::AccountNotVerified);
        }

        self.consume_code(&email, &request.code).await?;

        let password_hash = hash_password_blocking(request.new_password).await?;
        let user = self.store.update_user(user.id, UserUpdate::password(password_hash)).await?;
        self.limiter.clear(&email).await?;

        tracing::info!(user_id = %user.id, "password reset");
        self.generate_tokens(&user).await
    }

    /// Find or create the account for an external identity. Email is the only
    /// linking key; an existing account is returned unchanged.
    pub async fn oauth_validate(&self, profile: OAuthProfile) -> Result<User, AuthError> {
        let email = profile
            .email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .ok_or(AuthError::NoEmailOnProfile)?
            .to_string();

        if let Some(allowed) = self.config.allowed_email_domain.as_deref() {
            let permitted =
                email_domain(&email).is_some_and(|domain| domain.eq_ignore_ascii_case(allowed));
            if !permitted {
                return Err(AuthError::DomainNotAllowed);
            }
        }

        if let Some(existing) = self.store.find_user_by_email(&email).await? {
            return Ok(existing);
        }

        let created = self
            .store
            .create_user(NewUser {
                username: default_username(&email),
                email: email.clone(),
                password_hash: None,
                role: Role::User,
                is_verified: true,
                first_name: profile.given_name.or(profile.display_name),
                last_name: profile.family_name,
                date_of_birth: None,
                avatar_url: profile.avatar_url,
            })
            .await;

        match created {
            Ok(user) => {
                tracing::info!(user_id = %user.id, "account created from oauth profile");
                Ok(user)
            }
            // Lost a race with a concurrent first login for the same email.
            Err(StoreError::DuplicateEmail) => {
                self.store.find_user_by_email(&email).await?.ok_or(AuthError::DuplicateEmail)
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn oauth_login(&self, profile: OAuthProfile) -> Result<TokenBundle, AuthError> {
        let user = self.oauth_validate(profile).await?;
        self.generate_tokens(&user).await
    }

    /// Terminal step of every successful flow: access token, a new refresh
    /// row and a CSRF token.
    pub async fn generate_tokens(&self, user: &User) -> Result<TokenBundle, AuthError> {
        let public = user.to_public();
        let issued_at = self.clock.now();
        let access_token = self.tokens.issue_access_token(&public, issued_at)?;

        let (refresh_id, token_hash) = generate_refresh_token();
        let refresh_expiry = issued_at + Duration::days(self.config.refresh_token_ttl_days);
        self.store
            .create_refresh_token(RefreshTokenRecord {
                id: Uuid::new_v4(),
                token_hash,
                expires_at: refresh_expiry,
                user_id: user.id,
            })
            .await?;

        Ok(TokenBundle {
            access_token,
            refresh_id,
            refresh_expiry,
            csrf_token: generate_csrf_token(),
            user: public,
        })
    }

    pub async fn current_user(&self, user_id: Uuid) -> Result<PublicUser, AuthError> {
        self.store
            .find_user_by_id(user_id)
            .await?
            .map(|user| user.to_public())
            .ok_or(AuthError::UserNotFound)
    }

    async fn issue_code(&self, email: &str) -> Result<String, AuthError> {
        let code = generate_code();
        self.cache.set_with_ttl(&verification_key(email), &code, self.config.code_ttl).await?;
        Ok(code)
    }

    /// The stored code is removed before comparison, so a wrong guess also
    /// burns it.
    async fn consume_code(&self, email: &str, code: &str) -> Result<(), AuthError> {
        match self.cache.take(&verification_key(email)).await? {
            Some(stored) if constant_time_eq(&stored, code) => Ok(()),
            _ => Err(AuthError::InvalidOrExpiredCode),
        }
    }
}

/// Signup verification and password reset share one slot per email.
fn verification_key(email: &str) -> String {
    format!("verify:{email}")
}
