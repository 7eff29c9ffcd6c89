use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use chrono::{Duration, Utc};
use earnings_auth::{
    auth::jwt::JwtAccessTokenService,
    cache::{CacheFuture, CodeCache, MemoryCodeCache},
    clock::{Clock, ManualClock},
    config::SessionConfig,
    notify::{Notifier, NotifyFuture},
    session::{
        AuthError, OAuthProfile, ResetPasswordRequest, SessionManager, SignupRequest,
        FORGOT_PASSWORD_MESSAGE,
    },
    store::{
        CredentialStore, MemoryCredentialStore, NewUser, RefreshTokenRecord, StoreFuture, User,
        UserUpdate,
    },
};
use earnings_common::types::{Role, TokenBundle};
use tokio::task::yield_now;
use uuid::Uuid;

const TEST_SECRET: &str = "earnings_test_secret_that_is_definitely_long_enough";
const PASSWORD: &str = "Str0ng!Passw0rd";
const NEW_PASSWORD: &str = "N3w!Passw0rd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeKind {
    Verification,
    Reset,
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(CodeKind, String, String)>>,
}

impl RecordingNotifier {
    fn last_code(&self, kind: CodeKind, email: &str) -> String {
        self.sent
            .lock()
            .expect("notifier lock should not be poisoned")
            .iter()
            .rev()
            .find(|(sent_kind, sent_email, _)| *sent_kind == kind && sent_email == email)
            .map(|(_, _, code)| code.clone())
            .expect("a code should have been sent")
    }

    fn sent_count(&self, kind: CodeKind, email: &str) -> usize {
        self.sent
            .lock()
            .expect("notifier lock should not be poisoned")
            .iter()
            .filter(|(sent_kind, sent_email, _)| *sent_kind == kind && sent_email == email)
            .count()
    }

    fn record(&self, kind: CodeKind, email: &str, code: &str) {
        self.sent
            .lock()
            .expect("notifier lock should not be poisoned")
            .push((kind, email.to_string(), code.to_string()));
    }
}

impl Notifier for RecordingNotifier {
    fn send_verification_code<'a>(&'a self, email: &'a str, code: &'a str) -> NotifyFuture<'a> {
        self.record(CodeKind::Verification, email, code);
        Box::pin(async { Ok(()) })
    }

    fn send_reset_code<'a>(&'a self, email: &'a str, code: &'a str) -> NotifyFuture<'a> {
        self.record(CodeKind::Reset, email, code);
        Box::pin(async { Ok(()) })
    }
}

struct UnreachableNotifier;

impl Notifier for UnreachableNotifier {
    fn send_verification_code<'a>(&'a self, _email: &'a str, _code: &'a str) -> NotifyFuture<'a> {
        Box::pin(async { Err(anyhow!("smtp relay refused connection")) })
    }

    fn send_reset_code<'a>(&'a self, _email: &'a str, _code: &'a str) -> NotifyFuture<'a> {
        Box::pin(async { Err(anyhow!("smtp relay refused connection")) })
    }
}

/// Memory store that yields before every call, like a networked database,
/// so concurrent operations interleave between their reads and writes.
struct YieldingStore(Arc<MemoryCredentialStore>);

impl CredentialStore for YieldingStore {
    fn find_user_by_email<'a>(&'a self, email: &'a str) -> StoreFuture<'a, Option<User>> {
        Box::pin(async move {
            yield_now().await;
            self.0.find_user_by_email(email).await
        })
    }

    fn find_user_by_id(&self, id: Uuid) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move {
            yield_now().await;
            self.0.find_user_by_id(id).await
        })
    }

    fn create_user(&self, user: NewUser) -> StoreFuture<'_, User> {
        Box::pin(async move {
            yield_now().await;
            self.0.create_user(user).await
        })
    }

    fn update_user(&self, id: Uuid, update: UserUpdate) -> StoreFuture<'_, User> {
        Box::pin(async move {
            yield_now().await;
            self.0.update_user(id, update).await
        })
    }

    fn create_refresh_token(&self, record: RefreshTokenRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            yield_now().await;
            self.0.create_refresh_token(record).await
        })
    }

    fn find_refresh_token<'a>(
        &'a self,
        token_hash: &'a str,
    ) -> StoreFuture<'a, Option<(RefreshTokenRecord, User)>> {
        Box::pin(async move {
            yield_now().await;
            self.0.find_refresh_token(token_hash).await
        })
    }

    fn delete_refresh_token(&self, id: Uuid) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            yield_now().await;
            self.0.delete_refresh_token(id).await
        })
    }
}

/// Memory cache that yields before every call, like a networked cache.
struct YieldingCache(Arc<MemoryCodeCache>);

impl CodeCache for YieldingCache {
    fn set_with_ttl<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: std::time::Duration,
    ) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            yield_now().await;
            self.0.set_with_ttl(key, value, ttl).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            yield_now().await;
            self.0.get(key).await
        })
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: std::time::Duration,
    ) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            yield_now().await;
            self.0.set_if_absent(key, value, ttl).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            yield_now().await;
            self.0.delete(key).await
        })
    }

    fn take<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            yield_now().await;
            self.0.take(key).await
        })
    }

    fn increment<'a>(
        &'a self,
        key: &'a str,
        ttl_on_create: std::time::Duration,
    ) -> CacheFuture<'a, i64> {
        Box::pin(async move {
            yield_now().await;
            self.0.increment(key, ttl_on_create).await
        })
    }
}

struct Harness {
    sessions: SessionManager,
    store: Arc<MemoryCredentialStore>,
    cache: Arc<MemoryCodeCache>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    harness_with(SessionConfig::default())
}

fn harness_with(config: SessionConfig) -> Harness {
    build_harness(config, false)
}

fn yielding_harness() -> Harness {
    build_harness(SessionConfig::default(), true)
}

fn build_harness(config: SessionConfig, yielding: bool) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(MemoryCredentialStore::new());
    let cache = Arc::new(MemoryCodeCache::with_clock(clock.clone()));
    let notifier = Arc::new(RecordingNotifier::default());
    let session_store: Arc<dyn CredentialStore> = if yielding {
        Arc::new(YieldingStore(store.clone()))
    } else {
        store.clone()
    };
    let session_cache: Arc<dyn CodeCache> = if yielding {
        Arc::new(YieldingCache(cache.clone()))
    } else {
        cache.clone()
    };
    let sessions = SessionManager::new(
        config,
        session_store,
        session_cache,
        notifier.clone(),
        Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize")),
        clock.clone(),
    );
    Harness { sessions, store, cache, notifier, clock }
}

fn signup_request(email: &str) -> SignupRequest {
    SignupRequest {
        email: email.to_string(),
        username: None,
        password: PASSWORD.to_string(),
        confirm_password: PASSWORD.to_string(),
        date_of_birth: None,
    }
}

async fn verified_account(harness: &Harness, email: &str) -> TokenBundle {
    harness.sessions.signup(signup_request(email)).await.expect("signup should succeed");
    let code = harness.notifier.last_code(CodeKind::Verification, email);
    harness.sessions.verify_code(email, &code).await.expect("verification should succeed")
}

fn reset_request(email: &str, code: &str) -> ResetPasswordRequest {
    ResetPasswordRequest {
        email: email.to_string(),
        code: code.to_string(),
        new_password: NEW_PASSWORD.to_string(),
        confirm_password: NEW_PASSWORD.to_string(),
    }
}

#[tokio::test]
async fn signup_then_verify_returns_verified_user() {
    let harness = harness();
    let response =
        harness.sessions.signup(signup_request("ana@example.com")).await.expect("signup");
    assert!(response.dev_code.is_none());

    let stored = harness
        .store
        .find_user_by_email("ana@example.com")
        .await
        .expect("lookup should run")
        .expect("user should exist");
    assert!(!stored.is_verified);
    assert_ne!(stored.password_hash.as_deref(), Some(PASSWORD));

    let code = harness.notifier.last_code(CodeKind::Verification, "ana@example.com");
    let bundle =
        harness.sessions.verify_code("ana@example.com", &code).await.expect("verify should pass");
    assert!(bundle.user.is_verified);
    assert_eq!(bundle.user.username, "ana");
    assert_eq!(bundle.user.role, Role::User);
}

#[tokio::test]
async fn signup_returns_fallback_code_when_mail_is_down() {
    let store = Arc::new(MemoryCredentialStore::new());
    let sessions = SessionManager::new(
        SessionConfig::default(),
        store,
        Arc::new(MemoryCodeCache::new()),
        Arc::new(UnreachableNotifier),
        Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize")),
        Arc::new(ManualClock::default()),
    );

    let response = sessions.signup(signup_request("b@example.com")).await.expect("signup");
    let code = response.dev_code.expect("fallback code should be returned");
    sessions.verify_code("b@example.com", &code).await.expect("fallback code should verify");
}

#[tokio::test]
async fn duplicate_signup_is_rejected() {
    let harness = harness();
    harness.sessions.signup(signup_request("dup@example.com")).await.expect("first signup");

    let second = harness.sessions.signup(signup_request("dup@example.com")).await;
    assert!(matches!(second, Err(AuthError::DuplicateEmail)));
}

#[tokio::test]
async fn verification_code_is_single_use() {
    let harness = harness();
    harness.sessions.signup(signup_request("once@example.com")).await.expect("signup");
    let code = harness.notifier.last_code(CodeKind::Verification, "once@example.com");

    harness.sessions.verify_code("once@example.com", &code).await.expect("first use");
    let second = harness.sessions.verify_code("once@example.com", &code).await;
    assert!(matches!(second, Err(AuthError::InvalidOrExpiredCode)));
}

#[tokio::test]
async fn verification_code_expires_after_ttl() {
    let harness = harness();
    harness.sessions.signup(signup_request("late@example.com")).await.expect("signup");
    let code = harness.notifier.last_code(CodeKind::Verification, "late@example.com");

    harness.clock.advance(Duration::minutes(11));
    let result = harness.sessions.verify_code("late@example.com", &code).await;
    assert!(matches!(result, Err(AuthError::InvalidOrExpiredCode)));
}

#[tokio::test]
async fn access_token_carries_subject_email_and_role() {
    let harness = harness();
    let bundle = verified_account(&harness, "jwt@example.com").await;

    let verifier = JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize");
    let claims =
        verifier.validate_access_token(&bundle.access_token).expect("token should validate");
    assert_eq!(claims.user_id, bundle.user.id);
    assert_eq!(claims.email, "jwt@example.com");
    assert_eq!(claims.role, Role::User);
    assert!(!bundle.csrf_token.is_empty());
    assert!(bundle.refresh_expiry > harness.clock.now() + Duration::days(6));
}

#[tokio::test]
async fn signin_checks_password_then_verification() {
    let harness = harness();
    verified_account(&harness, "s@example.com").await;

    let wrong = harness.sessions.signin("s@example.com", "Wr0ng!Password").await;
    assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));

    let unknown = harness.sessions.signin("nobody@example.com", PASSWORD).await;
    assert!(matches!(unknown, Err(AuthError::InvalidCredentials)));

    let bundle = harness.sessions.signin("s@example.com", PASSWORD).await.expect("signin");
    assert_eq!(bundle.user.email, "s@example.com");
}

#[tokio::test]
async fn sequential_refresh_rotates_and_burns_the_old_token() {
    let harness = harness();
    let bundle = verified_account(&harness, "r@example.com").await;

    let rotated = harness.sessions.refresh(&bundle.refresh_id).await.expect("first refresh");
    assert_ne!(rotated.refresh_id, bundle.refresh_id);

    let replay = harness.sessions.refresh(&bundle.refresh_id).await;
    assert!(matches!(replay, Err(AuthError::InvalidOrExpiredToken)));

    harness.sessions.refresh(&rotated.refresh_id).await.expect("rotated token should work");
}

#[tokio::test]
async fn concurrent_refresh_has_exactly_one_winner() {
    let harness = yielding_harness();
    let bundle = verified_account(&harness, "race@example.com").await;

    let (first, second) = tokio::join!(
        harness.sessions.refresh(&bundle.refresh_id),
        harness.sessions.refresh(&bundle.refresh_id),
    );

    let successes = [&first, &second].iter().filter(|result| result.is_ok()).count();
    assert_eq!(successes, 1);
    assert!([first, second]
        .into_iter()
        .any(|result| matches!(result, Err(AuthError::InvalidOrExpiredToken))));
    assert_eq!(harness.store.refresh_token_count().await, 1);
}

#[tokio::test]
async fn expired_refresh_token_is_rejected_and_removed() {
    let harness = harness();
    let bundle = verified_account(&harness, "old@example.com").await;

    harness.clock.advance(Duration::days(8));
    let result = harness.sessions.refresh(&bundle.refresh_id).await;
    assert!(matches!(result, Err(AuthError::InvalidOrExpiredToken)));
    assert_eq!(harness.store.refresh_token_count().await, 0);
}

#[tokio::test]
async fn forgot_password_does_not_reveal_unknown_accounts() {
    let harness = harness();
    verified_account(&harness, "known@example.com").await;

    let known = harness.sessions.forgot_password("known@example.com").await.expect("known");
    let unknown = harness.sessions.forgot_password("ghost@example.com").await.expect("unknown");
    assert_eq!(known.message, FORGOT_PASSWORD_MESSAGE);
    assert_eq!(known.message, unknown.message);
    assert_eq!(known.dev_code, unknown.dev_code);

    harness.sessions.signup(signup_request("pending@example.com")).await.expect("signup");
    let unverified = harness.sessions.forgot_password("pending@example.com").await;
    assert!(matches!(unverified, Err(AuthError::AccountNotVerified)));
}

#[tokio::test]
async fn forgot_password_enforces_cooldown_and_hourly_cap() {
    let harness = harness();
    let email = "ghost@example.com";

    harness.sessions.forgot_password(email).await.expect("first attempt");
    let cooling = harness.sessions.forgot_password(email).await;
    assert!(matches!(cooling, Err(AuthError::RateLimitExceeded)));

    harness.clock.advance(Duration::seconds(61));
    harness.sessions.forgot_password(email).await.expect("second attempt");
    harness.clock.advance(Duration::seconds(61));
    harness.sessions.forgot_password(email).await.expect("third attempt");

    harness.clock.advance(Duration::seconds(61));
    let capped = harness.sessions.forgot_password(email).await;
    assert!(matches!(capped, Err(AuthError::RateLimitExceeded)));

    harness.clock.advance(Duration::hours(1));
    harness.sessions.forgot_password(email).await.expect("window should have reset");
}

#[tokio::test]
async fn concurrent_forgot_password_requests_send_one_code() {
    let harness = yielding_harness();
    let email = "burst@example.com";
    verified_account(&harness, email).await;

    let results = tokio::join!(
        harness.sessions.forgot_password(email),
        harness.sessions.forgot_password(email),
        harness.sessions.forgot_password(email),
        harness.sessions.forgot_password(email),
        harness.sessions.forgot_password(email),
        harness.sessions.forgot_password(email),
    );
    let results = [results.0, results.1, results.2, results.3, results.4, results.5];

    let accepted = results.iter().filter(|result| result.is_ok()).count();
    let limited = results
        .iter()
        .filter(|result| matches!(result, Err(AuthError::RateLimitExceeded)))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(limited, 5);
    assert_eq!(harness.notifier.sent_count(CodeKind::Reset, email), 1);

    let attempts = format!("forgot:attempts:{email}");
    assert_eq!(harness.cache.get(&attempts).await.expect("get").as_deref(), Some("1"));
}

#[tokio::test]
async fn reset_password_consumes_code_and_replaces_password() {
    let harness = harness();
    verified_account(&harness, "reset@example.com").await;

    harness.sessions.forgot_password("reset@example.com").await.expect("forgot");
    let code = harness.notifier.last_code(CodeKind::Reset, "reset@example.com");

    let bundle = harness
        .sessions
        .reset_password(reset_request("reset@example.com", &code))
        .await
        .expect("reset should succeed");
    assert_eq!(bundle.user.email, "reset@example.com");

    let replay = harness.sessions.reset_password(reset_request("reset@example.com", &code)).await;
    assert!(matches!(replay, Err(AuthError::InvalidOrExpiredCode)));

    let old = harness.sessions.signin("reset@example.com", PASSWORD).await;
    assert!(matches!(old, Err(AuthError::InvalidCredentials)));
    harness.sessions.signin("reset@example.com", NEW_PASSWORD).await.expect("new password");

    // A successful reset lifts the cooldown.
    harness.sessions.forgot_password("reset@example.com").await.expect("limiter cleared");
}

#[tokio::test]
async fn reset_password_for_unknown_user_is_not_found() {
    let harness = harness();
    let result = harness.sessions.reset_password(reset_request("who@example.com", "123456")).await;
    assert!(matches!(result, Err(AuthError::UserNotFound)));
}

#[tokio::test]
async fn oauth_login_creates_verified_account_without_password() {
    let harness = harness();
    let profile = OAuthProfile {
        email: Some("g@example.com".to_string()),
        given_name: Some("Grace".to_string()),
        family_name: Some("Hopper".to_string()),
        ..OAuthProfile::default()
    };

    let bundle = harness.sessions.oauth_login(profile.clone()).await.expect("oauth login");
    assert!(bundle.user.is_verified);
    assert_eq!(bundle.user.first_name.as_deref(), Some("Grace"));
    assert_eq!(bundle.user.last_name.as_deref(), Some("Hopper"));

    let again = harness.sessions.oauth_login(profile).await.expect("second oauth login");
    assert_eq!(again.user.id, bundle.user.id);

    let signin = harness.sessions.signin("g@example.com", PASSWORD).await;
    assert!(matches!(signin, Err(AuthError::InvalidCredentials)));
}

#[tokio::test]
async fn oauth_links_to_existing_password_account() {
    let harness = harness();
    let existing = verified_account(&harness, "link@example.com").await;

    let profile =
        OAuthProfile { email: Some("link@example.com".to_string()), ..OAuthProfile::default() };
    let user = harness.sessions.oauth_validate(profile).await.expect("oauth validate");
    assert_eq!(user.id, existing.user.id);
    assert!(user.password_hash.is_some());
}

#[tokio::test]
async fn oauth_rejects_missing_email_and_foreign_domain() {
    let harness = harness_with(SessionConfig {
        allowed_email_domain: Some("earnings.dev".to_string()),
        ..SessionConfig::default()
    });

    let missing = harness.sessions.oauth_validate(OAuthProfile::default()).await;
    assert!(matches!(missing, Err(AuthError::NoEmailOnProfile)));

    let foreign = harness
        .sessions
        .oauth_validate(OAuthProfile {
            email: Some("x@gmail.com".to_string()),
            ..OAuthProfile::default()
        })
        .await;
    assert!(matches!(foreign, Err(AuthError::DomainNotAllowed)));

    harness
        .sessions
        .oauth_validate(OAuthProfile {
            email: Some("staff@earnings.dev".to_string()),
            ..OAuthProfile::default()
        })
        .await
        .expect("allowed domain should pass");
}
