use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration as StdDuration, Instant},
};

use axum::{
    extract::State,
    http::{header::RETRY_AFTER, HeaderValue},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

use crate::{
    api::session_response,
    config::GoogleOAuthSettings,
    error::{ApiError, ErrorCode},
    session::{OAuthProfile, SessionManager},
    validation::ValidatedJson,
};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";
const GOOGLE_SCOPE: &str = "openid email profile";
const DEFAULT_FLOW_TTL_MINUTES: i64 = 10;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: usize = 30;
const PROVIDER_TIMEOUT_SECS: u64 = 10;
const MAX_STATE_LEN: usize = 512;
const MIN_CODE_CHALLENGE_LEN: usize = 43;
const MAX_CODE_CHALLENGE_LEN: usize = 128;

pub type ExchangeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Provider calls made during the callback. Boxed futures keep the trait
/// object-safe so tests can swap in a fake provider.
pub trait OAuthExchange: Send + Sync {
    /// Trade an authorization code for a provider access token.
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        credentials: &'a GoogleOAuthSettings,
        redirect_uri: &'a str,
        code_verifier: &'a str,
    ) -> ExchangeFuture<'a, String>;

    fn fetch_profile<'a>(&'a self, access_token: &'a str) -> ExchangeFuture<'a, OAuthProfile>;
}

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    name: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
    picture: Option<String>,
}

impl From<GoogleUserInfo> for OAuthProfile {
    fn from(info: GoogleUserInfo) -> Self {
        Self {
            // An unverified provider email proves nothing about the mailbox.
            email: info.email.filter(|_| info.email_verified),
            display_name: info.name,
            given_name: info.given_name,
            family_name: info.family_name,
            avatar_url: info.picture,
        }
    }
}

pub struct GoogleExchange {
    http: reqwest::Client,
    token_url: String,
    userinfo_url: String,
}

impl GoogleExchange {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            token_url: GOOGLE_TOKEN_URL.to_string(),
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
        })
    }
}

impl OAuthExchange for GoogleExchange {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        credentials: &'a GoogleOAuthSettings,
        redirect_uri: &'a str,
        code_verifier: &'a str,
    ) -> ExchangeFuture<'a, String> {
        Box::pin(async move {
            let response = self
                .http
                .post(&self.token_url)
                .form(&[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("client_id", credentials.client_id.as_str()),
                    ("client_secret", credentials.client_secret.as_str()),
                    ("redirect_uri", redirect_uri),
                    ("code_verifier", code_verifier),
                ])
                .send()
                .await
                .map_err(|error| {
                    tracing::error!(?error, "google token endpoint unreachable");
                    ApiError::from_code(ErrorCode::OAuthUnavailable)
                })?;

            if !response.status().is_success() {
                tracing::warn!(status = response.status().as_u16(), "google rejected auth code");
                return Err(ApiError::from_code(ErrorCode::OAuthCodeInvalid));
            }

            let tokens = response.json::<GoogleTokenResponse>().await.map_err(|error| {
                tracing::error!(?error, "google token response was not understood");
                ApiError::from_code(ErrorCode::InternalError)
            })?;
            Ok(tokens.access_token)
        })
    }

    fn fetch_profile<'a>(&'a self, access_token: &'a str) -> ExchangeFuture<'a, OAuthProfile> {
        Box::pin(async move {
            let response = self
                .http
                .get(&self.userinfo_url)
                .bearer_auth(access_token)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|error| {
                    tracing::error!(?error, "google userinfo request failed");
                    ApiError::from_code(ErrorCode::OAuthUnavailable)
                })?;

            let info = response.json::<GoogleUserInfo>().await.map_err(|error| {
                tracing::error!(?error, "google userinfo response was not understood");
                ApiError::from_code(ErrorCode::InternalError)
            })?;
            Ok(info.into())
        })
    }
}

#[derive(Clone)]
pub struct OAuthState {
    flow_store: Arc<OAuthFlowStore>,
    rate_limiter: Arc<OAuthStartRateLimiter>,
    /// `None` when Google credentials are not configured.
    google: Option<GoogleOAuthSettings>,
    authorize_url: String,
    scope: String,
    flow_ttl: Duration,
    exchange: Arc<dyn OAuthExchange>,
    sessions: Arc<SessionManager>,
    cookie_secure: bool,
}

impl OAuthState {
    pub fn new(
        google: Option<GoogleOAuthSettings>,
        exchange: Arc<dyn OAuthExchange>,
        sessions: Arc<SessionManager>,
        cookie_secure: bool,
    ) -> Self {
        Self {
            flow_store: Arc::new(OAuthFlowStore::default()),
            rate_limiter: Arc::new(OAuthStartRateLimiter::new(
                DEFAULT_RATE_LIMIT_MAX_REQUESTS,
                StdDuration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            )),
            google,
            authorize_url: GOOGLE_AUTH_URL.to_string(),
            scope: GOOGLE_SCOPE.to_string(),
            flow_ttl: Duration::minutes(DEFAULT_FLOW_TTL_MINUTES),
            exchange,
            sessions,
            cookie_secure,
        }
    }

    fn credentials(&self) -> Result<&GoogleOAuthSettings, ApiError> {
        self.google.as_ref().ok_or_else(|| ApiError::from_code(ErrorCode::OAuthUnavailable))
    }
}

pub fn router(state: OAuthState) -> Router {
    Router::new()
        .route("/v1/auth/oauth/google/start", post(start_google_oauth))
        .route("/v1/auth/oauth/google/callback", post(callback_google_oauth))
        .with_state(state)
}

#[derive(Debug, Clone)]
pub struct OAuthFlowRecord {
    pub redirect_uri: String,
    pub state: String,
    pub code_challenge: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct OAuthFlowStore {
    flows: RwLock<HashMap<Uuid, OAuthFlowRecord>>,
}

impl OAuthFlowStore {
    async fn insert(&self, flow_id: Uuid, record: OAuthFlowRecord) {
        let mut guard = self.flows.write().await;
        prune_expired_flows(&mut guard);
        guard.insert(flow_id, record);
    }

    /// Consume a flow (one-time use). Returns None if expired or not found.
    async fn take(&self, flow_id: Uuid) -> Option<OAuthFlowRecord> {
        let mut guard = self.flows.write().await;
        prune_expired_flows(&mut guard);
        guard.remove(&flow_id)
    }
}

#[derive(Debug)]
struct OAuthStartRateLimiter {
    max_requests: usize,
    window: StdDuration,
    requests: RwLock<VecDeque<Instant>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

impl OAuthStartRateLimiter {
    fn new(max_requests: usize, window: StdDuration) -> Self {
        Self { max_requests, window, requests: RwLock::new(VecDeque::new()) }
    }

    async fn check(&self) -> StartDecision {
        let now = Instant::now();
        let mut guard = self.requests.write().await;
        prune_old_requests(&mut guard, now, self.window);

        if guard.len() >= self.max_requests {
            let retry_after_secs = guard
                .front()
                .map(|oldest| {
                    let elapsed = now.duration_since(*oldest);
                    self.window
                        .checked_sub(elapsed)
                        .unwrap_or_else(|| StdDuration::from_secs(0))
                        .as_secs()
                        .max(1)
                })
                .unwrap_or(1);

            return StartDecision::Limited { retry_after_secs };
        }

        guard.push_back(now);
        StartDecision::Allowed
    }
}

#[derive(Debug, Deserialize)]
struct OAuthStartRequest {
    redirect_uri: String,
    state: String,
    code_challenge: String,
    code_challenge_method: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct OAuthStartResponse {
    flow_id: Uuid,
    authorization_url: String,
    expires_at: DateTime<Utc>,
}

enum OAuthStartError {
    Api(ApiError),
    RateLimited { retry_after_secs: u64 },
}

impl From<ApiError> for OAuthStartError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl IntoResponse for OAuthStartError {
    fn into_response(self) -> Response {
        match self {
            Self::Api(error) => error.into_response(),
            Self::RateLimited { retry_after_secs } => {
                let mut response = ApiError::from_code(ErrorCode::RateLimited).into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(RETRY_AFTER, value);
                }
                response
            }
        }
    }
}

async fn start_google_oauth(
    State(state): State<OAuthState>,
    ValidatedJson(payload): ValidatedJson<OAuthStartRequest>,
) -> Result<Json<OAuthStartResponse>, OAuthStartError> {
    let credentials = state.credentials()?;

    if let StartDecision::Limited { retry_after_secs } = state.rate_limiter.check().await {
        return Err(OAuthStartError::RateLimited { retry_after_secs });
    }

    validate_redirect_uri(&payload.redirect_uri)?;
    validate_state(&payload.state)?;
    validate_code_challenge_method(&payload.code_challenge_method)?;
    validate_code_challenge(&payload.code_challenge)?;

    let flow_id = Uuid::new_v4();
    let expires_at = Utc::now() + state.flow_ttl;
    state
        .flow_store
        .insert(
            flow_id,
            OAuthFlowRecord {
                redirect_uri: payload.redirect_uri.clone(),
                state: payload.state.clone(),
                code_challenge: payload.code_challenge.clone(),
                expires_at,
            },
        )
        .await;

    let authorization_url = build_authorization_url(
        &state.authorize_url,
        &credentials.client_id,
        &state.scope,
        &payload,
    )?;

    Ok(Json(OAuthStartResponse { flow_id, authorization_url, expires_at }))
}

fn validate_redirect_uri(redirect_uri: &str) -> Result<(), ApiError> {
    let parsed = Url::parse(redirect_uri).map_err(|_| {
        ApiError::new(ErrorCode::OAuthInvalidRedirect, "redirect_uri must be a valid absolute URL")
    })?;

    if parsed.fragment().is_some() {
        return Err(ApiError::new(
            ErrorCode::OAuthInvalidRedirect,
            "redirect_uri must not contain a fragment",
        ));
    }

    let host = parsed.host_str().ok_or_else(|| {
        ApiError::new(ErrorCode::OAuthInvalidRedirect, "redirect_uri must include a host")
    })?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" if is_loopback_host(host) => Ok(()),
        _ => Err(ApiError::new(
            ErrorCode::OAuthInvalidRedirect,
            "redirect_uri must use https or localhost http",
        )),
    }
}

fn validate_state(state: &str) -> Result<(), ApiError> {
    if state.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::ValidationFailed, "state must not be empty"));
    }
    if state.len() > MAX_STATE_LEN {
        return Err(ApiError::new(
            ErrorCode::ValidationFailed,
            format!("state must be at most {MAX_STATE_LEN} bytes"),
        ));
    }
    Ok(())
}

fn validate_code_challenge_method(method: &str) -> Result<(), ApiError> {
    if method != "S256" {
        return Err(ApiError::new(
            ErrorCode::ValidationFailed,
            "code_challenge_method must be S256",
        ));
    }
    Ok(())
}

fn validate_code_challenge(code_challenge: &str) -> Result<(), ApiError> {
    let len = code_challenge.len();
    if !(MIN_CODE_CHALLENGE_LEN..=MAX_CODE_CHALLENGE_LEN).contains(&len) {
        return Err(ApiError::new(
            ErrorCode::ValidationFailed,
            format!(
                "code_challenge must be between {MIN_CODE_CHALLENGE_LEN} and {MAX_CODE_CHALLENGE_LEN} chars"
            ),
        ));
    }
    let base64url = |char: char| char.is_ascii_alphanumeric() || char == '-' || char == '_';
    if !code_challenge.chars().all(base64url) {
        return Err(ApiError::new(
            ErrorCode::ValidationFailed,
            "code_challenge must be base64url (A-Z, a-z, 0-9, -, _)",
        ));
    }
    Ok(())
}

fn build_authorization_url(
    authorize_base: &str,
    client_id: &str,
    scope: &str,
    payload: &OAuthStartRequest,
) -> Result<String, ApiError> {
    let mut url = Url::parse(authorize_base).map_err(|error| {
        tracing::error!(?error, "invalid Google authorize URL configuration");
        ApiError::from_code(ErrorCode::InternalError)
    })?;

    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("client_id", client_id);
        pairs.append_pair("redirect_uri", &payload.redirect_uri);
        pairs.append_pair("state", &payload.state);
        pairs.append_pair("code_challenge", &payload.code_challenge);
        pairs.append_pair("code_challenge_method", "S256");
        pairs.append_pair("response_type", "code");
        pairs.append_pair("scope", scope);
    }

    Ok(url.to_string())
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "[::1]")
}

fn prune_expired_flows(flows: &mut HashMap<Uuid, OAuthFlowRecord>) {
    let now = Utc::now();
    flows.retain(|_, record| record.expires_at > now);
}

fn prune_old_requests(requests: &mut VecDeque<Instant>, now: Instant, window: StdDuration) {
    while requests.front().is_some_and(|entry| now.duration_since(*entry) >= window) {
        requests.pop_front();
    }
}

#[derive(Debug, Deserialize)]
struct OAuthCallbackRequest {
    flow_id: Uuid,
    code: String,
    state: String,
    code_verifier: String,
}

async fn callback_google_oauth(
    State(state): State<OAuthState>,
    ValidatedJson(payload): ValidatedJson<OAuthCallbackRequest>,
) -> Result<Response, ApiError> {
    let credentials = state.credentials()?;

    let flow = state.flow_store.take(payload.flow_id).await.ok_or_else(|| {
        ApiError::new(ErrorCode::OAuthCodeInvalid, "unknown or expired flow")
    })?;

    if flow.state != payload.state {
        return Err(ApiError::from_code(ErrorCode::OAuthStateMismatch));
    }

    verify_pkce_s256(&payload.code_verifier, &flow.code_challenge)?;

    let provider_token = state
        .exchange
        .exchange_code(&payload.code, credentials, &flow.redirect_uri, &payload.code_verifier)
        .await?;
    let profile = state.exchange.fetch_profile(&provider_token).await?;

    let bundle = state.sessions.oauth_login(profile).await?;
    Ok(session_response(bundle, state.cookie_secure))
}

/// SHA256(code_verifier) base64url-encoded must equal code_challenge.
fn verify_pkce_s256(code_verifier: &str, code_challenge: &str) -> Result<(), ApiError> {
    let hash = Sha256::digest(code_verifier.as_bytes());
    let computed_challenge = URL_SAFE_NO_PAD.encode(hash);

    if computed_challenge != code_challenge {
        return Err(ApiError::new(
            ErrorCode::OAuthCodeInvalid,
            "PKCE code_verifier does not match code_challenge",
        ));
    }
    Ok(())
}
