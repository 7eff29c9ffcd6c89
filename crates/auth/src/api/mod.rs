pub mod cookies;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, State},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use earnings_common::types::{MessageResponse, PublicUser, TokenBundle};
use serde::Deserialize;
use serde_json::json;

use self::cookies::{
    clear_csrf_cookie, clear_refresh_cookie, cookie_value, csrf_cookie, refresh_cookie,
    REFRESH_COOKIE,
};
use crate::{
    auth::{
        jwt::JwtAccessTokenService,
        middleware::{require_admin, require_bearer_auth, verify_csrf, AuthenticatedUser},
    },
    error::{ApiError, ErrorCode},
    session::{ResetPasswordRequest, SessionManager, SignupRequest},
    validation::ValidatedJson,
};

#[derive(Clone)]
pub struct ApiState {
    sessions: Arc<SessionManager>,
    cookie_secure: bool,
}

impl ApiState {
    pub fn new(sessions: Arc<SessionManager>, cookie_secure: bool) -> Self {
        Self { sessions, cookie_secure }
    }
}

pub fn router(state: ApiState, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    let protected = Router::new()
        .route("/v1/auth/me", get(current_user))
        .route(
            "/v1/auth/admin/ping",
            get(admin_ping).route_layer(middleware::from_fn(require_admin)),
        )
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth));

    Router::new()
        .route("/v1/auth/signup", post(signup))
        .route("/v1/auth/verify", post(verify))
        .route("/v1/auth/signin", post(signin))
        .route("/v1/auth/refresh", post(refresh))
        .route("/v1/auth/forgot-password", post(forgot_password))
        .route("/v1/auth/reset-password", post(reset_password))
        .route("/v1/auth/logout", post(logout))
        .merge(protected)
        .with_state(state)
}

/// JSON bundle plus the refresh and CSRF cookies for browser clients.
pub fn session_response(bundle: TokenBundle, secure: bool) -> Response {
    let now = Utc::now();
    let cookies = [
        refresh_cookie(&bundle.refresh_id, bundle.refresh_expiry, now, secure),
        csrf_cookie(&bundle.csrf_token, bundle.refresh_expiry, now, secure),
    ];

    let mut response = Json(bundle).into_response();
    for cookie in cookies {
        match cookie {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(error) => tracing::warn!(?error, "session cookie could not be encoded"),
        }
    }
    response
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    email: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct SigninRequest {
    email: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    #[serde(default)]
    refresh_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ForgotPasswordRequest {
    email: String,
}

async fn signup(
    State(state): State<ApiState>,
    ValidatedJson(payload): ValidatedJson<SignupRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let response = state.sessions.signup(payload).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn verify(
    State(state): State<ApiState>,
    ValidatedJson(payload): ValidatedJson<VerifyRequest>,
) -> Result<Response, ApiError> {
    let bundle = state.sessions.verify_code(&payload.email, &payload.code).await?;
    Ok(session_response(bundle, state.cookie_secure))
}

async fn signin(
    State(state): State<ApiState>,
    ValidatedJson(payload): ValidatedJson<SigninRequest>,
) -> Result<Response, ApiError> {
    let bundle = state.sessions.signin(&payload.email, &payload.password).await?;
    Ok(session_response(bundle, state.cookie_secure))
}

/// Accepts `refreshId` in the body, or falls back to the `refresh_token`
/// cookie. The cookie path needs a matching CSRF header.
async fn refresh(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RefreshRequest::default()
    } else {
        serde_json::from_slice::<RefreshRequest>(&body).map_err(|error| {
            ApiError::new(ErrorCode::ValidationFailed, format!("invalid JSON payload: {error}"))
        })?
    };

    let refresh_id = match request.refresh_id.filter(|id| !id.trim().is_empty()) {
        Some(refresh_id) => refresh_id,
        None => {
            let cookie = cookie_value(&headers, REFRESH_COOKIE)
                .ok_or_else(|| ApiError::from_code(ErrorCode::InvalidOrExpiredToken))?;
            verify_csrf(&headers)?;
            cookie
        }
    };

    let bundle = state.sessions.refresh(&refresh_id).await?;
    Ok(session_response(bundle, state.cookie_secure))
}

async fn forgot_password(
    State(state): State<ApiState>,
    ValidatedJson(payload): ValidatedJson<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    Ok(Json(state.sessions.forgot_password(&payload.email).await?))
}

async fn reset_password(
    State(state): State<ApiState>,
    ValidatedJson(payload): ValidatedJson<ResetPasswordRequest>,
) -> Result<Response, ApiError> {
    let bundle = state.sessions.reset_password(payload).await?;
    Ok(session_response(bundle, state.cookie_secure))
}

async fn logout(State(state): State<ApiState>) -> Response {
    let secure = state.cookie_secure;
    let mut response = StatusCode::NO_CONTENT.into_response();
    for cookie in [clear_refresh_cookie(secure), clear_csrf_cookie(secure)].into_iter().flatten() {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

async fn current_user(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<PublicUser>, ApiError> {
    Ok(Json(state.sessions.current_user(user.user_id).await?))
}

async fn admin_ping(Extension(user): Extension<AuthenticatedUser>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "role": user.role }))
}
