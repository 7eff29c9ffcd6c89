use crate::{
    api::cookies::{cookie_value, CSRF_COOKIE},
    auth::jwt::{AccessClaims, JwtAccessTokenService},
    error::{ApiError, ErrorCode},
    session::tokens::constant_time_eq,
};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use earnings_common::types::Role;
use std::sync::Arc;

pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: uuid::Uuid,
    pub email: String,
    pub role: Role,
}

pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let AccessClaims { user_id, email, role } = match jwt_service.validate_access_token(token) {
        Ok(claims) => claims,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    request.extensions_mut().insert(AuthenticatedUser { user_id, email, role });

    next.run(request).await
}

/// Must run after [`require_bearer_auth`].
pub async fn require_admin(request: Request, next: Next) -> Response {
    let allowed = request
        .extensions()
        .get::<AuthenticatedUser>()
        .is_some_and(|user| user.role >= Role::Admin);

    if !allowed {
        return ApiError::from_code(ErrorCode::AuthForbidden).into_response();
    }

    next.run(request).await
}

/// Double-submit check for cookie-authenticated mutations.
pub async fn require_csrf(request: Request, next: Next) -> Response {
    if let Err(error) = verify_csrf(request.headers()) {
        return error.into_response();
    }

    next.run(request).await
}

/// The `x-csrf-token` header must equal the `csrf_token` cookie.
pub fn verify_csrf(headers: &HeaderMap) -> Result<(), ApiError> {
    let header = headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let cookie = cookie_value(headers, CSRF_COOKIE);

    match (header, cookie.as_deref()) {
        (Some(header), Some(cookie)) if constant_time_eq(header, cookie) => Ok(()),
        _ => Err(ApiError::from_code(ErrorCode::CsrfMismatch)),
    }
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    ApiError::new(ErrorCode::AuthInvalidToken, message).into_response()
}
