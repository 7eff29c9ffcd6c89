use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::session::AuthError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    DuplicateEmail,
    InvalidCredentials,
    AccountNotVerified,
    InvalidOrExpiredCode,
    InvalidOrExpiredToken,
    AuthInvalidToken,
    AuthForbidden,
    CsrfMismatch,
    OAuthStateMismatch,
    OAuthCodeInvalid,
    OAuthInvalidRedirect,
    OAuthProfileRejected,
    OAuthUnavailable,
    UserNotFound,
    NotFound,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::DuplicateEmail => "DUPLICATE_EMAIL",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::AccountNotVerified => "ACCOUNT_NOT_VERIFIED",
            Self::InvalidOrExpiredCode => "INVALID_OR_EXPIRED_CODE",
            Self::InvalidOrExpiredToken => "INVALID_OR_EXPIRED_TOKEN",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::CsrfMismatch => "CSRF_MISMATCH",
            Self::OAuthStateMismatch => "OAUTH_STATE_MISMATCH",
            Self::OAuthCodeInvalid => "OAUTH_CODE_INVALID",
            Self::OAuthInvalidRedirect => "OAUTH_INVALID_REDIRECT",
            Self::OAuthProfileRejected => "OAUTH_PROFILE_REJECTED",
            Self::OAuthUnavailable => "OAUTH_UNAVAILABLE",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::DuplicateEmail => StatusCode::CONFLICT,
            Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::AccountNotVerified => StatusCode::FORBIDDEN,
            Self::InvalidOrExpiredCode => StatusCode::BAD_REQUEST,
            Self::InvalidOrExpiredToken => StatusCode::UNAUTHORIZED,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::CsrfMismatch => StatusCode::FORBIDDEN,
            Self::OAuthStateMismatch => StatusCode::UNAUTHORIZED,
            Self::OAuthCodeInvalid => StatusCode::UNAUTHORIZED,
            Self::OAuthInvalidRedirect => StatusCode::BAD_REQUEST,
            Self::OAuthProfileRejected => StatusCode::FORBIDDEN,
            Self::OAuthUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::UserNotFound => StatusCode::NOT_FOUND,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::InternalError | Self::OAuthUnavailable)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::DuplicateEmail => "an account with this email already exists",
            Self::InvalidCredentials => "invalid email or password",
            Self::AccountNotVerified => "account is not verified",
            Self::InvalidOrExpiredCode => "invalid or expired code",
            Self::InvalidOrExpiredToken => "invalid or expired refresh token",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthForbidden => "caller lacks required permission",
            Self::CsrfMismatch => "csrf token missing or mismatched",
            Self::OAuthStateMismatch => "oauth state parameter mismatch",
            Self::OAuthCodeInvalid => "oauth authorization code invalid or expired",
            Self::OAuthInvalidRedirect => "oauth redirect uri is not allowed",
            Self::OAuthProfileRejected => "oauth profile was rejected",
            Self::OAuthUnavailable => "oauth login is not available",
            Self::UserNotFound => "user not found",
            Self::NotFound => "requested resource not found",
            Self::RateLimited => "too many requests, try again later",
            Self::InternalError => "internal server error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::Validation(inner) => {
                Self::new(ErrorCode::ValidationFailed, inner.to_string())
            }
            AuthError::DuplicateEmail => Self::from_code(ErrorCode::DuplicateEmail),
            AuthError::InvalidCredentials => Self::from_code(ErrorCode::InvalidCredentials),
            AuthError::AccountNotVerified => Self::from_code(ErrorCode::AccountNotVerified),
            AuthError::InvalidOrExpiredCode => Self::from_code(ErrorCode::InvalidOrExpiredCode),
            AuthError::InvalidOrExpiredToken => Self::from_code(ErrorCode::InvalidOrExpiredToken),
            AuthError::RateLimitExceeded => Self::from_code(ErrorCode::RateLimited),
            AuthError::UserNotFound => Self::from_code(ErrorCode::UserNotFound),
            AuthError::NoEmailOnProfile => {
                Self::new(ErrorCode::OAuthProfileRejected, "oauth profile has no email address")
            }
            AuthError::DomainNotAllowed => {
                Self::new(ErrorCode::OAuthProfileRejected, "email domain is not allowed")
            }
            internal @ (AuthError::Store(_) | AuthError::Cache(_) | AuthError::Internal(_)) => {
                tracing::error!(error = ?internal, "auth flow internal error");
                Self::from_code(ErrorCode::InternalError)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
    use earnings_common::validation::ValidationError;
    use serde_json::Value;

    use super::{with_request_id_scope, ApiError, ErrorCode};
    use crate::session::AuthError;

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("error response body should be readable");
        serde_json::from_slice(&body).expect("error response body should be valid json")
    }

    #[tokio::test]
    async fn api_error_uses_scoped_request_id() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ApiError::from_code(ErrorCode::InternalError).into_response()
        })
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
            Some("req-scoped-123")
        );
        let parsed = body_json(response).await;

        assert_eq!(parsed["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(parsed["error"]["retryable"], true);
        assert_eq!(parsed["error"]["request_id"], "req-scoped-123");
        assert_eq!(parsed["error"]["details"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn explicit_request_id_overrides_scope() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ApiError::from_code(ErrorCode::AuthForbidden)
                .with_request_id("req-explicit-456")
                .into_response()
        })
        .await;

        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["request_id"], "req-explicit-456");
    }

    #[tokio::test]
    async fn auth_errors_map_to_stable_codes() {
        let cases = [
            (AuthError::DuplicateEmail, StatusCode::CONFLICT, "DUPLICATE_EMAIL"),
            (AuthError::InvalidCredentials, StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS"),
            (AuthError::AccountNotVerified, StatusCode::FORBIDDEN, "ACCOUNT_NOT_VERIFIED"),
            (AuthError::InvalidOrExpiredCode, StatusCode::BAD_REQUEST, "INVALID_OR_EXPIRED_CODE"),
            (
                AuthError::InvalidOrExpiredToken,
                StatusCode::UNAUTHORIZED,
                "INVALID_OR_EXPIRED_TOKEN",
            ),
            (AuthError::RateLimitExceeded, StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            (AuthError::UserNotFound, StatusCode::NOT_FOUND, "USER_NOT_FOUND"),
            (AuthError::NoEmailOnProfile, StatusCode::FORBIDDEN, "OAUTH_PROFILE_REJECTED"),
            (AuthError::DomainNotAllowed, StatusCode::FORBIDDEN, "OAUTH_PROFILE_REJECTED"),
            (
                AuthError::Validation(ValidationError::PasswordMismatch),
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
            ),
        ];

        for (error, status, code) in cases {
            let response = ApiError::from(error).into_response();
            assert_eq!(response.status(), status);
            let parsed = body_json(response).await;
            assert_eq!(parsed["error"]["code"], code);
        }
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let error = AuthError::Internal(anyhow::anyhow!("db password is hunter2"));
        let response = ApiError::from(error).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["message"], "internal server error");
    }
}
