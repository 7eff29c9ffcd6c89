//! Session cookies. The refresh token is HttpOnly and scoped to the auth
//! routes; the CSRF token is readable by scripts so clients can echo it back
//! in the `x-csrf-token` header.

use axum::http::{
    header::{InvalidHeaderValue, COOKIE},
    HeaderMap, HeaderValue,
};
use chrono::{DateTime, Utc};

pub const REFRESH_COOKIE: &str = "refresh_token";
pub const CSRF_COOKIE: &str = "csrf_token";

const REFRESH_COOKIE_PATH: &str = "/v1/auth";
const CSRF_COOKIE_PATH: &str = "/";

pub fn refresh_cookie(
    token: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let max_age = (expires_at - now).num_seconds().max(0);
    build(REFRESH_COOKIE, token, REFRESH_COOKIE_PATH, true, max_age, secure)
}

pub fn csrf_cookie(
    token: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let max_age = (expires_at - now).num_seconds().max(0);
    build(CSRF_COOKIE, token, CSRF_COOKIE_PATH, false, max_age, secure)
}

pub fn clear_refresh_cookie(secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    build(REFRESH_COOKIE, "", REFRESH_COOKIE_PATH, true, 0, secure)
}

pub fn clear_csrf_cookie(secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    build(CSRF_COOKIE, "", CSRF_COOKIE_PATH, false, 0, secure)
}

fn build(
    name: &str,
    value: &str,
    path: &str,
    http_only: bool,
    max_age: i64,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{name}={value}; Path={path}; SameSite=Strict; Max-Age={max_age}");
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// First value for `name` across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
