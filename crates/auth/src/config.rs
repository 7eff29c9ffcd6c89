// Auth service configuration.
//
// Server settings come from `EARNINGS_AUTH_*` environment variables with
// development defaults. Session tunables live in `SessionConfig`, which is
// handed to the session manager at construction.

use std::{net::SocketAddr, time::Duration};

use crate::notify::SmtpSettings;

pub const DEV_JWT_SECRET: &str = "earnings_local_development_jwt_secret_32_chars";

const DEFAULT_PORT: u16 = 8081;
const DEFAULT_REFRESH_TOKEN_TTL_DAYS: i64 = 7;
const DEFAULT_SMTP_PORT: u16 = 587;

pub const DEFAULT_CODE_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_FORGOT_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_FORGOT_WINDOW: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_FORGOT_MAX_ATTEMPTS: i64 = 3;

/// Tunables for the session lifecycle. Passed to the session manager once;
/// nothing in the flows reads the environment directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Lifetime of verification and reset codes.
    pub code_ttl: Duration,
    pub refresh_token_ttl_days: i64,
    pub forgot_cooldown: Duration,
    pub forgot_max_attempts: i64,
    pub forgot_window: Duration,
    /// When set, OAuth logins outside this domain are rejected.
    pub allowed_email_domain: Option<String>,
    /// Return reset codes in the response body. Never enabled in production.
    pub expose_dev_codes: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            code_ttl: DEFAULT_CODE_TTL,
            refresh_token_ttl_days: DEFAULT_REFRESH_TOKEN_TTL_DAYS,
            forgot_cooldown: DEFAULT_FORGOT_COOLDOWN,
            forgot_max_attempts: DEFAULT_FORGOT_MAX_ATTEMPTS,
            forgot_window: DEFAULT_FORGOT_WINDOW,
            allowed_email_domain: None,
            expose_dev_codes: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleOAuthSettings {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct AuthServiceConfig {
    pub listen_addr: SocketAddr,
    pub jwt_secret: String,
    /// PostgreSQL connection string. The in-memory store is used when unset.
    pub database_url: Option<String>,
    /// Redis connection string. The in-memory cache is used when unset.
    pub redis_url: Option<String>,
    pub production: bool,
    pub cookie_secure: bool,
    pub cors_origins: Option<String>,
    pub log_filter: String,
    pub log_format: LogFormat,
    pub smtp: Option<SmtpSettings>,
    /// OAuth is unavailable when either Google credential is missing.
    pub google: Option<GoogleOAuthSettings>,
    pub session: SessionConfig,
}

impl AuthServiceConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `EARNINGS_AUTH_HOST` | `0.0.0.0` |
    /// | `EARNINGS_AUTH_PORT` | `8081` |
    /// | `EARNINGS_AUTH_JWT_SECRET` | dev-only placeholder |
    /// | `EARNINGS_AUTH_DATABASE_URL` | *(none: in-memory store)* |
    /// | `EARNINGS_AUTH_REDIS_URL` | *(none: in-memory cache)* |
    /// | `EARNINGS_AUTH_REFRESH_TOKEN_TTL_DAYS` | `7` |
    /// | `EARNINGS_AUTH_ALLOWED_EMAIL_DOMAIN` | *(none)* |
    /// | `EARNINGS_AUTH_ENVIRONMENT` | `development` |
    /// | `EARNINGS_AUTH_COOKIE_SECURE` | `true` in production |
    /// | `EARNINGS_AUTH_SMTP_HOST` / `_PORT` / `_USERNAME` / `_PASSWORD` / `_FROM` | *(none: log only)* |
    /// | `EARNINGS_AUTH_GOOGLE_CLIENT_ID` / `_CLIENT_SECRET` | *(none: OAuth disabled)* |
    /// | `EARNINGS_AUTH_CORS_ORIGINS` | *(none: dev origins)* |
    /// | `EARNINGS_AUTH_LOG_FILTER` | `info` |
    /// | `EARNINGS_AUTH_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let non_empty = |key: &str| env(key).ok().filter(|value| !value.trim().is_empty());

        let host = non_empty("EARNINGS_AUTH_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = non_empty("EARNINGS_AUTH_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            non_empty("EARNINGS_AUTH_JWT_SECRET").unwrap_or_else(|| DEV_JWT_SECRET.into());

        let production = non_empty("EARNINGS_AUTH_ENVIRONMENT")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("production"));
        let cookie_secure = non_empty("EARNINGS_AUTH_COOKIE_SECURE")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(production);

        let refresh_token_ttl_days = non_empty("EARNINGS_AUTH_REFRESH_TOKEN_TTL_DAYS")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|days| *days > 0)
            .unwrap_or(DEFAULT_REFRESH_TOKEN_TTL_DAYS);

        let allowed_email_domain = non_empty("EARNINGS_AUTH_ALLOWED_EMAIL_DOMAIN")
            .map(|domain| domain.trim().trim_start_matches('@').to_string());

        let smtp_host = non_empty("EARNINGS_AUTH_SMTP_HOST");
        let smtp = match (smtp_host, non_empty("EARNINGS_AUTH_SMTP_FROM")) {
            (Some(host), Some(from)) => Some(SmtpSettings {
                host,
                port: non_empty("EARNINGS_AUTH_SMTP_PORT")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_SMTP_PORT),
                username: non_empty("EARNINGS_AUTH_SMTP_USERNAME").unwrap_or_default(),
                password: non_empty("EARNINGS_AUTH_SMTP_PASSWORD").unwrap_or_default(),
                from,
            }),
            _ => None,
        };

        let google = match (
            non_empty("EARNINGS_AUTH_GOOGLE_CLIENT_ID"),
            non_empty("EARNINGS_AUTH_GOOGLE_CLIENT_SECRET"),
        ) {
            (Some(client_id), Some(client_secret)) => {
                Some(GoogleOAuthSettings { client_id, client_secret })
            }
            _ => None,
        };

        let log_format = match non_empty("EARNINGS_AUTH_LOG_FORMAT").as_deref() {
            Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            jwt_secret,
            database_url: non_empty("EARNINGS_AUTH_DATABASE_URL"),
            redis_url: non_empty("EARNINGS_AUTH_REDIS_URL"),
            production,
            cookie_secure,
            cors_origins: non_empty("EARNINGS_AUTH_CORS_ORIGINS"),
            log_filter: non_empty("EARNINGS_AUTH_LOG_FILTER").unwrap_or_else(|| "info".into()),
            log_format,
            smtp,
            google,
            session: SessionConfig {
                refresh_token_ttl_days,
                allowed_email_domain,
                expose_dev_codes: !production,
                ..SessionConfig::default()
            },
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
