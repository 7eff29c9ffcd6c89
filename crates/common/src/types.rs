// Core domain types shared by the auth service and its clients.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Account role. Ordered by privilege so guards can compare with `>=`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Admin,
    Superadmin,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Admin => "ADMIN",
            Self::Superadmin => "SUPERADMIN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role '{0}'")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "USER" => Ok(Self::User),
            "ADMIN" => Ok(Self::Admin),
            "SUPERADMIN" => Ok(Self::Superadmin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// User view safe to hand to clients. Never carries the password hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub is_verified: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of every successful authentication event.
///
/// Field names are part of the client contract; do not rename.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_id: String,
    pub refresh_expiry: DateTime<Utc>,
    pub csrf_token: String,
    pub user: PublicUser,
}

/// Generic acknowledgement, optionally carrying a fallback code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_code: Option<String>,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), dev_code: None }
    }

    pub fn with_dev_code(mut self, code: Option<String>) -> Self {
        self.dev_code = code;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> PublicUser {
        PublicUser {
            id: Uuid::nil(),
            email: "a@x.com".to_string(),
            username: "alice".to_string(),
            role: Role::User,
            is_verified: true,
            first_name: None,
            last_name: None,
            date_of_birth: None,
            avatar_url: None,
            created_at: DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is valid"),
        }
    }

    #[test]
    fn role_round_trips_through_wire_names() {
        for role in [Role::User, Role::Admin, Role::Superadmin] {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
            let json = serde_json::to_string(&role).expect("role should serialize");
            assert_eq!(json, format!("\"{}\"", role.as_str()));
        }
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn roles_are_ordered_by_privilege() {
        assert!(Role::Superadmin > Role::Admin);
        assert!(Role::Admin > Role::User);
    }

    #[test]
    fn token_bundle_uses_client_field_names() {
        let bundle = TokenBundle {
            access_token: "at".to_string(),
            refresh_id: "rt".to_string(),
            refresh_expiry: DateTime::<Utc>::from_timestamp(60, 0).expect("valid"),
            csrf_token: "csrf".to_string(),
            user: sample_user(),
        };

        let value = serde_json::to_value(&bundle).expect("bundle should serialize");
        for field in ["accessToken", "refreshId", "refreshExpiry", "csrfToken", "user"] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(value["user"]["isVerified"], true);
        assert!(value["user"].get("passwordHash").is_none());
    }

    #[test]
    fn message_response_omits_absent_dev_code() {
        let value = serde_json::to_value(MessageResponse::new("ok")).expect("serialize");
        assert!(value.get("devCode").is_none());

        let value = serde_json::to_value(
            MessageResponse::new("ok").with_dev_code(Some("123456".to_string())),
        )
        .expect("serialize");
        assert_eq!(value["devCode"], "123456");
    }
}
