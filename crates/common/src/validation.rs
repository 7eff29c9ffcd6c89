// Input validation for auth payloads: email shape, password strength,
// one-time codes, and the MM/DD/YYYY date-of-birth format used by the frontend.

use chrono::NaiveDate;
use thiserror::Error;

/// Minimum password length in characters.
pub const MIN_PASSWORD_CHARS: usize = 8;

/// Maximum password length in bytes (argon2 input bound).
pub const MAX_PASSWORD_BYTES: usize = 128;

/// Maximum email length per RFC 5321.
const MAX_EMAIL_CHARS: usize = 254;

/// Length of verification and reset codes.
pub const CODE_LENGTH: usize = 6;

const PASSWORD_SPECIALS: &str = "!@#$%^&*()_+-=[]{};':\"\\|,.<>/?`~";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("email is required")]
    EmailMissing,

    #[error("email is not a valid address")]
    EmailInvalid,

    #[error("password must be at least {MIN_PASSWORD_CHARS} characters")]
    PasswordTooShort,

    #[error("password must be at most {MAX_PASSWORD_BYTES} bytes")]
    PasswordTooLong,

    #[error(
        "password must contain an uppercase letter, a lowercase letter, a digit, and a special character"
    )]
    PasswordTooWeak,

    #[error("passwords do not match")]
    PasswordMismatch,

    #[error("code must be exactly {CODE_LENGTH} digits")]
    CodeFormat,

    #[error("date of birth must use MM/DD/YYYY")]
    DateOfBirthFormat,

    #[error("username must be between 1 and 64 characters")]
    UsernameLength,
}

/// Trim surrounding whitespace and check the basic `local@domain.tld` shape.
///
/// Case is preserved: emails are matched exactly as stored.
pub fn validate_email(input: &str) -> Result<String, ValidationError> {
    let email = input.trim();
    if email.is_empty() {
        return Err(ValidationError::EmailMissing);
    }
    if email.chars().count() > MAX_EMAIL_CHARS || email.chars().any(char::is_whitespace) {
        return Err(ValidationError::EmailInvalid);
    }

    let (local, domain) = email.split_once('@').ok_or(ValidationError::EmailInvalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(ValidationError::EmailInvalid);
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return Err(ValidationError::EmailInvalid);
    }

    Ok(email.to_string())
}

pub fn validate_password_strength(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(ValidationError::PasswordTooShort);
    }
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(ValidationError::PasswordTooLong);
    }

    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| PASSWORD_SPECIALS.contains(c));

    if has_upper && has_lower && has_digit && has_special {
        Ok(())
    } else {
        Err(ValidationError::PasswordTooWeak)
    }
}

/// Strength check plus confirmation match.
pub fn validate_new_password(password: &str, confirm: &str) -> Result<(), ValidationError> {
    validate_password_strength(password)?;
    if password != confirm {
        return Err(ValidationError::PasswordMismatch);
    }
    Ok(())
}

pub fn validate_code(code: &str) -> Result<(), ValidationError> {
    if code.len() == CODE_LENGTH && code.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ValidationError::CodeFormat)
    }
}

pub fn parse_date_of_birth(input: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(input.trim(), "%m/%d/%Y")
        .map_err(|_| ValidationError::DateOfBirthFormat)
}

pub fn validate_username(username: &str) -> Result<String, ValidationError> {
    let username = username.trim();
    let len = username.chars().count();
    if len == 0 || len > 64 {
        return Err(ValidationError::UsernameLength);
    }
    Ok(username.to_string())
}

/// Username fallback: the local part of the email address.
pub fn default_username(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}

/// Domain portion of an email, if any.
pub fn email_domain(email: &str) -> Option<&str> {
    email.rsplit_once('@').map(|(_, domain)| domain)
}
