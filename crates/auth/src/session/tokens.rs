use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

const REFRESH_TOKEN_BYTES: usize = 32;
const CSRF_TOKEN_BYTES: usize = 32;

/// Six-digit code, uniform over 100000..=999999.
pub fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999u32).to_string()
}

/// Random opaque refresh token and the SHA-256 hex digest stored in its place.
pub fn generate_refresh_token() -> (String, String) {
    let token = random_url_safe(REFRESH_TOKEN_BYTES);
    let hash = hash_refresh_token(&token);
    (token, hash)
}

pub fn hash_refresh_token(token: &str) -> String {
    Sha256::digest(token.as_bytes()).iter().map(|byte| format!("{byte:02x}")).collect()
}

pub fn generate_csrf_token() -> String {
    random_url_safe(CSRF_TOKEN_BYTES)
}

/// Comparison whose running time depends only on the input lengths.
pub fn constant_time_eq(left: &str, right: &str) -> bool {
    let (left, right) = (left.as_bytes(), right.as_bytes());
    if left.len() != right.len() {
        return false;
    }
    left.iter().zip(right).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

fn random_url_safe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_six_digits_without_leading_zero() {
        for _ in 0..1_000 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
            assert_ne!(code.as_bytes()[0], b'0');
        }
    }

    #[test]
    fn refresh_tokens_are_unique_and_hash_stably() {
        let (first, first_hash) = generate_refresh_token();
        let (second, second_hash) = generate_refresh_token();

        assert_ne!(first, second);
        assert_ne!(first_hash, second_hash);
        assert_eq!(hash_refresh_token(&first), first_hash);
        assert_eq!(first_hash.len(), 64);
        assert_eq!(URL_SAFE_NO_PAD.decode(&first).expect("token should be base64url").len(), 32);
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq("123456", "123456"));
        assert!(!constant_time_eq("123456", "123457"));
        assert!(!constant_time_eq("123456", "12345"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn csrf_tokens_encode_32_bytes() {
        let token = generate_csrf_token();
        assert_eq!(token.len(), 43);
        assert!(!token.contains('='));
        assert_ne!(token, generate_csrf_token());
    }
}
