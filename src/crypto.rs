use rand::Rng;
use sha2::{Digest, Sha256};

pub const API_KEY_PREFIX: &str = "sk-";
const API_KEY_RANDOM_LENGTH: usize = 32;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a new `sk-`-prefixed bearer token: 32 lowercase alphanumerics.
pub fn generate_api_key() -> String {
    let mut rng = rand::thread_rng();
    let body: String = (0..API_KEY_RANDOM_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{API_KEY_PREFIX}{body}")
}

/// SHA-256 hex digest of the raw token, used as the lookup key.
pub fn hash_api_key(raw_key: &str) -> String {
    let digest = Sha256::digest(raw_key.as_bytes());
    hex::encode(digest)
}

/// First 7 characters (`sk-` plus 4 random chars) for display purposes.
pub fn api_key_prefix(raw_key: &str) -> String {
    raw_key.chars().take(7).collect()
}

/// Parses `Bearer <token>` case-insensitively out of an `Authorization` header value.
pub fn extract_bearer_token(authorization: &str) -> Option<&str> {
    let mut parts = authorization.splitn(2, ' ');
    let scheme = parts.next()?;
    let token = parts.next()?.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token)
}

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, 12)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_expected_shape() {
        let key = generate_api_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(key.len(), API_KEY_PREFIX.len() + API_KEY_RANDOM_LENGTH);
        assert!(key[API_KEY_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn hash_is_deterministic_and_sensitive_to_single_bit_flip() {
        let key = generate_api_key();
        let h1 = hash_api_key(&key);
        let h2 = hash_api_key(&key);
        assert_eq!(h1, h2);

        let mut flipped = key.into_bytes();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        let flipped = String::from_utf8(flipped).unwrap();
        assert_ne!(h1, hash_api_key(&flipped));
    }

    #[test]
    fn prefix_is_first_seven_chars() {
        let key = "sk-abcdefghijklmnopqrstuvwxyz012345".to_string();
        assert_eq!(api_key_prefix(&key), "sk-abcd");
    }

    #[test]
    fn bearer_extraction_is_case_insensitive_and_rejects_garbage() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("BEARER   abc"), Some("  abc").map(str::trim));
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Bearer"), None);
        assert_eq!(extract_bearer_token("Bearer "), None);
    }

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
    }
}
