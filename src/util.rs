//! Shared utility functions

use sha2::{Digest, Sha256};

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8 boundaries.
///
/// If the string is already shorter than `max_bytes`, returns it unchanged.
/// Otherwise, finds the last valid UTF-8 character boundary at or before `max_bytes`
/// and returns a slice up to that point.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Mask a refresh token for logging (first and last 4 chars only).
///
/// Never log the full token - it is a long-lived credential.
pub fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

/// Hash an API key for tracking without ever storing the raw value.
/// Returns the first 16 hex chars of the SHA-256 digest.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)[..16].to_string()
}

/// Generate a fresh conversation id for an upstream request.
pub fn generate_conversation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate an Anthropic-style message id (`msg_` + 24 hex chars).
pub fn generate_message_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &id[..24])
}

/// Generate an OpenAI-style completion id.
pub fn generate_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_shorter_than_max() {
        assert_eq!(truncate_utf8_safe("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_at_ascii_boundary() {
        assert_eq!(truncate_utf8_safe("hello world", 5), "hello");
    }

    #[test]
    fn test_truncate_at_utf8_boundary() {
        // Each character is 3 bytes, so truncating at 4 keeps only the first
        let s = "日本語";
        assert_eq!(truncate_utf8_safe(s, 4), "日");
        assert_eq!(truncate_utf8_safe(s, 6), "日本");
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("short"), "***");
        assert_eq!(mask_token("abcdefghijklmnop"), "abcd...mnop");
    }

    #[test]
    fn test_message_id_shape() {
        let id = generate_message_id();
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 4 + 24);
    }

    #[test]
    fn test_completion_id_shape() {
        assert!(generate_completion_id().starts_with("chatcmpl-"));
    }

    #[test]
    fn test_hash_api_key_stable() {
        assert_eq!(hash_api_key("sk-test"), hash_api_key("sk-test"));
        assert_ne!(hash_api_key("sk-test"), hash_api_key("sk-other"));
        assert_eq!(hash_api_key("sk-test").len(), 16);
    }
}
