//! Weak ETags for buffered responses.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

/// When a response gets an ETag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EtagPolicy {
    /// No ETag at all.
    #[default]
    Never,
    /// Everything but redirects; used once a rule matched.
    ExceptRedirects,
    /// Only 2xx; anything else may be an error page.
    Success,
}

impl EtagPolicy {
    pub fn applies(&self, status: u16) -> bool {
        match self {
            EtagPolicy::Never => false,
            EtagPolicy::ExceptRedirects => !(300..400).contains(&status),
            EtagPolicy::Success => (200..300).contains(&status),
        }
    }
}

/// Weak ETag of `body`: length and a truncated digest.
pub fn weak_etag(body: &[u8]) -> String {
    let digest = BASE64.encode(Sha256::digest(body));
    format!("W/\"{:x}-{}\"", body.len(), &digest[..27])
}

/// Whether an `If-None-Match` value lists `etag`.
pub fn matches_etag(if_none_match: &str, etag: &str) -> bool {
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate == etag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_etag_shape() {
        let etag = weak_etag(b"hello world");
        assert!(etag.starts_with("W/\"b-"));
        assert!(etag.ends_with('"'));
        assert_eq!(etag.len(), "W/\"b-\"".len() + 27);
        assert_eq!(etag, weak_etag(b"hello world"));
        assert_ne!(etag, weak_etag(b"hello there"));
    }

    #[test]
    fn test_policies() {
        assert!(EtagPolicy::Success.applies(200));
        assert!(!EtagPolicy::Success.applies(404));
        assert!(EtagPolicy::ExceptRedirects.applies(404));
        assert!(!EtagPolicy::ExceptRedirects.applies(301));
        assert!(!EtagPolicy::Never.applies(200));
    }

    #[test]
    fn test_if_none_match() {
        let etag = weak_etag(b"x");
        assert!(matches_etag(&format!("\"other\", {}", etag), &etag));
        assert!(!matches_etag("\"other\"", &etag));
    }
}
