// Content Key - collapse cosmetic variants of the same message text
//
// Lowercase, strip query strings and fragments from URLs, collapse runs of
// whitespace, keep a bounded prefix, then hash.

use sha2::{Digest, Sha256};
use std::fmt;

/// Characters of normalized text that take part in the key
pub const NORMALIZED_PREFIX_CHARS: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey([u8; 16]);

impl ContentKey {
    pub fn from_text(text: &str) -> Self {
        Self::from_normalized(&normalize(text, NORMALIZED_PREFIX_CHARS))
    }

    pub fn from_normalized(normalized: &str) -> Self {
        let digest = Sha256::digest(normalized.as_bytes());
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        Self(key)
    }

    /// Key for a payload that may not be text
    pub fn from_payload(payload: &[u8]) -> Self {
        match std::str::from_utf8(payload) {
            Ok(text) => Self::from_text(text),
            Err(_) => {
                let digest = Sha256::digest(payload);
                let mut key = [0u8; 16];
                key.copy_from_slice(&digest[..16]);
                Self(key)
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", hex::encode(&self.0[..8]))
    }
}

/// Normalize message text for content-level dedup
pub fn normalize(text: &str, max_chars: usize) -> String {
    let lowered = text.to_lowercase();
    let mut out = String::with_capacity(lowered.len().min(max_chars * 4));
    for (i, token) in lowered.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(strip_url_suffix(token));
    }
    match out.char_indices().nth(max_chars) {
        Some((cut, _)) => out[..cut].to_string(),
        None => out,
    }
}

fn strip_url_suffix(token: &str) -> &str {
    if !looks_like_url(token) {
        return token;
    }
    match token.find(|c: char| c == '?' || c == '#') {
        Some(idx) => &token[..idx],
        None => token,
    }
}

fn looks_like_url(token: &str) -> bool {
    token.contains("://") || token.starts_with("www.")
}
