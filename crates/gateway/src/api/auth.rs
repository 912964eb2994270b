//! Token verification for the session gateway.
//!
//! Tokens are read from the environment once at startup; only keyed
//! digests live in process state. Comparison is constant-time over
//! equal-length HMAC tags, so neither token bytes nor length leak.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Holds the HMAC tag of one expected token under a process-local
/// random key.
pub struct TokenGuard {
    key: [u8; 32],
    expected_tag: Vec<u8>,
}

impl TokenGuard {
    pub fn new(token: &str) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let expected_tag = tag(&key, token);
        Self { key, expected_tag }
    }

    /// Build from an environment variable; `None` when unset or empty.
    pub fn from_env(name: &str) -> Option<Self> {
        match std::env::var(name) {
            Ok(token) if !token.is_empty() => Some(Self::new(&token)),
            _ => None,
        }
    }

    /// Constant-time check of a presented token.
    pub fn verify(&self, provided: &str) -> bool {
        let provided_tag = tag(&self.key, provided);
        provided_tag.len() == self.expected_tag.len()
            && bool::from(provided_tag.ct_eq(&self.expected_tag))
    }
}

fn tag(key: &[u8], token: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_token_only() {
        let guard = TokenGuard::new(&"a".repeat(32));
        assert!(guard.verify(&"a".repeat(32)));
        assert!(!guard.verify(&"a".repeat(31)));
        assert!(!guard.verify(&"b".repeat(32)));
        assert!(!guard.verify(""));
    }

    #[test]
    fn missing_env_yields_none() {
        assert!(TokenGuard::from_env("AEGIS_TEST_UNSET_TOKEN_VAR").is_none());
    }
}
