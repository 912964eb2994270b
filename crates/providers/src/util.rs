//! Helpers shared by the HTTP adapters.

use aegis_domain::config::ProviderConfig;
use aegis_domain::{Error, Result};

/// Resolve the provider's API key from the environment variable named in
/// its config. Keys are read once, at adapter construction.
pub(crate) fn resolve_api_key(cfg: &ProviderConfig) -> Result<String> {
    let env_name = cfg
        .api_key_env
        .as_deref()
        .ok_or_else(|| Error::Config(format!("provider '{}' has no api_key_env", cfg.id)))?;
    std::env::var(env_name)
        .map_err(|_| Error::Config(format!("provider '{}': env {env_name} not set", cfg.id)))
}

/// Truncate an error body for logging without splitting a UTF-8 char.
pub(crate) fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
