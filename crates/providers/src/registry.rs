//! Provider registry: instantiated adapters, alias map, priorities, and
//! health state.
//!
//! At startup the registry reads the [`LlmConfig`], resolves API keys from
//! the environment, and instantiates the appropriate adapter for each
//! configured provider. Providers that fail to initialize are logged and
//! skipped rather than aborting startup.

use std::collections::HashMap;
use std::sync::Arc;

use aegis_domain::config::{LlmConfig, ProviderConfig, ProviderKind};
use aegis_domain::Result;
use parking_lot::RwLock;

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Entry {
    provider: Arc<dyn LlmProvider>,
    priority: u32,
}

/// Holds all instantiated providers plus the mutable alias map and the
/// health map the router consults.
pub struct ProviderRegistry {
    entries: HashMap<String, Entry>,
    aliases: RwLock<HashMap<String, String>>,
    health: RwLock<HashMap<String, bool>>,
}

impl ProviderRegistry {
    /// Build the registry from config. API keys are read eagerly.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut entries = HashMap::new();
        for pc in &config.providers {
            match build_provider(pc) {
                Ok(provider) => {
                    entries.insert(
                        pc.id.clone(),
                        Entry {
                            provider,
                            priority: pc.priority,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(provider = %pc.id, error = %e, "skipping provider that failed to initialize");
                }
            }
        }

        let health = entries.keys().map(|id| (id.clone(), true)).collect();
        Ok(Self {
            entries,
            aliases: RwLock::new(config.aliases.clone()),
            health: RwLock::new(health),
        })
    }

    /// Registry over pre-built providers (tests, embedding).
    pub fn from_providers(providers: Vec<(Arc<dyn LlmProvider>, u32)>) -> Self {
        let mut entries = HashMap::new();
        let mut health = HashMap::new();
        for (provider, priority) in providers {
            health.insert(provider.id().to_string(), true);
            entries.insert(provider.id().to_string(), Entry { provider, priority });
        }
        Self {
            entries,
            aliases: RwLock::new(HashMap::new()),
            health: RwLock::new(health),
        }
    }

    // ── Aliases ────────────────────────────────────────────────────

    /// Resolve a model alias; unknown names pass through unchanged.
    pub fn resolve_alias(&self, model: &str) -> String {
        self.aliases
            .read()
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn set_alias(&self, alias: impl Into<String>, model: impl Into<String>) {
        self.aliases.write().insert(alias.into(), model.into());
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.entries.get(id).map(|e| e.provider.clone())
    }

    /// Healthy providers serving `model`, in priority order (lower number
    /// first); ties broken by provider id for determinism.
    pub fn providers_for_model(&self, model: &str) -> Vec<Arc<dyn LlmProvider>> {
        let health = self.health.read();
        let mut matching: Vec<(&String, &Entry)> = self
            .entries
            .iter()
            .filter(|(id, entry)| {
                entry.provider.models().iter().any(|m| m == model)
                    && health.get(*id).copied().unwrap_or(true)
            })
            .collect();
        matching.sort_by(|(a_id, a), (b_id, b)| {
            a.priority.cmp(&b.priority).then_with(|| a_id.cmp(b_id))
        });
        matching.into_iter().map(|(_, e)| e.provider.clone()).collect()
    }

    /// Any healthy provider serving `model`?
    pub fn model_served(&self, model: &str) -> bool {
        !self.providers_for_model(model).is_empty()
    }

    // ── Health ─────────────────────────────────────────────────────

    pub fn set_health(&self, id: &str, healthy: bool) {
        let previous = self.health.write().insert(id.to_string(), healthy);
        if previous == Some(!healthy) {
            if healthy {
                tracing::info!(provider = %id, "provider recovered");
            } else {
                tracing::warn!(provider = %id, "provider marked unhealthy");
            }
        }
    }

    pub fn is_healthy(&self, id: &str) -> bool {
        self.health.read().get(id).copied().unwrap_or(false)
    }

    /// (provider id, healthy) snapshot for /health.
    pub fn health_snapshot(&self) -> Vec<(String, bool)> {
        let mut snapshot: Vec<(String, bool)> =
            self.health.read().iter().map(|(k, v)| (k.clone(), *v)).collect();
        snapshot.sort();
        snapshot
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn build_provider(pc: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    Ok(match pc.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_config(pc)?),
        ProviderKind::OpenaiCompat => Arc::new(OpenAiCompatProvider::from_config(pc)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    fn registry_with(providers: Vec<(Arc<dyn LlmProvider>, u32)>) -> ProviderRegistry {
        ProviderRegistry::from_providers(providers)
    }

    #[test]
    fn alias_resolution() {
        let registry = registry_with(vec![]);
        registry.set_alias("claude", "claude-sonnet-4-5-20250929");
        assert_eq!(registry.resolve_alias("claude"), "claude-sonnet-4-5-20250929");
        assert_eq!(registry.resolve_alias("gpt-x"), "gpt-x");
    }

    #[test]
    fn providers_sorted_by_priority() {
        let a = Arc::new(MockProvider::new("a", &["m"])) as Arc<dyn LlmProvider>;
        let b = Arc::new(MockProvider::new("b", &["m"])) as Arc<dyn LlmProvider>;
        let registry = registry_with(vec![(a, 2), (b, 1)]);

        let order: Vec<String> = registry
            .providers_for_model("m")
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn unhealthy_providers_skipped() {
        let a = Arc::new(MockProvider::new("a", &["m"])) as Arc<dyn LlmProvider>;
        let registry = registry_with(vec![(a, 1)]);
        assert!(registry.model_served("m"));

        registry.set_health("a", false);
        assert!(!registry.model_served("m"));
        assert!(!registry.is_healthy("a"));

        registry.set_health("a", true);
        assert!(registry.model_served("m"));
    }

    #[test]
    fn model_filter() {
        let a = Arc::new(MockProvider::new("a", &["m1", "m2"])) as Arc<dyn LlmProvider>;
        let registry = registry_with(vec![(a, 1)]);
        assert!(registry.model_served("m1"));
        assert!(!registry.model_served("m3"));
    }
}
