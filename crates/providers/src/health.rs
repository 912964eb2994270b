//! Periodic provider health probing.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::ProviderRegistry;

/// Probe every provider on `interval`; flip the registry health map on
/// transitions. An interval of zero disables probing entirely.
pub fn spawn_health_prober(
    registry: Arc<ProviderRegistry>,
    interval_ms: u64,
    shutdown: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval_ms == 0 {
        tracing::info!("provider health probing disabled");
        return None;
    }
    let interval = Duration::from_millis(interval_ms);

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            for id in registry.ids() {
                let Some(provider) = registry.get(&id) else { continue };
                let healthy = provider.is_available().await;
                registry.set_health(&id, healthy);
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use crate::traits::LlmProvider;

    #[tokio::test]
    async fn prober_flips_health() {
        let mock = Arc::new(MockProvider::new("a", &["m"]));
        let registry = Arc::new(ProviderRegistry::from_providers(vec![(
            mock.clone() as Arc<dyn LlmProvider>,
            1,
        )]));

        let shutdown = CancellationToken::new();
        let handle = spawn_health_prober(registry.clone(), 10, shutdown.clone()).unwrap();

        mock.set_available(false);
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.is_healthy("a") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("prober should mark provider unhealthy");

        mock.set_available(true);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.is_healthy("a") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("prober should mark provider healthy again");

        shutdown.cancel();
        let _ = handle.await;
    }

    #[test]
    fn zero_interval_disables() {
        let registry = Arc::new(ProviderRegistry::from_providers(vec![]));
        assert!(spawn_health_prober(registry, 0, CancellationToken::new()).is_none());
    }
}
