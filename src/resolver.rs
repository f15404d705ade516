//! Routing key to backend address resolution, with a bounded-staleness cache

use crate::error::CoreError;
use crate::registry::Registry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Where the proxy fabric should forward an instance's traffic
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RouteTarget {
    /// Canonical short id of the resolved instance
    pub instance_id: String,
    pub network_address: String,
    pub service_port: u16,
}

/// Keyed by the canonical short id, whatever prefix was used to resolve it
#[derive(Debug, Clone)]
struct CacheEntry {
    target: RouteTarget,
    full_id: String,
    cached_at: Instant,
}

pub struct RoutingResolver {
    registry: Arc<Registry>,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl RoutingResolver {
    pub fn new(registry: Arc<Registry>, ttl: Duration) -> Self {
        Self {
            registry,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Resolve `id` to an address and port.
    ///
    /// A cached answer younger than the TTL is returned without touching the
    /// runtime. Otherwise the instance is looked up and inspected; only a
    /// running instance with an address and a valid port label resolves.
    pub async fn resolve(&self, id: &str) -> Result<RouteTarget, CoreError> {
        let now = Instant::now();
        // Prefixes shorter than a routing key are never served from cache
        if id.len() >= self.registry.id_length() {
            let key = self.registry.short_id(id);
            if let Some(entry) = self.cache.get(&key) {
                if entry.full_id.starts_with(id)
                    && now.saturating_duration_since(entry.cached_at) < self.ttl
                {
                    debug!(id, "Route cache hit");
                    return Ok(entry.target.clone());
                }
            }
        }

        debug!(id, "Route cache miss");
        let listed = self.registry.find_instance(id).await?;
        let instance = self.registry.inspect_instance(&listed).await?;

        let (Some(network_address), Some(service_port)) =
            (instance.network_address, instance.service_port)
        else {
            debug!(id, status = %instance.status, "Instance not routable");
            self.cache.remove(&instance.id);
            return Err(CoreError::Unresolvable(id.to_string()));
        };

        let target = RouteTarget {
            instance_id: instance.id,
            network_address,
            service_port,
        };
        self.cache.insert(
            target.instance_id.clone(),
            CacheEntry {
                target: target.clone(),
                full_id: instance.full_id,
                cached_at: Instant::now(),
            },
        );
        Ok(target)
    }

    /// Drop any cached resolution for the instance `id` refers to
    pub fn invalidate(&self, id: &str) {
        self.cache.remove(&self.registry.short_id(id));
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache
            .retain(|_, entry| now.saturating_duration_since(entry.cached_at) < self.ttl);
        before - self.cache.len()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::memory::InMemoryRuntime;
    use crate::runtime::{ContainerRuntime, LaunchSpec};

    const TTL: Duration = Duration::from_secs(300);

    fn setup() -> (Arc<InMemoryRuntime>, Arc<Registry>, RoutingResolver) {
        let runtime = Arc::new(InMemoryRuntime::new());
        let registry = Arc::new(Registry::new(runtime.clone(), &RuntimeConfig::default()));
        let resolver = RoutingResolver::new(Arc::clone(&registry), TTL);
        (runtime, registry, resolver)
    }

    async fn launch(runtime: &InMemoryRuntime, registry: &Registry, port: u16) -> String {
        let full_id = runtime
            .launch(&LaunchSpec {
                image: "web:1".to_string(),
                labels: registry.launch_labels(port),
                service_port: port,
                ..Default::default()
            })
            .await
            .unwrap();
        registry.short_id(&full_id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_within_ttl() {
        let (runtime, registry, resolver) = setup();
        let id = launch(&runtime, &registry, 8080).await;

        let first = resolver.resolve(&id).await.unwrap();
        assert_eq!(first.service_port, 8080);
        assert_eq!(runtime.inspect_calls(), 1);

        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        let second = resolver.resolve(&id).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(runtime.inspect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reinspects() {
        let (runtime, registry, resolver) = setup();
        let id = launch(&runtime, &registry, 8080).await;

        resolver.resolve(&id).await.unwrap();
        tokio::time::advance(TTL).await;
        resolver.resolve(&id).await.unwrap();

        assert_eq!(runtime.inspect_calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_id_is_unresolvable() {
        let (_, _, resolver) = setup();
        assert!(matches!(
            resolver.resolve("deadbeef0000").await,
            Err(CoreError::Unresolvable(_))
        ));
        assert_eq!(resolver.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_stopped_instance_is_unresolvable() {
        let (runtime, registry, resolver) = setup();
        let id = launch(&runtime, &registry, 8080).await;
        let full_id = registry.find_instance(&id).await.unwrap().full_id;
        runtime.stop(&full_id).await.unwrap();

        assert!(matches!(
            resolver.resolve(&id).await,
            Err(CoreError::Unresolvable(_))
        ));
    }

    #[tokio::test]
    async fn test_runtime_outage_is_not_unresolvable() {
        let (runtime, _, resolver) = setup();
        runtime.set_unavailable(true);

        assert!(matches!(
            resolver.resolve("deadbeef0000").await,
            Err(CoreError::RuntimeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_long_prefix_shares_canonical_entry() {
        let (runtime, registry, resolver) = setup();
        let id = launch(&runtime, &registry, 8080).await;
        let full_id = registry.find_instance(&id).await.unwrap().full_id;

        let target = resolver.resolve(&full_id[..20]).await.unwrap();
        assert_eq!(target.instance_id, id);
        assert_eq!(resolver.cached_len(), 1);

        resolver.resolve(&id).await.unwrap();
        assert_eq!(runtime.inspect_calls(), 1);

        resolver.invalidate(&id);
        assert_eq!(resolver.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_long_prefix_misses_cache() {
        let (runtime, registry, resolver) = setup();
        let id = launch(&runtime, &registry, 8080).await;
        resolver.resolve(&id).await.unwrap();

        // Same routing key, different tail
        let bogus = format!("{}{}", id, "z".repeat(8));
        assert!(matches!(
            resolver.resolve(&bogus).await,
            Err(CoreError::Unresolvable(_))
        ));
    }

    #[tokio::test]
    async fn test_short_prefix_bypasses_cache() {
        let (runtime, registry, resolver) = setup();
        let id = launch(&runtime, &registry, 8080).await;

        resolver.resolve(&id[..6]).await.unwrap();
        resolver.resolve(&id[..6]).await.unwrap();
        assert_eq!(runtime.inspect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_purge() {
        let (runtime, registry, resolver) = setup();
        let a = launch(&runtime, &registry, 8080).await;
        let b = launch(&runtime, &registry, 8081).await;
        resolver.resolve(&a).await.unwrap();
        resolver.resolve(&b).await.unwrap();
        assert_eq!(resolver.cached_len(), 2);

        resolver.invalidate(&a);
        assert_eq!(resolver.cached_len(), 1);

        tokio::time::advance(TTL).await;
        assert_eq!(resolver.purge_expired(), 1);
        assert_eq!(resolver.cached_len(), 0);
    }
}
