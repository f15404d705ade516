//! Creation and teardown of tenant instances

use crate::activity::ActivityTracker;
use crate::error::CoreError;
use crate::registry::{unavailable, Instance, Registry};
use crate::resolver::RoutingResolver;
use crate::runtime::{bounded, LaunchSpec, RuntimeError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

pub struct LifecycleManager {
    registry: Arc<Registry>,
    tracker: Arc<ActivityTracker>,
    resolver: Arc<RoutingResolver>,
    /// Held shared from container creation until the first touch; a sweep
    /// holds it exclusively while it lists and snapshots.
    launch_gate: RwLock<()>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<Registry>,
        tracker: Arc<ActivityTracker>,
        resolver: Arc<RoutingResolver>,
    ) -> Self {
        Self {
            registry,
            tracker,
            resolver,
            launch_gate: RwLock::new(()),
        }
    }

    /// Launch a tagged instance of `image` serving on `service_port`.
    ///
    /// `env` is handed to the container verbatim. Returns the short id.
    pub async fn start(
        &self,
        image: &str,
        service_port: u16,
        env: HashMap<String, String>,
    ) -> Result<String, CoreError> {
        let launch_failed = |cause: String| CoreError::LaunchFailed {
            image: image.to_string(),
            cause,
        };

        if image.trim().is_empty() {
            return Err(launch_failed("image must not be empty".to_string()));
        }
        if service_port == 0 {
            return Err(launch_failed("service port must be greater than 0".to_string()));
        }

        let runtime = self.registry.runtime();
        runtime
            .ensure_image(image)
            .await
            .map_err(|e| launch_failed(e.to_string()))?;

        let spec = LaunchSpec {
            image: image.to_string(),
            env,
            labels: self.registry.launch_labels(service_port),
            service_port,
        };

        let _gate = self.launch_gate.read().await;
        let full_id = bounded(self.registry.call_timeout(), "launch", runtime.launch(&spec))
            .await
            .map_err(|e| launch_failed(e.to_string()))?;

        let id = self.registry.short_id(&full_id);
        self.tracker.touch(&id);

        info!(id = %id, image, service_port, "Instance started");
        Ok(id)
    }

    /// Stop and remove the instance addressed by `id`.
    ///
    /// Stopping an instance that does not exist succeeds.
    pub async fn stop(&self, id: &str) -> Result<(), CoreError> {
        match self.registry.find_instance(id).await {
            Ok(instance) => self.stop_instance(&instance).await,
            Err(CoreError::Unresolvable(_)) => {
                debug!(id, "Stop requested for absent instance");
                self.forget(id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop and remove an instance already looked up from the registry
    pub async fn stop_instance(&self, instance: &Instance) -> Result<(), CoreError> {
        let runtime = self.registry.runtime();
        let limit = self.registry.call_timeout();

        match bounded(limit, "stop", runtime.stop(&instance.full_id)).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(unavailable(e)),
        }

        match bounded(limit, "remove", runtime.remove(&instance.full_id)).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => {
                // Untracked but still tagged: the next sweep picks it up again
                self.forget(&instance.id);
                warn!(id = %instance.id, error = %e, "Instance stopped but not removed");
                return Err(CoreError::TeardownIncomplete {
                    id: instance.id.clone(),
                    cause: e.to_string(),
                });
            }
        }

        self.forget(&instance.id);
        info!(id = %instance.id, image = %instance.image, "Instance stopped and removed");
        Ok(())
    }

    /// Exclude launches while held; a sweep takes this before listing
    pub async fn launch_barrier(&self) -> RwLockWriteGuard<'_, ()> {
        self.launch_gate.write().await
    }

    /// Drop all derived state held for `id`
    pub fn forget(&self, id: &str) {
        self.tracker.remove(id);
        self.resolver.invalidate(id);
    }
}
