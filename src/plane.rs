//! The operations the front door calls into

use crate::activity::ActivityTracker;
use crate::config::Config;
use crate::error::CoreError;
use crate::lifecycle::LifecycleManager;
use crate::reaper::IdleReaper;
use crate::registry::Registry;
use crate::resolver::{RouteTarget, RoutingResolver};
use crate::runtime::SharedRuntime;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Administrative view of one instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceView {
    pub id: String,
    pub image: String,
    pub status: String,
    pub service_port: Option<u16>,
    /// Absent for instances the tracker does not know (due for reclamation)
    pub last_seen: Option<DateTime<Utc>>,
}

/// Owns the registry, tracker, resolver, lifecycle manager and reaper.
///
/// All state lives here rather than in globals; it is created once at
/// start-up and shared behind an `Arc`.
pub struct ControlPlane {
    registry: Arc<Registry>,
    tracker: Arc<ActivityTracker>,
    resolver: Arc<RoutingResolver>,
    lifecycle: Arc<LifecycleManager>,
    reaper: Arc<IdleReaper>,
}

impl ControlPlane {
    pub fn new(runtime: SharedRuntime, config: &Config) -> Arc<Self> {
        let registry = Arc::new(Registry::new(runtime, &config.runtime));
        let tracker = Arc::new(ActivityTracker::new());
        let resolver = Arc::new(RoutingResolver::new(
            Arc::clone(&registry),
            config.routing.cache_ttl(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&resolver),
        ));
        let reaper = Arc::new(IdleReaper::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&resolver),
            Arc::clone(&lifecycle),
            config.reaper.interval(),
            config.reaper.idle_timeout(),
        ));

        Arc::new(Self {
            registry,
            tracker,
            resolver,
            lifecycle,
            reaper,
        })
    }

    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    pub fn reaper(&self) -> &Arc<IdleReaper> {
        &self.reaper
    }

    /// Launch an instance; returns its routing key
    pub async fn start_instance(
        &self,
        image: &str,
        service_port: u16,
        env: HashMap<String, String>,
    ) -> Result<String, CoreError> {
        self.lifecycle.start(image, service_port, env).await
    }

    pub async fn stop_instance(&self, id: &str) -> Result<(), CoreError> {
        self.lifecycle.stop(id).await
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceView>, CoreError> {
        let mut views: Vec<InstanceView> = self
            .registry
            .list_instances()
            .await?
            .into_iter()
            .map(|instance| InstanceView {
                last_seen: self.tracker.get(&instance.id).map(|r| r.last_seen_at),
                id: instance.id,
                image: instance.image,
                status: instance.status,
                service_port: instance.service_port,
            })
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(views)
    }

    /// Resolve where traffic for `id` goes and record the activity
    pub async fn route_request(&self, id: &str) -> Result<RouteTarget, CoreError> {
        let target = self.resolver.resolve(id).await?;
        self.tracker.touch(&target.instance_id);
        debug!(id, address = %target.network_address, port = target.service_port, "Routed request");
        Ok(target)
    }

    /// Administrative keep-alive for an instance that exists
    pub async fn keep_alive(&self, id: &str) -> Result<(), CoreError> {
        let instance = self.registry.find_instance(id).await?;
        self.tracker.touch(&instance.id);
        Ok(())
    }

    /// Start the idle reaper; it stops when `shutdown_rx` flips to true
    pub fn spawn_reaper(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        self.reaper.spawn(shutdown_rx)
    }
}
