//! Process-local container runtime
//!
//! Simulates an engine well enough to run the control plane without Docker
//! (`runtime.kind = "memory"`). It also records call counts and accepts
//! injected faults, which the test suites rely on.

use crate::runtime::{ContainerDetails, ContainerRuntime, ContainerSummary, LaunchSpec, RuntimeError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SimContainer {
    image: String,
    labels: HashMap<String, String>,
    env: HashMap<String, String>,
    running: bool,
    ip_address: String,
}

#[derive(Default)]
struct Faults {
    fail_stop: HashSet<String>,
    fail_remove: HashSet<String>,
    missing_images: HashSet<String>,
    hang_stop: Option<Duration>,
    unavailable: bool,
}

/// In-memory container runtime
#[derive(Default)]
pub struct InMemoryRuntime {
    containers: Mutex<HashMap<String, SimContainer>>,
    faults: Mutex<Faults>,
    next_host: AtomicUsize,
    list_calls: AtomicUsize,
    inspect_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container as if a previous process incarnation had launched it
    pub fn seed(&self, image: &str, labels: HashMap<String, String>) -> String {
        let id = new_container_id();
        let container = SimContainer {
            image: image.to_string(),
            labels,
            env: HashMap::new(),
            running: true,
            ip_address: self.next_address(),
        };
        self.containers.lock().insert(id.clone(), container);
        id
    }

    /// Full ids of all containers that still exist (any status)
    pub fn container_ids(&self) -> Vec<String> {
        self.containers.lock().keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.containers.lock().contains_key(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.containers.lock().get(id).map(|c| c.running).unwrap_or(false)
    }

    /// Environment a container was launched with
    pub fn env_of(&self, id: &str) -> Option<HashMap<String, String>> {
        self.containers.lock().get(id).map(|c| c.env.clone())
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn inspect_calls(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Make every stop of `id` fail
    pub fn fail_stop_for(&self, id: &str) {
        self.faults.lock().fail_stop.insert(id.to_string());
    }

    /// Make every remove of `id` fail
    pub fn fail_remove_for(&self, id: &str) {
        self.faults.lock().fail_remove.insert(id.to_string());
    }

    /// Clear injected stop/remove failures
    pub fn heal(&self) {
        let mut faults = self.faults.lock();
        faults.fail_stop.clear();
        faults.fail_remove.clear();
        faults.hang_stop = None;
    }

    /// Reject launches of `image` as if it did not exist
    pub fn forget_image(&self, image: &str) {
        self.faults.lock().missing_images.insert(image.to_string());
    }

    /// Make stop calls block for `delay` before completing
    pub fn hang_stop(&self, delay: Duration) {
        self.faults.lock().hang_stop = Some(delay);
    }

    /// Simulate losing the engine connection
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.faults.lock().unavailable {
            return Err(RuntimeError::Engine("connection refused".to_string()));
        }
        Ok(())
    }

    fn next_address(&self) -> String {
        let n = self.next_host.fetch_add(1, Ordering::SeqCst) + 2;
        format!("10.88.{}.{}", (n / 250) % 250, n % 250 + 2)
    }
}

fn new_container_id() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let containers = self.containers.lock();
        Ok(containers
            .iter()
            .filter(|(_, c)| c.labels.contains_key(label))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                image: c.image.clone(),
                status: status_of(c).to_string(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let containers = self.containers.lock();
        let c = containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerDetails {
            id: id.to_string(),
            image: c.image.clone(),
            status: status_of(c).to_string(),
            running: c.running,
            ip_address: c.running.then(|| c.ip_address.clone()),
            labels: c.labels.clone(),
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        if self.faults.lock().missing_images.contains(image) {
            return Err(RuntimeError::Engine(format!("pull access denied for {}", image)));
        }
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        let id = new_container_id();
        let container = SimContainer {
            image: spec.image.clone(),
            labels: spec.labels.clone(),
            env: spec.env.clone(),
            running: true,
            ip_address: self.next_address(),
        };
        self.containers.lock().insert(id.clone(), container);
        debug!(container_id = %id, image = %spec.image, "Simulated container started");
        Ok(id)
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let (fail, hang) = {
            let faults = self.faults.lock();
            (faults.fail_stop.contains(id), faults.hang_stop)
        };
        if let Some(delay) = hang {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(RuntimeError::Engine(format!("cannot stop container {}", id)));
        }

        match self.containers.lock().get_mut(id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_available()?;
        if self.faults.lock().fail_remove.contains(id) {
            return Err(RuntimeError::Engine(format!("cannot remove container {}", id)));
        }

        match self.containers.lock().remove(id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }
}

fn status_of(c: &SimContainer) -> &'static str {
    if c.running {
        "running"
    } else {
        "exited"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(image: &str) -> LaunchSpec {
        let mut labels = HashMap::new();
        labels.insert("dockvision".to_string(), String::new());
        LaunchSpec {
            image: image.to_string(),
            labels,
            service_port: 8080,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_launch_stop_remove() {
        let runtime = InMemoryRuntime::new();
        let id = runtime.launch(&spec("web:1")).await.unwrap();
        assert_eq!(id.len(), 64);

        let details = runtime.inspect(&id).await.unwrap();
        assert!(details.running);
        assert!(details.ip_address.is_some());

        runtime.stop(&id).await.unwrap();
        let details = runtime.inspect(&id).await.unwrap();
        assert_eq!(details.status, "exited");
        assert_eq!(details.ip_address, None);

        runtime.remove(&id).await.unwrap();
        assert!(matches!(runtime.inspect(&id).await, Err(RuntimeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters_by_label() {
        let runtime = InMemoryRuntime::new();
        runtime.launch(&spec("web:1")).await.unwrap();
        runtime.seed("unrelated:latest", HashMap::new());

        let listed = runtime.list_labeled("dockvision").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].image, "web:1");
        assert_eq!(runtime.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let runtime = InMemoryRuntime::new();
        runtime.forget_image("ghost:latest");
        assert!(runtime.launch(&spec("ghost:latest")).await.is_err());

        let id = runtime.launch(&spec("web:1")).await.unwrap();
        runtime.fail_remove_for(&id);
        runtime.stop(&id).await.unwrap();
        assert!(runtime.remove(&id).await.is_err());

        runtime.heal();
        runtime.remove(&id).await.unwrap();

        runtime.set_unavailable(true);
        assert!(runtime.list_labeled("dockvision").await.is_err());
    }
}
