//! Container runtime adapter contract
//!
//! The control plane only ever talks to the host engine through
//! [`ContainerRuntime`]. [`crate::docker::DockerRuntime`] is the production
//! implementation; [`crate::memory::InMemoryRuntime`] backs dry runs and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Errors reported by a runtime adapter
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("runtime call '{0}' timed out")]
    Timeout(&'static str),

    #[error("{0}")]
    Engine(String),
}

/// One container as reported by a listing
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    /// Full runtime identifier
    pub id: String,
    pub image: String,
    /// Lifecycle phase, e.g. "running", "exited"
    pub status: String,
    pub labels: HashMap<String, String>,
}

/// Result of inspecting one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDetails {
    pub id: String,
    pub image: String,
    pub status: String,
    pub running: bool,
    /// Internal address, absent until the engine has attached networking
    pub ip_address: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Everything needed to create and start a tagged container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub image: String,
    /// Tenant configuration, passed through untouched
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Port exposed by the container
    pub service_port: u16,
}

/// Capabilities the control plane needs from the host container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers (any status) carrying `label`
    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    /// Make `image` available locally according to the adapter's pull policy
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create and start a container, returning its full identifier
    async fn launch(&self, spec: &LaunchSpec) -> Result<String, RuntimeError>;

    /// Stop a container; stopping an already stopped container succeeds
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// Run a runtime call with an upper bound on its duration
pub async fn bounded<T, F>(limit: Duration, op: &'static str, call: F) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout(op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<(), RuntimeError> = bounded(Duration::from_secs(1), "inspect", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(RuntimeError::Timeout("inspect"))));
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let result = bounded(Duration::from_secs(1), "stop", async {
            Err::<(), _>(RuntimeError::NotFound("abc".into()))
        })
        .await;

        assert!(matches!(result, Err(RuntimeError::NotFound(id)) if id == "abc"));
    }
}
