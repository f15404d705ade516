//! Docker implementation of the container runtime adapter

use crate::config::{parse_cpu_limit, parse_memory_limit, PullPolicy, RuntimeConfig};
use crate::runtime::{ContainerDetails, ContainerRuntime, ContainerSummary, LaunchSpec, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Talks to the Docker engine over its HTTP API
pub struct DockerRuntime {
    client: Docker,
    network: Option<String>,
    pull_policy: PullPolicy,
    memory: Option<i64>,
    nano_cpus: Option<i64>,
    stop_grace: Duration,
}

impl DockerRuntime {
    /// Connect to the Docker daemon and verify it answers.
    ///
    /// Connection priority:
    /// 1. `runtime.docker_host`
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's platform defaults
    pub async fn connect(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let timeout = config.call_timeout_secs;
        let client = match config.docker_host.clone().or_else(|| std::env::var("DOCKER_HOST").ok()) {
            Some(host) => connect_to_host(&host, timeout)?,
            None => Docker::connect_with_local_defaults().map_err(|e| {
                anyhow::anyhow!(
                    "Cannot connect to Docker daemon: {}. \
                     Start dockerd or set DOCKER_HOST / runtime.docker_host.",
                    e
                )
            })?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!("Docker daemon is not responding: {}", e)
        })?;

        let memory = config.memory.as_deref().map(parse_memory_limit).transpose()?;
        let nano_cpus = config.cpus.as_deref().map(parse_cpu_limit).transpose()?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            network: config.network.clone(),
            pull_policy: config.pull_policy.clone(),
            memory,
            nano_cpus,
            stop_grace: config.stop_grace(),
        })
    }

    async fn image_present(&self, image: &str) -> bool {
        self.client.inspect_image(image).await.is_ok()
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(RuntimeError::Engine(format!(
                            "failed to pull '{}': {}",
                            image, error
                        )));
                    }
                    if let Some(status) = info.status {
                        debug!(image, status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::Engine(format!(
                        "failed to pull '{}': {}",
                        image, e
                    )))
                }
            }
        }

        info!(image, "Image pulled");
        Ok(())
    }
}

fn connect_to_host(host: &str, timeout_secs: u64) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, timeout_secs, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, timeout_secs, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

fn map_err(id: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        other => RuntimeError::Engine(other.to_string()),
    }
}

/// Choose the address to route to: the configured network if any,
/// otherwise the default bridge address, otherwise any attached network.
fn pick_address(
    default_ip: Option<&str>,
    networks: Option<&HashMap<String, EndpointSettings>>,
    preferred: Option<&str>,
) -> Option<String> {
    let non_empty = |ip: Option<&String>| ip.filter(|ip| !ip.is_empty()).cloned();

    if let (Some(name), Some(networks)) = (preferred, networks) {
        if let Some(addr) = networks.get(name).and_then(|n| non_empty(n.ip_address.as_ref())) {
            return Some(addr);
        }
    }
    if let Some(ip) = default_ip.filter(|ip| !ip.is_empty()) {
        return Some(ip.to_string());
    }
    networks.and_then(|networks| {
        let mut names: Vec<&String> = networks.keys().collect();
        names.sort();
        names
            .into_iter()
            .find_map(|name| non_empty(networks[name].ip_address.as_ref()))
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Engine(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    image: c.image.unwrap_or_default(),
                    status: c.state.unwrap_or_default(),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err(id, e))?;

        let config = info.config.unwrap_or_default();
        let state = info.state.unwrap_or_default();
        let settings = info.network_settings.unwrap_or_default();

        Ok(ContainerDetails {
            id: info.id.unwrap_or_else(|| id.to_string()),
            image: config.image.unwrap_or_default(),
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            running: state.running.unwrap_or(false),
            ip_address: pick_address(
                settings.ip_address.as_deref(),
                settings.networks.as_ref(),
                self.network.as_deref(),
            ),
            labels: config.labels.unwrap_or_default(),
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.pull_policy {
            PullPolicy::Always => self.pull(image).await,
            PullPolicy::IfNotPresent => {
                if self.image_present(image).await {
                    debug!(image, "Image exists locally, skipping pull");
                    Ok(())
                } else {
                    self.pull(image).await
                }
            }
            PullPolicy::Never => {
                if self.image_present(image).await {
                    Ok(())
                } else {
                    Err(RuntimeError::Engine(format!(
                        "image '{}' not found locally and pull_policy is 'never'",
                        image
                    )))
                }
            }
        }
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(format!("{}/tcp", spec.service_port), HashMap::new());

        let host_config = HostConfig {
            network_mode: self.network.clone(),
            memory: self.memory,
            nano_cpus: self.nano_cpus,
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, container_config)
            .await
            .map_err(|e| RuntimeError::Engine(format!("create failed: {}", e)))?;
        let container_id = response.id;

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            // Don't leave a created-but-never-started container behind
            if let Err(remove_err) = self.remove(&container_id).await {
                warn!(container_id, error = %remove_err, "Failed to remove container that did not start");
            }
            return Err(RuntimeError::Engine(format!("start failed: {}", e)));
        }

        info!(container_id, image = %spec.image, "Started container");
        Ok(container_id)
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: self.stop_grace.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                debug!(container_id = id, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(map_err(id, e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err(id, e))?;
        debug!(container_id = id, "Removed container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(ip: &str) -> EndpointSettings {
        EndpointSettings {
            ip_address: Some(ip.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_pick_address_prefers_configured_network() {
        let mut networks = HashMap::new();
        networks.insert("bridge".to_string(), endpoint("172.17.0.7"));
        networks.insert("tenants".to_string(), endpoint("10.1.0.4"));

        assert_eq!(
            pick_address(Some("172.17.0.7"), Some(&networks), Some("tenants")),
            Some("10.1.0.4".to_string())
        );
        assert_eq!(
            pick_address(Some("172.17.0.7"), Some(&networks), None),
            Some("172.17.0.7".to_string())
        );
    }

    #[test]
    fn test_pick_address_falls_back_to_any_network() {
        let mut networks = HashMap::new();
        networks.insert("custom".to_string(), endpoint("10.2.0.9"));

        assert_eq!(
            pick_address(Some(""), Some(&networks), None),
            Some("10.2.0.9".to_string())
        );
    }

    #[test]
    fn test_pick_address_empty_before_initialization() {
        let mut networks = HashMap::new();
        networks.insert("bridge".to_string(), endpoint(""));

        assert_eq!(pick_address(Some(""), Some(&networks), None), None);
        assert_eq!(pick_address(None, None, None), None);
    }

    #[test]
    fn test_connect_to_host_rejects_unknown_scheme() {
        let err = connect_to_host("ftp://docker", 5).unwrap_err().to_string();
        assert!(err.contains("Invalid docker_host format"));
    }
}
