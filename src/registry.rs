//! Registry of live tagged instances, backed by the runtime's listing

use crate::config::RuntimeConfig;
use crate::error::CoreError;
use crate::runtime::{bounded, ContainerDetails, ContainerSummary, RuntimeError, SharedRuntime};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// One tenant container managed by the control plane
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Instance {
    /// Short id, the externally visible routing key
    pub id: String,
    /// Full runtime identifier
    #[serde(skip)]
    pub full_id: String,
    pub image: String,
    pub status: String,
    /// Internal address; only populated by an inspection
    pub network_address: Option<String>,
    /// Port recovered from the port label
    pub service_port: Option<u16>,
}

pub struct Registry {
    runtime: SharedRuntime,
    label: String,
    port_label: String,
    id_length: usize,
    call_timeout: Duration,
}

impl Registry {
    pub fn new(runtime: SharedRuntime, config: &RuntimeConfig) -> Self {
        Self {
            runtime,
            label: config.label.clone(),
            port_label: config.port_label(),
            id_length: config.id_length,
            call_timeout: config.call_timeout(),
        }
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn id_length(&self) -> usize {
        self.id_length
    }

    /// Derive the routing key from a full runtime identifier
    pub fn short_id(&self, full_id: &str) -> String {
        full_id.chars().take(self.id_length).collect()
    }

    /// Labels stamped on every launched instance: membership plus service port
    pub fn launch_labels(&self, service_port: u16) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(self.label.clone(), String::new());
        labels.insert(self.port_label.clone(), service_port.to_string());
        labels
    }

    fn service_port(&self, labels: &HashMap<String, String>) -> Option<u16> {
        labels
            .get(&self.port_label)
            .and_then(|p| p.trim().parse::<u16>().ok())
            .filter(|p| *p > 0)
    }

    fn from_summary(&self, summary: ContainerSummary) -> Instance {
        Instance {
            id: self.short_id(&summary.id),
            service_port: self.service_port(&summary.labels),
            full_id: summary.id,
            image: summary.image,
            status: summary.status,
            network_address: None,
        }
    }

    fn from_details(&self, details: ContainerDetails) -> Instance {
        Instance {
            id: self.short_id(&details.id),
            service_port: self.service_port(&details.labels),
            full_id: details.id,
            image: details.image,
            status: details.status,
            network_address: details.ip_address.filter(|ip| !ip.is_empty()),
        }
    }

    /// Every container carrying the membership label, in any status
    pub async fn list_instances(&self) -> Result<Vec<Instance>, CoreError> {
        let summaries = bounded(
            self.call_timeout,
            "list",
            self.runtime.list_labeled(&self.label),
        )
        .await
        .map_err(unavailable)?;

        Ok(summaries
            .into_iter()
            // The engine filter is authoritative, but an adapter may be lax
            .filter(|s| s.labels.contains_key(&self.label))
            .map(|s| self.from_summary(s))
            .collect())
    }

    /// Find the instance whose full identifier starts with `prefix`.
    ///
    /// An empty or ambiguous prefix resolves to nothing.
    pub async fn find_instance(&self, prefix: &str) -> Result<Instance, CoreError> {
        if prefix.is_empty() {
            return Err(CoreError::Unresolvable(prefix.to_string()));
        }

        let mut matches: Vec<Instance> = self
            .list_instances()
            .await?
            .into_iter()
            .filter(|i| i.full_id.starts_with(prefix))
            .collect();

        match matches.len() {
            0 => Err(CoreError::Unresolvable(prefix.to_string())),
            1 => Ok(matches.remove(0)),
            n => {
                warn!(prefix, matches = n, "Routing key matches several instances");
                Err(CoreError::Unresolvable(prefix.to_string()))
            }
        }
    }

    /// Re-read an instance from the runtime, including its network address
    pub async fn inspect_instance(&self, instance: &Instance) -> Result<Instance, CoreError> {
        let details = bounded(
            self.call_timeout,
            "inspect",
            self.runtime.inspect(&instance.full_id),
        )
        .await
        .map_err(|e| match e {
            RuntimeError::NotFound(_) => CoreError::Unresolvable(instance.id.clone()),
            other => unavailable(other),
        })?;

        if !details.running {
            return Ok(Instance {
                network_address: None,
                ..self.from_details(details)
            });
        }
        Ok(self.from_details(details))
    }
}

pub(crate) fn unavailable(err: RuntimeError) -> CoreError {
    CoreError::RuntimeUnavailable(err.to_string())
}
