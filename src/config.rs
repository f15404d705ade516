use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front door settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Container runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Routing resolution settings
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Idle reaper settings
    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Apex domain; tenant instances are addressed as `<id>.<domain>`
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Bearer token for administrative routes.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum accepted request body for administrative routes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            domain: default_domain(),
            admin_token: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Which container runtime backs the registry
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker engine via its HTTP API (default)
    #[default]
    Docker,
    /// Process-local simulated runtime, for dry runs
    Memory,
}

/// Image pull policy applied before launching an instance
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Runtime implementation: "docker" (default) or "memory"
    #[serde(default)]
    pub kind: RuntimeKind,

    /// Docker host URL (default: DOCKER_HOST, then common socket paths)
    pub docker_host: Option<String>,

    /// Membership label marking containers managed by this control plane
    #[serde(default = "default_label")]
    pub label: String,

    /// Docker network to attach instances to (default: bridge)
    pub network: Option<String>,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Memory limit per instance (e.g., "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit per instance (e.g., "0.5", "2")
    pub cpus: Option<String>,

    /// Length of the short instance id used as routing key
    #[serde(default = "default_id_length")]
    pub id_length: usize,

    /// Upper bound on any single runtime call, in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Seconds the engine waits between SIGTERM and SIGKILL on stop
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            docker_host: None,
            label: default_label(),
            network: None,
            pull_policy: PullPolicy::default(),
            memory: None,
            cpus: None,
            id_length: default_id_length(),
            call_timeout_secs: default_call_timeout(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

impl RuntimeConfig {
    /// Label carrying the service port chosen at launch
    pub fn port_label(&self) -> String {
        format!("{}.port", self.label)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    /// Lifetime of a cached resolution, in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Internal location prefix the proxy fabric serves redirects under
    #[serde(default = "default_redirect_prefix")]
    pub redirect_prefix: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            redirect_prefix: default_redirect_prefix(),
        }
    }
}

impl RoutingConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    /// Seconds between reconciliation sweeps
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Seconds without routed activity before an instance is reclaimed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_label() -> String {
    "dockvision".to_string()
}

fn default_id_length() -> usize {
    12 // Docker's conventional short id
}

fn default_call_timeout() -> u64 {
    20
}

fn default_stop_grace() -> u64 {
    10
}

fn default_cache_ttl() -> u64 {
    300 // 5 minutes
}

fn default_redirect_prefix() -> String {
    "/nginx/".to_string()
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    900 // 15 minutes
}

/// Parse a memory limit ("512m", "1g", "1048576") into bytes
pub fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    const UNITS: [(&str, f64); 7] = [
        ("gb", 1024.0 * 1024.0 * 1024.0),
        ("g", 1024.0 * 1024.0 * 1024.0),
        ("mb", 1024.0 * 1024.0),
        ("m", 1024.0 * 1024.0),
        ("kb", 1024.0),
        ("k", 1024.0),
        ("b", 1.0),
    ];

    let normalized = limit.trim().to_ascii_lowercase();
    let (amount, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, m)| normalized.strip_suffix(suffix).map(|n| (n, *m)))
        .unwrap_or((normalized.as_str(), 1.0));

    let amount: f64 = amount
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;
    let bytes = amount * multiplier;
    if !bytes.is_finite() || bytes < 1.0 {
        anyhow::bail!("Memory limit must be positive: {}", limit);
    }
    Ok(bytes as i64)
}

/// Parse a CPU limit (e.g., "0.5") into Docker NanoCPUs
pub fn parse_cpu_limit(cpus: &str) -> anyhow::Result<i64> {
    let cpu_count: f64 = cpus
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid CPU limit: {}", cpus))?;
    if cpu_count <= 0.0 {
        anyhow::bail!("Invalid CPU limit: {}", cpus);
    }
    Ok((cpu_count * 1_000_000_000.0) as i64)
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.domain.trim().is_empty() {
            errors.push("server.domain must not be empty".to_string());
        }
        if self.runtime.label.trim().is_empty() {
            errors.push("runtime.label must not be empty".to_string());
        }
        if !(8..=64).contains(&self.runtime.id_length) {
            errors.push(format!(
                "runtime.id_length must be between 8 and 64 (got {})",
                self.runtime.id_length
            ));
        }
        if self.reaper.interval_secs == 0 {
            errors.push("reaper.interval_secs must be greater than 0".to_string());
        }
        if self.reaper.idle_timeout_secs == 0 {
            errors.push("reaper.idle_timeout_secs must be greater than 0".to_string());
        }
        if self.routing.cache_ttl_secs == 0 {
            errors.push("routing.cache_ttl_secs must be greater than 0".to_string());
        }
        if self.runtime.call_timeout_secs == 0
            || self.runtime.call_timeout_secs >= self.reaper.interval_secs
        {
            errors.push(format!(
                "runtime.call_timeout_secs ({}) must be non-zero and shorter than reaper.interval_secs ({})",
                self.runtime.call_timeout_secs, self.reaper.interval_secs
            ));
        }
        if self.runtime.stop_grace_secs >= self.runtime.call_timeout_secs {
            errors.push(format!(
                "runtime.stop_grace_secs ({}) must be shorter than runtime.call_timeout_secs ({})",
                self.runtime.stop_grace_secs, self.runtime.call_timeout_secs
            ));
        }
        if let Some(ref memory) = self.runtime.memory {
            if let Err(e) = parse_memory_limit(memory) {
                errors.push(e.to_string());
            }
        }
        if let Some(ref cpus) = self.runtime.cpus {
            if let Err(e) = parse_cpu_limit(cpus) {
                errors.push(e.to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
