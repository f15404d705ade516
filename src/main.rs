use dockvision::config::{Config, RuntimeKind};
use dockvision::docker::DockerRuntime;
use dockvision::gateway::{Gateway, GatewaySettings, PKG_NAME, VERSION};
use dockvision::memory::InMemoryRuntime;
use dockvision::plane::ControlPlane;
use dockvision::runtime::SharedRuntime;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dockvision=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("dockvision.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let runtime: SharedRuntime = match config.runtime.kind {
        RuntimeKind::Docker => {
            let docker = DockerRuntime::connect(&config.runtime).await.map_err(|e| {
                error!(error = %e, "Container runtime unreachable at startup");
                e
            })?;
            Arc::new(docker)
        }
        RuntimeKind::Memory => {
            warn!("Using the in-memory runtime; no containers will be created");
            Arc::new(InMemoryRuntime::new())
        }
    };

    let admin_token = match config.server.admin_token.clone() {
        Some(token) => token,
        None => {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin token (set server.admin_token to pin it)");
            token
        }
    };

    let bind_ip: IpAddr = config.server.bind.parse()?;
    let bind_addr = SocketAddr::new(bind_ip, config.server.port);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let plane = ControlPlane::new(runtime, &config);
    let reaper_handle = plane.spawn_reaper(shutdown_rx.clone());

    let gateway = Gateway::new(
        bind_addr,
        Arc::clone(&plane),
        GatewaySettings::from_config(&config, admin_token),
        shutdown_rx,
    );
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Gateway error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Instances are left running; the next start reclaims them as untracked
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        let _ = reaper_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        domain = %config.server.domain,
        "Server configuration"
    );
    info!(
        kind = ?config.runtime.kind,
        label = %config.runtime.label,
        network = ?config.runtime.network,
        pull_policy = ?config.runtime.pull_policy,
        call_timeout_secs = config.runtime.call_timeout_secs,
        "Runtime settings"
    );
    info!(
        interval_secs = config.reaper.interval_secs,
        idle_timeout_secs = config.reaper.idle_timeout_secs,
        cache_ttl_secs = config.routing.cache_ttl_secs,
        "Reaper settings"
    );
}
