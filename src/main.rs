use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mcp_mesh_registry::config::{ConfigOverrides, RegistryConfig};
use mcp_mesh_registry::health::{self, HealthMonitorConfig};
use mcp_mesh_registry::http::{self, AppState};
use mcp_mesh_registry::registration::RegistrationService;
use mcp_mesh_registry::shutdown;
use mcp_mesh_registry::store::Store;
use mcp_mesh_registry::trace;

/// MCP Mesh Registry: agent registration, dependency resolution, fast
/// heartbeat and distributed trace correlation.
#[derive(Parser, Debug)]
#[command(name = "mcp-mesh-registry", version, about)]
struct Cli {
    /// Bind host, overrides HOST unless HOST is set in the environment.
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Bind port, overrides PORT unless PORT is set in the environment.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

fn init_logging(config: &RegistryConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.debug_mode)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        host: cli.host,
        port: cli.port,
    };

    let config = match RegistryConfig::resolve(overrides) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to resolve configuration: {err:#}");
            std::process::exit(1);
        }
    };

    init_logging(&config);
    tracing::info!(bind_addr = %config.bind_addr, database = %redacted_database(&config), "starting mcp-mesh-registry");

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "registry exited with error");
        std::process::exit(1);
    }
}

fn redacted_database(config: &RegistryConfig) -> String {
    // DatabaseUrl is already ENV/param-resolved; only the scheme matters here.
    config.database_url.split(':').next().unwrap_or("unknown").to_string()
}

async fn run(config: RegistryConfig) -> anyhow::Result<()> {
    let store = Store::connect(&config.database_url).await?;

    let shutdown = CancellationToken::new();

    let health_config = HealthMonitorConfig {
        check_interval: config.health_check_interval,
        unhealthy_after_secs: config.timeout_threshold.as_secs() as i64,
        eviction_after_secs: config.eviction_threshold.as_secs() as i64,
        event_retention_secs: config.event_retention.as_secs() as i64,
    };
    tokio::spawn(health::run(store.clone(), health_config, shutdown.clone()));

    let trace_status = trace::spawn(&config, shutdown.clone()).await?;

    let registration = RegistrationService::new(store);
    let bind_addr = config.bind_addr;
    let state = Arc::new(AppState { registration, config, trace_status });
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown::wait_for_signal().await;
        signal_token.cancel();
    });

    let graceful_token = shutdown.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        graceful_token.cancelled().await;
    });

    let forced_cutoff = async {
        shutdown.cancelled().await;
        tokio::time::sleep(shutdown::GRACE_PERIOD).await;
    };

    tokio::select! {
        result = server => result?,
        _ = forced_cutoff => {
            tracing::warn!("grace period elapsed with requests still in flight, forcing shutdown");
        }
    }

    Ok(())
}
