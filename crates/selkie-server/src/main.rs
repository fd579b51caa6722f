//! Selkie server binary

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use selkie_core::ServerId;
use selkie_registry::{
    FixedLeaderProvider, LeaderRegistry, MemoryRegistry, MemoryRegistryOptions, Registry,
};
use selkie_runtime::{
    DiscoveryOptions, DiscoveryType, Environment, EnvironmentOptions, NoopModuleStore,
};
use selkie_server::Server;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DiscoveryTypeArg {
    Localhost,
    Remote,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RegistryBackendArg {
    /// Single-process in-memory registry
    Memory,
    /// Leader-forwarded registry (requires --leader-addr)
    Leader,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

/// Selkie distributed virtual actor server
#[derive(Parser, Debug)]
#[command(name = "selkie-server")]
#[command(about = "Selkie distributed virtual actor server")]
#[command(version)]
struct Cli {
    /// TCP port for the HTTP server to bind
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// ID identifying this server; must be globally unique within the
    /// cluster (random when omitted)
    #[arg(long)]
    server_id: Option<String>,

    /// How the server registers itself with the discovery service
    #[arg(long, value_enum, default_value_t = DiscoveryTypeArg::Localhost)]
    discovery_type: DiscoveryTypeArg,

    /// Address advertised to peers (required with --discovery-type remote)
    #[arg(long)]
    advertise_address: Option<IpAddr>,

    /// Backend to use for the registry
    #[arg(long, value_enum, default_value_t = RegistryBackendArg::Memory)]
    registry_backend: RegistryBackendArg,

    /// Address of the leader registry service (with --registry-backend leader)
    #[arg(long)]
    leader_addr: Option<SocketAddr>,

    /// Port the local registry replica binds (with --registry-backend
    /// leader; defaults to port + 1)
    #[arg(long)]
    registry_port: Option<u16>,

    /// Log level filter (e.g. info, debug, selkie_runtime=debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text)]
    log_format: LogFormatArg,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    match cli.log_format {
        LogFormatArg::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormatArg::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    let server_id = match cli.server_id {
        Some(id) => ServerId::new(id)?,
        None => ServerId::generate(),
    };

    let registry: Arc<dyn Registry> = match cli.registry_backend {
        RegistryBackendArg::Memory => Arc::new(MemoryRegistry::new()),
        RegistryBackendArg::Leader => {
            let Some(leader_addr) = cli.leader_addr else {
                bail!("--registry-backend leader requires --leader-addr");
            };
            let registry_port = cli.registry_port.unwrap_or(cli.port + 1);
            let provider = Arc::new(FixedLeaderProvider::new(leader_addr));
            let registry = LeaderRegistry::bind(
                provider,
                SocketAddr::new("0.0.0.0".parse()?, registry_port),
                MemoryRegistryOptions::default(),
            )
            .await?;
            Arc::new(registry)
        }
    };

    let discovery_type = match cli.discovery_type {
        DiscoveryTypeArg::Localhost => DiscoveryType::LocalHost,
        DiscoveryTypeArg::Remote => DiscoveryType::Remote,
    };

    let environment = Environment::new(
        server_id.clone(),
        registry.clone(),
        Arc::new(NoopModuleStore),
        EnvironmentOptions {
            discovery: DiscoveryOptions {
                discovery_type,
                port: cli.port,
                advertise_address: cli.advertise_address,
                // Leader backends may route back through this very process;
                // don't deadlock startup on our own availability.
                allow_failed_initial_heartbeat: matches!(
                    cli.registry_backend,
                    RegistryBackendArg::Leader
                ),
            },
            ..Default::default()
        },
    )
    .await?;

    tracing::info!(server_id = %server_id, port = cli.port, "starting selkie server");

    let server = Server::new(registry, environment.clone());
    let result = server.start(cli.port).await;

    environment.close().await;
    result.map_err(Into::into)
}
