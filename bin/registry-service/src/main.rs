//! Registry service binary.
//!
//! Wires the component crates together, starts the heartbeat sweep and
//! registration handler, and drops into the operator console until `stop`
//! or EOF.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use registry_bus::InMemoryTransport;
use registry_bus::MessageBus;
use registry_bus::MessageEnvelope;
use registry_bus::TransportAdapter;
use registry_bus::channels;
use registry_catalog::SlotCatalog;
use registry_console::Console;
use registry_core::MessageBusType;
use registry_core::RegistryConfig;
use registry_heartbeat::HeartbeatConfig;
use registry_heartbeat::HeartbeatMonitor;
use registry_identity::IdentifierAllocator;
use registry_membership::BackendRegistry;
use registry_membership::ProxyRegistry;
use registry_provisioning::ProvisioningService;
use registry_registration::RegistrationHandler;
use registry_routing::LocateService;
use registry_shutdown::ShutdownManager;

/// How long after startup the registry re-announces itself, giving nodes
/// that registered before a restart a chance to re-register (spec §6).
const REREGISTRATION_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "registry-service", about = "Centralized registry for proxies and backends")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "registry.yaml")]
    config: PathBuf,

    /// Overrides `logging.level` from the config file.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let args = Args::parse();

    let config = match RegistryConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config at {:?}: {e}", args.config);
            std::process::exit(1);
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    registry_core::logging::init(log_level);

    if let Err(e) = run(config).await {
        log::error!("fatal startup error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: RegistryConfig) -> anyhow::Result<()> {
    let transport: Arc<dyn TransportAdapter> = match config.message_bus.bus_type {
        MessageBusType::Redis => registry_bus::connect(&config.redis.url()).await,
        MessageBusType::InMemory => Arc::new(InMemoryTransport::new()),
    };
    let bus = Arc::new(MessageBus::new(transport));

    let allocator = Arc::new(IdentifierAllocator::with_recycling(config.registry.recycle_ids));
    let proxies = Arc::new(ProxyRegistry::new(bus.clone()));
    let backends = Arc::new(BackendRegistry::new(bus.clone()));
    let catalog = Arc::new(SlotCatalog::new());

    let heartbeat_config = HeartbeatConfig {
        check_interval: std::time::Duration::from_secs(config.registry.check_interval),
        timeout: std::time::Duration::from_secs(config.registry.heartbeat_timeout),
    };
    let heartbeat = HeartbeatMonitor::new(heartbeat_config, proxies.clone(), backends.clone());

    let registration = RegistrationHandler::new(bus.clone(), allocator, proxies.clone(), backends.clone(), heartbeat.clone(), catalog.clone());
    registration.start().await?;
    heartbeat.start();

    let provisioning = Arc::new(ProvisioningService::new(catalog.clone(), bus.clone()));
    let locate = LocateService::new(bus.clone());
    locate.start().await?;
    let shutdown = ShutdownManager::new(bus.clone(), proxies.clone(), backends.clone());

    log::info!("registry service started");

    let reannounce_bus = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(REREGISTRATION_GRACE).await;
        let _ = reannounce_bus
            .broadcast(channels::REREGISTRATION_REQUEST, MessageEnvelope::new("ReregistrationRequest", serde_json::json!({})))
            .await;
        log::info!("re-registration broadcast sent");
    });

    let console = Console::new(bus.clone(), proxies, backends, catalog, locate, provisioning, shutdown);
    let exit = console.run().await;
    match exit {
        registry_console::ConsoleExit::OperatorStop => log::info!("stop requested by operator"),
        registry_console::ConsoleExit::Eof => log::info!("console closed"),
    }

    heartbeat.stop();
    bus.close().await?;
    Ok(())
}
