//! portguardd - Captive-Portal Access Control Daemon
//!
//! Entry point: loads configuration, wires the store, enforcement
//! backend, audit sink, session manager and reconciliation loop, then
//! runs until a shutdown signal arrives.

use clap::Parser;
use portguard_access::{
    AuditCategory, AuditRecord, AuditSeverity, AuditSink, BindingRegistry, Config, DeviceRegistry,
    EnforcerMode, MemoryStore, Reconciler, RedisStore, SessionManager, Store, StoreMode,
};
use portguard_enforcer::{Enforcer, NetfilterEnforcer, SimulatorEnforcer};
use portguard_types::MacAddress;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Captive-portal access control daemon
#[derive(Parser, Debug)]
#[command(name = "portguardd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Force simulation mode regardless of configuration
    #[arg(long)]
    simulate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Run one reconciliation cycle at startup before serving
    #[arg(long, default_value_t = true)]
    resync: bool,
}

/// Initializes tracing/logging subsystem
fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Reads the MAC of the client-facing interface from sysfs, for
/// deployments that leave `gateway_mac` blank for discovery.
fn discover_gateway_mac(interface: &str) -> Option<MacAddress> {
    let path = format!("/sys/class/net/{}/address", interface);
    let raw = std::fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("--- Starting portguardd ---");

    let mut config = match &args.config {
        Some(path) => match Config::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if args.simulate {
        config.enforcer.mode = EnforcerMode::Simulation;
    }

    info!(
        mode = ?config.enforcer.mode,
        store = ?config.store.mode,
        client_if = %config.interfaces.client,
        uplink_if = %config.interfaces.uplink,
        portal = %format!("{}:{}", config.network.portal_ip, config.network.portal_port),
        "configuration loaded"
    );

    let gateway_mac = config.network.gateway_mac.or_else(|| {
        let discovered = discover_gateway_mac(&config.interfaces.client);
        match discovered {
            Some(mac) => info!(%mac, "discovered gateway MAC"),
            None => warn!(
                interface = %config.interfaces.client,
                "could not discover gateway MAC; L2 isolation will use the zero address"
            ),
        }
        discovered
    });
    let net = config.network_profile(gateway_mac.unwrap_or(MacAddress::ZERO));

    let store: Arc<dyn Store> = match config.store.mode {
        StoreMode::Memory => Arc::new(MemoryStore::new()),
        StoreMode::Redis => {
            match RedisStore::connect(&config.store.redis_host, config.store.redis_port).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!(error = %e, "failed to connect to redis store");
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    let enforcer: Arc<dyn Enforcer> = match config.enforcer.mode {
        EnforcerMode::Simulation => {
            info!("enforcement backend: simulator (no host changes)");
            Arc::new(SimulatorEnforcer::new())
        }
        EnforcerMode::Active => {
            let backend = NetfilterEnforcer::new(config.enforcer_deadline());
            if let Err(e) = backend.bootstrap().await {
                error!(error = %e, "failed to bootstrap netfilter chains");
                return ExitCode::FAILURE;
            }
            info!("enforcement backend: netfilter");
            Arc::new(backend)
        }
    };

    let (audit, pump) = AuditSink::new(config.audit.buffer);
    let pump_handle = tokio::spawn(pump.run());

    let bindings = BindingRegistry::new(
        Arc::clone(&store),
        audit.clone(),
        config.binding.rapid_rebind_threshold,
    );
    let devices = DeviceRegistry::new(Arc::clone(&store), audit.clone());
    let manager = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Arc::clone(&enforcer),
        bindings.clone(),
        devices.clone(),
        audit.clone(),
        net,
        config.session.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&manager),
        Arc::clone(&store),
        Arc::clone(&enforcer),
        bindings.clone(),
        audit.clone(),
        config.reconciliation.clone(),
    ));

    audit.emit(AuditRecord::new(
        AuditCategory::System,
        AuditSeverity::Info,
        "daemon_started",
    ));

    if args.resync {
        info!("running startup resynchronization");
        match reconciler.run_cycle().await {
            Ok(report) => info!(?report, "startup resynchronization complete"),
            Err(e) => warn!(error = %e, "startup resynchronization failed"),
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let recon_handle = Arc::clone(&reconciler).spawn(shutdown_rx);

    info!("portguardd ready; facade may bind to the control API");

    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("received SIGINT, shutting down gracefully"),
        Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
    }

    // Orderly shutdown: stop the reconciler, flush the audit sink, then
    // let the store drop. The ledger stays consistent; the next startup
    // resynchronizes.
    let _ = shutdown_tx.send(true);
    let _ = recon_handle.await;

    audit.emit(AuditRecord::new(
        AuditCategory::System,
        AuditSeverity::Info,
        "daemon_stopped",
    ));
    drop(audit);
    drop(manager);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), pump_handle).await;

    info!("portguardd shutdown complete");
    ExitCode::SUCCESS
}
