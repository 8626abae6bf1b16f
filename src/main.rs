//! vm-route-forge - per-node VM route reconciler

mod config;

use std::sync::Arc;

use clap::Parser;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use route_forge_common::crd::{CiliumNode, VirtualMachine};
use route_forge_common::telemetry::{init_telemetry, TelemetryConfig};
use route_forge_controller::{
    new_watcher, spawn_informer, AddressCache, ControllerInputs, DriftCheck, PeriodicScanner,
    ReflectorCache, RouteController, Watcher,
};
use route_forge_netlink::{DryRun, IpCommand, IpRunner, Kernel, NetlinkManager};

use crate::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig::from_env(cli.route_table_id, cli.dry_run))
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let ranges = cli
        .ranges()
        .map_err(|e| anyhow::anyhow!("Invalid --cidr: {}", e))?;
    info!(
        ranges = %ranges,
        table = cli.route_table_id,
        watcher = %cli.watcher,
        dry_run = cli.dry_run,
        "Starting vm-route-forge"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let cancel = CancellationToken::new();
    spawn_shutdown_handler(cancel.clone());

    let (vm_store, vm_events) = spawn_informer(Api::<VirtualMachine>::all(client.clone()), cancel.clone());
    let (node_store, node_events) = spawn_informer(Api::<CiliumNode>::all(client), cancel.clone());
    let objects = Arc::new(ReflectorCache::new(vm_store, node_store));

    let ip = IpCommand::new(&cli.ip_binary);
    let runner: Arc<dyn IpRunner> = if cli.dry_run {
        warn!("Dry run: route and rule changes will only be logged");
        Arc::new(DryRun::new(ip))
    } else {
        Arc::new(ip)
    };
    let kernel = Kernel::new(runner);
    let manager = Arc::new(NetlinkManager::new(kernel.clone(), ranges.clone(), cli.route_table_id));

    let cache = Arc::new(AddressCache::new());
    let kernel = Arc::new(kernel);
    let mut drift = DriftCheck::new(cache.clone(), ranges.clone(), cli.route_table_id, kernel.clone());
    if cli.dry_run {
        // Nothing is installed, so absent routes are expected
        drift = drift.ignore_missing_routes();
    }
    let watchers: Vec<Box<dyn Watcher>> = vec![
        new_watcher(cli.watcher, drift.clone(), kernel),
        Box::new(PeriodicScanner::new(drift, cli.scan_interval())),
    ];

    let controller = RouteController::new(objects, manager, cache, ranges, cli.controller_config());
    let inputs = ControllerInputs {
        vm_events,
        node_events,
        watchers,
    };

    if let Err(e) = controller.run(inputs, cancel.clone()).await {
        error!(error = %e, "Controller failed");
        cancel.cancel();
        return Err(anyhow::anyhow!("{}", e));
    }

    info!("vm-route-forge stopped");
    Ok(())
}

/// Cancel on SIGINT or SIGTERM
fn spawn_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("Shutdown signal received");
        cancel.cancel();
    });
}
