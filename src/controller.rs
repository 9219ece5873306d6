use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};
use tokio::sync::watch;

use crate::{
    config::{ApiEndpoints, ConfigStore},
    monitor::{Collaborators, Reconciler, ReconcileReport, Registry, Supervisor, STOP_TIMEOUT},
};

// ------------------------------------------------------------
// Process controller
// ------------------------------------------------------------
//
// Lifecycle:
// 1. load the config once; failure here is the only fatal error
// 2. build the collaborators from the loaded endpoints
// 3. start the reconciliation loop (which starts the workers)
// 4. wait for `shutdown` to resolve
// 5. stop the loop, then stop every worker with a bounded join
//
// Returns what the final stop-all did.
//
pub async fn run<B, S>(store: ConfigStore, build: B, shutdown: S) -> anyhow::Result<ReconcileReport>
where
    B: FnOnce(&ApiEndpoints) -> anyhow::Result<Collaborators>,
    S: Future<Output = ()>,
{
    let marker = store.current_marker();
    let snapshot = store
        .load()
        .with_context(|| format!("initial configuration load from {}", store.path().display()))?;

    let deps = build(&snapshot.api)?;

    if let Err(e) = tokio::fs::create_dir_all(&snapshot.settings.output_directory).await {
        warn!(
            "could not create output directory {}: {}",
            snapshot.settings.output_directory.display(),
            e
        );
    }

    info!("============================================================");
    info!("Market price monitor");
    info!("Markets enabled:   {}", snapshot.desired.len());
    info!("Output directory:  {}", snapshot.settings.output_directory.display());
    info!("Poll interval:     {:?}", snapshot.settings.poll_interval);
    info!("Config file:       {}", store.path().display());
    info!("Press Ctrl+C to stop");
    info!("============================================================");

    let registry = Registry::new();
    let (supervisor, exits) = Supervisor::new(registry, deps, STOP_TIMEOUT);
    let supervisor = Arc::new(supervisor);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Reconciler::new(supervisor.clone(), store, snapshot, marker, exits);
    let reload_task = tokio::spawn(reconciler.run(shutdown_rx));

    shutdown.await;
    info!("shutdown requested, stopping service...");

    // No new reconciliation pass after this point.
    let _ = shutdown_tx.send(true);
    if let Err(e) = reload_task.await {
        error!("reconciliation loop ended abnormally: {}", e);
    }

    let report = supervisor.stop_all().await;
    info!(
        "service stopped ({} worker(s) stopped, {} abandoned)",
        report.stopped.len(),
        report.abandoned.len()
    );

    Ok(report)
}
