// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:     config file model, validation and change detection
// - schema:     quote and observation records
// - util:       shared helpers (time, file names)
// - venue:      market resolver / quote source traits + Polymarket client
// - sink:       per-market daily JSON log files
// - monitor:    workers, registry, supervisor, reconciliation loop
// - controller: process lifecycle (start, wait, orderly shutdown)
// - signals:    OS termination signals
//
mod config;
mod schema;
mod util;
mod venue;
mod sink;
mod monitor;
mod controller;
mod signals;
mod metrics;

// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use config::ConfigStore;
use log::{error, info};
use metrics::METRICS;
use monitor::Collaborators;
use sink::JsonFileSink;
use venue::PolymarketClient;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const DEFAULT_CONFIG_PATH: &str = "config.json";

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize logging
// - Resolve the config path
// - Hand over to the process controller
// - Exit non-zero if the service never reached a running state
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --------------------------------------------------------
    // Config path: first CLI argument, then MONITOR_CONFIG,
    // then ./config.json
    // --------------------------------------------------------
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MONITOR_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // --------------------------------------------------------
    // Start metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    tokio::spawn(async {
        loop {
            sleep(Duration::from_secs(60)).await;
            info!("[METRICS] {}", METRICS.summary());
        }
    });

    let result = controller::run(
        ConfigStore::new(config_path),
        |api| {
            let client = Arc::new(PolymarketClient::new(api)?);
            Ok(Collaborators {
                resolver: client.clone(),
                quotes: client,
                sink: Arc::new(JsonFileSink::new()),
            })
        },
        async {
            if let Err(e) = signals::wait_for_shutdown_signal().await {
                // Without a signal handler the process can only be killed.
                error!("could not install signal handlers: {}", e);
                futures_util::future::pending::<()>().await;
            }
        },
    )
    .await;

    // An error from `main` is printed once by the runtime, exit status 1.
    result.map(|_| ())
}
