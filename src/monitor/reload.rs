use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use crate::{
    config::{ConfigMarker, ConfigSnapshot, ConfigStore, DesiredSet, Settings},
    metrics::{RuntimeMetrics, METRICS},
};

use super::{
    supervisor::{ReconcileReport, Supervisor},
    worker::WorkerExit,
};

/// Reconciliation loop.
///
/// Every `reload_interval` (taken from the last good settings):
/// - config file changed → load it; on success adopt the new snapshot
/// - then reconcile against the snapshot in hand
///
/// A failed load keeps the last-known-good snapshot, so running
/// workers are never touched by a bad edit. Re-reconciling an
/// unchanged snapshot is a no-op except for restarting workers
/// that ended on their own.
///
/// Between ticks the loop also drains worker exit reports so a
/// failed start leaves the registry right away.
pub struct Reconciler {
    supervisor: Arc<Supervisor>,
    store: ConfigStore,
    desired: DesiredSet,
    settings: Arc<Settings>,
    marker: ConfigMarker,
    exits: mpsc::UnboundedReceiver<WorkerExit>,
}

impl Reconciler {
    /// `marker` must be read *before* `initial` was loaded, so an edit
    /// racing the first load is picked up on the first tick.
    pub fn new(
        supervisor: Arc<Supervisor>,
        store: ConfigStore,
        initial: ConfigSnapshot,
        marker: ConfigMarker,
        exits: mpsc::UnboundedReceiver<WorkerExit>,
    ) -> Self {
        Self {
            supervisor,
            store,
            desired: initial.desired,
            settings: Arc::new(initial.settings),
            marker,
            exits,
        }
    }

    #[allow(dead_code)]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    #[allow(dead_code)]
    pub fn desired(&self) -> &DesiredSet {
        &self.desired
    }

    /// Runs until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("[RELOAD] started, watching {}", self.store.path().display());

        let report = self.reconcile().await;
        info!("[RELOAD] {} worker(s) started", report.started.len());

        'outer: loop {
            let deadline = Instant::now() + self.settings.reload_interval;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'outer;
                        }
                    }

                    Some(exit) = self.exits.recv() => {
                        self.supervisor.forget(&exit).await;
                    }

                    _ = sleep_until(deadline) => break,
                }
            }

            self.tick().await;
        }

        info!("[RELOAD] stopped");
    }

    /// One reload + reconcile pass.
    pub async fn tick(&mut self) -> ReconcileReport {
        if self.store.has_changed_since(self.marker) {
            let marker = self.store.current_marker();

            match self.store.load() {
                Ok(snapshot) => {
                    RuntimeMetrics::incr(&METRICS.config_reloads);
                    info!(
                        "[RELOAD] config changed: {} enabled market(s) {:?}",
                        snapshot.desired.len(),
                        snapshot.desired.keys().collect::<Vec<_>>()
                    );

                    self.desired = snapshot.desired;
                    self.settings = Arc::new(snapshot.settings);
                    self.marker = marker;
                }
                Err(e) => {
                    RuntimeMetrics::incr(&METRICS.config_errors);
                    error!("[RELOAD] keeping last good config: {}", e);
                }
            }
        }

        self.reconcile().await
    }

    async fn reconcile(&self) -> ReconcileReport {
        let report = self.supervisor.update(&self.desired, &self.settings).await;

        if !report.is_noop() {
            info!(
                "[RELOAD] started={:?} stopped={:?} abandoned={:?} restarted_after_exit={:?}",
                report.started, report.stopped, report.abandoned, report.pruned
            );

            for w in self.supervisor.registry().snapshot().await {
                debug!(
                    "[RELOAD] {} gen={} state={:?} token={:?} ({})",
                    w.key, w.generation, w.state, w.instrument_id, w.display_name
                );
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::fakes::{self, FakeQuotes, FakeResolver, MemorySink};
    use crate::monitor::{Registry, STOP_TIMEOUT};
    use crate::schema::Quote;

    use std::fs;
    use std::path::Path;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn config_json(markets: &[(&str, bool)]) -> String {
        let markets: Vec<serde_json::Value> = markets
            .iter()
            .map(|(slug, enabled)| serde_json::json!({ "slug": slug, "enabled": enabled }))
            .collect();

        serde_json::json!({
            "settings": {
                "poll_interval_seconds": 1,
                "config_reload_interval_seconds": 1,
                "output_directory": "logs"
            },
            "markets": markets
        })
        .to_string()
    }

    /// Writes `contents` and pushes the mtime forward so the change
    /// is visible even on coarse-grained filesystems.
    fn rewrite(path: &Path, contents: &str, bump_secs: u64) {
        fs::write(path, contents).unwrap();
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(bump_secs))
            .unwrap();
    }

    struct Fixture {
        _dir: TempDir,
        path: std::path::PathBuf,
        reconciler: Reconciler,
        supervisor: Arc<Supervisor>,
        resolver: Arc<FakeResolver>,
        sink: Arc<MemorySink>,
    }

    fn fixture(markets: &[(&str, bool)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        rewrite(&path, &config_json(markets), 1);

        let store = ConfigStore::new(&path);
        let marker = store.current_marker();
        let mut initial = store.load().unwrap();
        // fast polling for the tests, the file only carries whole seconds
        initial.settings.poll_interval = Duration::from_millis(20);

        let sink = MemorySink::new();
        let resolver = FakeResolver::new();
        let deps = fakes::collaborators(
            resolver.clone(),
            FakeQuotes::returning(Quote { bid: Some(0.4), ask: Some(0.6) }),
            sink.clone(),
        );
        let (supervisor, exits) = Supervisor::new(Registry::new(), deps, STOP_TIMEOUT);
        let supervisor = Arc::new(supervisor);

        Fixture {
            _dir: dir,
            path,
            reconciler: Reconciler::new(supervisor.clone(), store, initial, marker, exits),
            supervisor,
            resolver,
            sink,
        }
    }

    #[tokio::test]
    async fn unchanged_file_keeps_workers() {
        let mut f = fixture(&[("a", true), ("b", false)]);

        let first = f.reconciler.tick().await;
        assert_eq!(first.started, vec!["a"]);

        let second = f.reconciler.tick().await;
        assert!(second.is_noop());
        assert_eq!(f.supervisor.registry().keys().await, vec!["a"]);

        f.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn edited_file_is_reconciled() {
        let mut f = fixture(&[("a", true), ("b", true)]);
        f.reconciler.tick().await;

        rewrite(&f.path, &config_json(&[("a", true), ("b", false), ("c", true)]), 10);
        let report = f.reconciler.tick().await;

        assert_eq!(report.stopped, vec!["b"]);
        assert_eq!(report.started, vec!["c"]);
        assert_eq!(f.supervisor.registry().keys().await, vec!["a", "c"]);
        assert_eq!(f.reconciler.settings().poll_interval, Duration::from_secs(1));

        f.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn bad_config_keeps_running_workers() {
        let mut f = fixture(&[("a", true)]);
        f.reconciler.tick().await;
        let gen_a = f.supervisor.registry().get("a").await.unwrap().generation;

        rewrite(&f.path, "{ this is not json", 10);
        let report = f.reconciler.tick().await;
        assert!(report.is_noop());
        assert_eq!(f.reconciler.desired().len(), 1);

        let seen = f.sink.count_for("a");
        fakes::wait_until(|| f.sink.count_for("a") > seen + 1).await;
        assert_eq!(f.supervisor.registry().get("a").await.unwrap().generation, gen_a);

        // duplicate slugs are rejected the same way
        rewrite(&f.path, &config_json(&[("x", true), ("x", true)]), 20);
        assert!(f.reconciler.tick().await.is_noop());
        assert_eq!(f.supervisor.registry().keys().await, vec!["a"]);

        // and a later good edit is still picked up
        rewrite(&f.path, &config_json(&[("d", true)]), 30);
        let report = f.reconciler.tick().await;
        assert_eq!(report.stopped, vec!["a"]);
        assert_eq!(report.started, vec!["d"]);

        f.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn config_without_markets_keeps_running_workers() {
        let mut f = fixture(&[("a", true)]);
        f.reconciler.tick().await;
        let gen_a = f.supervisor.registry().get("a").await.unwrap().generation;

        // misspelled key
        let edited = config_json(&[("a", true)]).replace("\"markets\"", "\"market\"");
        rewrite(&f.path, &edited, 10);

        let report = f.reconciler.tick().await;
        assert!(report.is_noop(), "{report:?}");
        assert_eq!(f.supervisor.registry().keys().await, vec!["a"]);
        assert_eq!(f.supervisor.registry().get("a").await.unwrap().generation, gen_a);

        // an explicit empty list still means "run nothing"
        rewrite(&f.path, &config_json(&[]), 20);
        let report = f.reconciler.tick().await;
        assert_eq!(report.stopped, vec!["a"]);
        assert!(f.supervisor.registry().is_empty().await);
    }

    #[tokio::test]
    async fn deleted_file_keeps_workers_until_it_returns() {
        let mut f = fixture(&[("a", true)]);
        f.reconciler.tick().await;

        fs::remove_file(&f.path).unwrap();
        assert!(f.reconciler.store.has_changed_since(f.reconciler.marker));

        assert!(f.reconciler.tick().await.is_noop());
        assert_eq!(f.supervisor.registry().keys().await, vec!["a"]);

        rewrite(&f.path, &config_json(&[("b", true)]), 10);
        let report = f.reconciler.tick().await;
        assert_eq!(report.stopped, vec!["a"]);
        assert_eq!(report.started, vec!["b"]);

        f.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn run_reconciles_until_shutdown() {
        let f = fixture(&[("a", true)]);
        let supervisor = f.supervisor.clone();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(f.reconciler.run(rx));
        fakes::wait_until(|| f.sink.count_for("a") >= 1).await;
        assert_eq!(supervisor.registry().keys().await, vec!["a"]);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        let report = supervisor.stop_all().await;
        assert_eq!(report.stopped, vec!["a"]);
    }

    #[tokio::test]
    async fn run_forgets_workers_that_fail_to_start() {
        let f = fixture(&[("a", true)]);
        f.resolver.fail_for("a");
        let supervisor = f.supervisor.clone();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(f.reconciler.run(rx));
        fakes::wait_until(|| f.resolver.calls("a") >= 1).await;

        let emptied = tokio::time::timeout(Duration::from_secs(1), async {
            while !supervisor.registry().is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(emptied.is_ok(), "failed worker was not forgotten");

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(f.sink.len(), 0);
    }
}
