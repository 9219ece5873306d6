use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::{
    config::{DesiredSet, Settings},
    metrics::{RuntimeMetrics, METRICS},
};

use super::{
    Collaborators,
    registry::{Registry, RegistryGuard},
    worker::{JoinOutcome, StopReason, Worker, WorkerExit, WorkerHandle},
};

/// Bounded join applied to every stopped worker.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// What one `update()` / `stop_all()` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,

    /// Stopped and joined within the timeout
    pub stopped: Vec<String>,

    /// Stopped but did not finish within the timeout
    pub abandoned: Vec<String>,

    /// Already finished on their own before this pass
    pub pruned: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.abandoned.is_empty()
            && self.pruned.is_empty()
    }
}

// ------------------------------------------------------------
// Supervisor
// ------------------------------------------------------------
//
// Keeps the set of running workers equal to the enabled markets
// of the latest config snapshot.
//
// ORDERING (inside one `update`, all under the registry lock):
// 1. prune workers that already ended on their own
// 2. stop removed / disabled keys, joined with a bounded wait
// 3. start new keys and register them
//
// Stops are resolved before any start, so a key that is removed
// and re-added never has two live workers.
//
// SHUTDOWN:
// - `stop_all` drains the registry and closes the supervisor
// - a closed supervisor ignores every later `update`
//
pub struct Supervisor {
    registry: Arc<Registry>,
    deps: Collaborators,
    exits: mpsc::UnboundedSender<WorkerExit>,
    next_generation: AtomicU64,
    stop_timeout: Duration,
    closed: AtomicBool,
}

impl Supervisor {
    /// Returns the supervisor and the receiving end of worker exit
    /// reports, to be drained by the reconciliation loop.
    pub fn new(
        registry: Arc<Registry>,
        deps: Collaborators,
        stop_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerExit>) {
        let (exits, exit_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            registry,
            deps,
            exits,
            next_generation: AtomicU64::new(1),
            stop_timeout,
            closed: AtomicBool::new(false),
        };

        (supervisor, exit_rx)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reconciles running workers against `desired`.
    ///
    /// Only presence and `enabled` matter. A market whose display name
    /// changed keeps its worker. Settings changes restart workers only
    /// when `settings.restart_on_settings_change` is set.
    pub async fn update(&self, desired: &DesiredSet, settings: &Arc<Settings>) -> ReconcileReport {
        let mut reg = self.registry.lock().await;
        let mut report = ReconcileReport::default();

        if self.is_closed() {
            debug!("[SUPERVISOR] closed, ignoring update");
            return report;
        }

        // 1. prune
        for key in reg.finished_keys() {
            if let Some(handle) = reg.remove(&key) {
                let outcome = handle.join_within(self.stop_timeout).await;
                debug!("[SUPERVISOR] pruned {} ({:?})", key, outcome);
                report.pruned.push(key);
            }
        }

        // 2. stop
        let to_stop: Vec<String> = reg
            .keys()
            .into_iter()
            .filter(|key| self.must_stop(&reg, key, desired, settings))
            .collect();

        let handles: Vec<WorkerHandle> = to_stop.iter().filter_map(|k| reg.remove(k)).collect();
        self.stop_handles(handles, &mut report).await;

        // 3. start
        for market in desired.iter() {
            if reg.contains(&market.key) {
                continue;
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            info!("[SUPERVISOR] starting {} ({})", market.key, market.display_name);

            let handle = Worker::spawn(
                market.clone(),
                settings.clone(),
                self.deps.clone(),
                generation,
                Some(self.exits.clone()),
            );

            match reg.put(handle) {
                Ok(()) => report.started.push(market.key.clone()),
                Err(dup) => {
                    error!("[SUPERVISOR] {} already registered, dropping new worker", dup.key());
                    dup.request_stop();
                }
            }
        }

        report
    }

    /// Stops every registered worker and closes the supervisor.
    pub async fn stop_all(&self) -> ReconcileReport {
        let mut reg = self.registry.lock().await;
        self.closed.store(true, Ordering::SeqCst);

        let handles = reg.drain();
        info!("[SUPERVISOR] stopping {} worker(s)", handles.len());

        let mut report = ReconcileReport::default();
        self.stop_handles(handles, &mut report).await;
        report
    }

    /// Drops the registry entry of a worker that ended by itself.
    ///
    /// A newer worker registered under the same key is left alone.
    pub async fn forget(&self, exit: &WorkerExit) -> bool {
        let removed = self
            .registry
            .lock()
            .await
            .remove_generation(&exit.key, exit.generation);

        match removed {
            Some(handle) => {
                if let StopReason::Failed(reason) = &exit.reason {
                    warn!(
                        "[SUPERVISOR] {} failed to start ({}), will retry on next pass",
                        exit.key, reason
                    );
                }
                handle.join_within(self.stop_timeout).await;
                true
            }
            None => false,
        }
    }

    fn must_stop(
        &self,
        reg: &RegistryGuard<'_>,
        key: &str,
        desired: &DesiredSet,
        settings: &Settings,
    ) -> bool {
        if !desired.contains(key) {
            return true;
        }

        settings.restart_on_settings_change
            && reg
                .get(key)
                .is_some_and(|h| h.settings().worker_affecting_change(settings))
    }

    /// Signals all, then joins all concurrently with the bounded wait.
    async fn stop_handles(&self, handles: Vec<WorkerHandle>, report: &mut ReconcileReport) {
        if handles.is_empty() {
            return;
        }

        for handle in &handles {
            info!("[SUPERVISOR] stopping {}", handle.key());
            handle.request_stop();
        }

        let limit = self.stop_timeout;
        let outcomes = join_all(handles.into_iter().map(|handle| async move {
            let key = handle.key().to_string();
            (key, handle.join_within(limit).await)
        }))
        .await;

        for (key, outcome) in outcomes {
            match outcome {
                JoinOutcome::Finished(_) => report.stopped.push(key),
                JoinOutcome::Panicked(e) => {
                    error!("[SUPERVISOR] worker {} panicked: {}", key, e);
                    report.stopped.push(key);
                }
                JoinOutcome::TimedOut => {
                    warn!(
                        "[SUPERVISOR] worker {} did not stop within {:?}, abandoning it",
                        key, limit
                    );
                    RuntimeMetrics::incr(&METRICS.workers_abandoned);
                    report.abandoned.push(key);
                }
            }
        }

        report.stopped.sort_unstable();
        report.abandoned.sort_unstable();
    }
}
