use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::{
    config::{InstrumentConfig, Settings},
    metrics::{RuntimeMetrics, METRICS},
    schema::Observation,
    util,
};

use super::Collaborators;

/// Lifecycle of one worker.
///
/// `Created → Initializing → Running → Stopping → Stopped`
///
/// A stop seen before `Running` still passes through `Stopping`.
/// A failed resolution goes straight from `Initializing` to
/// `Stopped(Failed)` and never enters `Running`.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    Created,
    Initializing,
    Running,
    Stopping,
    Stopped(StopReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// Stop signal observed (or its sender was dropped)
    Requested,

    /// Market resolution failed during start-up
    Failed(String),
}

/// Sent by a worker that ends on its own.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub key: String,
    pub generation: u64,
    pub reason: StopReason,
}

/// Result of a bounded join.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Finished(StopReason),
    Panicked(String),
    TimedOut,
}

// ------------------------------------------------------------
// WorkerHandle
// ------------------------------------------------------------
//
// The supervisor's side of a running worker.
//
// It can only:
// - signal stop
// - observe state
// - wait for completion (bounded)
//
// It never drives the polling loop itself.
//
pub struct WorkerHandle {
    key: String,
    display_name: String,
    generation: u64,
    settings: Arc<Settings>,
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<WorkerState>,
    resolved: Arc<OnceLock<String>>,
    join: JoinHandle<StopReason>,

    #[cfg(test)]
    history: Arc<std::sync::Mutex<Vec<WorkerState>>>,
}

impl WorkerHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Settings the worker was started with.
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn state(&self) -> WorkerState {
        self.state_rx.borrow().clone()
    }

    pub fn resolved_instrument_id(&self) -> Option<String> {
        self.resolved.get().cloned()
    }

    /// True once the worker task has returned.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Idempotent.
    pub fn request_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Waits at most `limit` for the task to end.
    ///
    /// On timeout the task is detached, not aborted. Dropping the
    /// stop sender here still reads as a stop request on its side.
    pub async fn join_within(self, limit: Duration) -> JoinOutcome {
        match tokio::time::timeout(limit, self.join).await {
            Ok(Ok(reason)) => JoinOutcome::Finished(reason),
            Ok(Err(e)) => JoinOutcome::Panicked(e.to_string()),
            Err(_) => JoinOutcome::TimedOut,
        }
    }
}

// ------------------------------------------------------------
// Worker
// ------------------------------------------------------------
//
// Owns the polling loop of exactly one market:
//
//     resolve → (poll → log → sleep)* → stopped
//
// A failed poll or a failed write is logged and the loop goes on.
// Only a failed resolution ends the worker on its own.
//
pub struct Worker {
    market: InstrumentConfig,
    settings: Arc<Settings>,
    deps: Collaborators,
    state_tx: watch::Sender<WorkerState>,
    resolved: Arc<OnceLock<String>>,

    #[cfg(test)]
    history: Arc<std::sync::Mutex<Vec<WorkerState>>>,
}

impl Worker {
    /// Starts the worker task and returns its handle.
    ///
    /// `exits` receives a `WorkerExit` when the task ends, whatever
    /// the reason.
    pub fn spawn(
        market: InstrumentConfig,
        settings: Arc<Settings>,
        deps: Collaborators,
        generation: u64,
        exits: Option<mpsc::UnboundedSender<WorkerExit>>,
    ) -> WorkerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(WorkerState::Created);
        let resolved = Arc::new(OnceLock::new());
        #[cfg(test)]
        let history = Arc::new(std::sync::Mutex::new(vec![WorkerState::Created]));

        let key = market.key.clone();
        let display_name = market.display_name.clone();

        let worker = Worker {
            market,
            settings: settings.clone(),
            deps,
            state_tx,
            resolved: resolved.clone(),
            #[cfg(test)]
            history: history.clone(),
        };

        let join = tokio::spawn({
            let key = key.clone();

            async move {
                let reason = worker.run(stop_rx).await;

                if let Some(exits) = exits {
                    let _ = exits.send(WorkerExit {
                        key,
                        generation,
                        reason: reason.clone(),
                    });
                }

                reason
            }
        });

        RuntimeMetrics::incr(&METRICS.workers_started);

        WorkerHandle {
            key,
            display_name,
            generation,
            settings,
            stop_tx,
            state_rx,
            resolved,
            join,
            #[cfg(test)]
            history,
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) -> StopReason {
        let key = self.market.key.clone();
        self.set_state(WorkerState::Initializing);

        let market = match self.deps.resolver.resolve(&key).await {
            Ok(market) => market,
            Err(e) => {
                error!("[{}] could not resolve market: {}", key, e);
                RuntimeMetrics::incr(&METRICS.resolve_failures);

                let reason = StopReason::Failed(e.to_string());
                self.set_state(WorkerState::Stopped(reason.clone()));
                return reason;
            }
        };

        info!(
            "[{}] resolved to token {} ({})",
            key,
            market.instrument_id,
            market.question.as_deref().unwrap_or("no question"),
        );
        let _ = self.resolved.set(market.instrument_id.clone());

        if stop_requested(&stop) {
            self.set_state(WorkerState::Stopping);
            info!("[{}] stop requested before first poll", key);
            self.set_state(WorkerState::Stopped(StopReason::Requested));
            return StopReason::Requested;
        }

        self.set_state(WorkerState::Running);
        RuntimeMetrics::incr(&METRICS.workers_active);
        info!(
            "[{}] monitoring '{}' every {:?}",
            key, self.market.display_name, self.settings.poll_interval
        );

        let mut written: u64 = 0;

        loop {
            if stop_requested(&stop) {
                break;
            }

            self.poll_once(&market.instrument_id, &mut written).await;

            // The stop signal interrupts the sleep, never the I/O above.
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = stop.changed() => break,
            }
        }

        self.set_state(WorkerState::Stopping);
        RuntimeMetrics::decr(&METRICS.workers_active);
        RuntimeMetrics::incr(&METRICS.workers_stopped);
        info!("[{}] stopped ({} records written)", key, written);

        self.set_state(WorkerState::Stopped(StopReason::Requested));
        StopReason::Requested
    }

    /// One poll → log cycle. Never fails.
    async fn poll_once(&self, instrument_id: &str, written: &mut u64) {
        let key = &self.market.key;

        let quote = match self.deps.quotes.fetch_quote(instrument_id).await {
            Ok(quote) => quote,
            Err(e) => {
                RuntimeMetrics::incr(&METRICS.poll_errors);
                warn!("[{}] quote fetch failed: {}", key, e);
                return;
            }
        };
        RuntimeMetrics::incr(&METRICS.polls_ok);

        let observation = Observation::new(
            util::now_iso(),
            key,
            &self.market.display_name,
            instrument_id,
            quote,
        );

        match self
            .deps
            .sink
            .append(&self.settings.output_directory, &observation)
            .await
        {
            Ok(()) => {
                *written += 1;
                RuntimeMetrics::incr(&METRICS.observations_written);
                info!(
                    "[{}] record #{}: bid={:?} ask={:?} mid={:?}",
                    key, written, observation.bid, observation.ask, observation.mid
                );
            }
            Err(e) => {
                RuntimeMetrics::incr(&METRICS.write_errors);
                error!("[{}] observation lost: {}", key, e);
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        #[cfg(test)]
        self.history.lock().unwrap().push(state.clone());

        self.state_tx.send_replace(state);
    }
}

/// A dropped sender counts as a stop request.
fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}
