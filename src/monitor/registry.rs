use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use super::worker::{WorkerHandle, WorkerState};

/// Point-in-time view of one registered worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSummary {
    pub key: String,
    pub display_name: String,
    pub generation: u64,
    pub state: WorkerState,
    pub instrument_id: Option<String>,
}

impl WorkerSummary {
    fn of(handle: &WorkerHandle) -> Self {
        Self {
            key: handle.key().to_string(),
            display_name: handle.display_name().to_string(),
            generation: handle.generation(),
            state: handle.state(),
            instrument_id: handle.resolved_instrument_id(),
        }
    }
}

// ------------------------------------------------------------
// Registry
// ------------------------------------------------------------
//
// key → handle of its running (or stopping) worker.
//
// RULES:
// - At most one handle per key
// - One mutex guards the whole map; read-then-write sequences
//   (check-then-start, check-then-stop) go through a single
//   `RegistryGuard` so they are never interleaved
// - The convenience readers below take the lock only for the
//   duration of the read
//
#[derive(Default)]
pub struct Registry {
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Exclusive access for a multi-step sequence.
    pub async fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            workers: self.workers.lock().await,
        }
    }

    #[allow(dead_code)]
    pub async fn get(&self, key: &str) -> Option<WorkerSummary> {
        self.lock().await.get(key).map(WorkerSummary::of)
    }

    #[allow(dead_code)]
    pub async fn keys(&self) -> Vec<String> {
        self.lock().await.keys()
    }

    pub async fn snapshot(&self) -> Vec<WorkerSummary> {
        self.lock().await.snapshot()
    }

    #[allow(dead_code)]
    pub async fn len(&self) -> usize {
        self.lock().await.len()
    }

    #[allow(dead_code)]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub struct RegistryGuard<'a> {
    workers: MutexGuard<'a, HashMap<String, WorkerHandle>>,
}

impl RegistryGuard<'_> {
    pub fn get(&self, key: &str) -> Option<&WorkerHandle> {
        self.workers.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.workers.contains_key(key)
    }

    /// Registers `handle` under its own key.
    ///
    /// Rejects (and hands back) the handle if the key is taken.
    pub fn put(&mut self, handle: WorkerHandle) -> Result<(), WorkerHandle> {
        if self.workers.contains_key(handle.key()) {
            return Err(handle);
        }
        self.workers.insert(handle.key().to_string(), handle);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<WorkerHandle> {
        self.workers.remove(key)
    }

    /// Removes `key` only if it still belongs to `generation`.
    pub fn remove_generation(&mut self, key: &str, generation: u64) -> Option<WorkerHandle> {
        match self.workers.get(key) {
            Some(h) if h.generation() == generation => self.workers.remove(key),
            _ => None,
        }
    }

    /// Sorted keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.workers.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Keys whose task has already returned.
    pub fn finished_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .workers
            .values()
            .filter(|h| h.is_finished())
            .map(|h| h.key().to_string())
            .collect();
        keys.sort_unstable();
        keys
    }

    pub fn snapshot(&self) -> Vec<WorkerSummary> {
        let mut all: Vec<WorkerSummary> = self.workers.values().map(WorkerSummary::of).collect();
        all.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn drain(&mut self) -> Vec<WorkerHandle> {
        self.workers.drain().map(|(_, h)| h).collect()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.workers.len()
    }
}
