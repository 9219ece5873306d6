//! In-memory collaborators for tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    config::Settings,
    schema::{Observation, Quote},
    sink::{LogSink, LogWriteError},
    venue::{MarketResolver, QuoteFetchError, QuoteSource, ResolveError, ResolvedMarket},
};

use super::Collaborators;

/// Resolves every slug to `tok-<slug>` unless told to fail.
#[derive(Default)]
pub struct FakeResolver {
    failing: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
}

impl FakeResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, slug: &str) {
        self.failing.lock().unwrap().insert(slug.to_string());
    }

    pub fn succeed_for(&self, slug: &str) {
        self.failing.lock().unwrap().remove(slug);
    }

    pub fn calls(&self, slug: &str) -> usize {
        self.calls.lock().unwrap().get(slug).copied().unwrap_or(0)
    }

    /// Makes every resolution take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait::async_trait]
impl MarketResolver for FakeResolver {
    async fn resolve(&self, slug: &str) -> Result<ResolvedMarket, ResolveError> {
        *self.calls.lock().unwrap().entry(slug.to_string()).or_default() += 1;

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(slug) {
            return Err(ResolveError::NotFound(slug.to_string()));
        }

        Ok(ResolvedMarket {
            instrument_id: format!("tok-{slug}"),
            question: Some(format!("{slug}?")),
        })
    }
}

/// Returns a fixed quote, or an error while it holds `None`.
pub struct FakeQuotes {
    quote: Mutex<Option<Quote>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl FakeQuotes {
    pub fn returning(quote: Quote) -> Arc<Self> {
        Arc::new(Self {
            quote: Mutex::new(Some(quote)),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        let quotes = Self::returning(Quote::default());
        quotes.set(None);
        quotes
    }

    pub fn set(&self, quote: Option<Quote>) {
        *self.quote.lock().unwrap() = quote;
    }

    /// Makes every fetch take `delay` (simulates a hung request).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl QuoteSource for FakeQuotes {
    async fn fetch_quote(&self, _instrument_id: &str) -> Result<Quote, QuoteFetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let quote = *self.quote.lock().unwrap();
        quote.ok_or(QuoteFetchError::Status(503))
    }
}

/// Keeps appended observations in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Observation>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<Observation> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn count_for(&self, key: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.instrument_key == key)
            .count()
    }

    /// Distinct market keys seen so far.
    pub fn keys(&self) -> HashSet<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|o| o.instrument_key.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl LogSink for MemorySink {
    async fn append(&self, _output_dir: &Path, observation: &Observation) -> Result<(), LogWriteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LogWriteError::Io {
                path: "memory".into(),
                source: std::io::Error::other("disk full"),
            });
        }

        self.records.lock().unwrap().push(observation.clone());
        Ok(())
    }
}

pub fn collaborators(
    resolver: Arc<FakeResolver>,
    quotes: Arc<FakeQuotes>,
    sink: Arc<MemorySink>,
) -> Collaborators {
    Collaborators {
        resolver,
        quotes,
        sink,
    }
}

/// 20 ms polling, nothing touches the disk.
pub fn fast_settings() -> Arc<Settings> {
    Arc::new(Settings {
        poll_interval: Duration::from_millis(20),
        reload_interval: Duration::from_millis(50),
        output_directory: PathBuf::from("unused"),
        restart_on_settings_change: false,
    })
}

/// Polls `cond` until it holds; panics after 5 seconds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
