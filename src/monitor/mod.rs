/// Monitor module
///
/// This module groups all logic responsible for:
/// - Running one polling worker per tracked market
/// - Keeping the set of workers in sync with the config file
/// - Shutting every worker down in an orderly way
///
/// Layout:
/// - worker:     per-market loop (resolve → poll → log → sleep)
/// - registry:   key → worker handle, behind one mutex
/// - supervisor: start / stop delta between config and registry
/// - reload:     reconciliation loop driven by the config file
///
/// Design notes:
/// - Venue and storage specifics MUST NOT live here
/// - Workers only see the collaborator traits
pub mod registry;
pub mod reload;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
pub mod fakes;

use std::sync::Arc;

use crate::{
    sink::LogSink,
    venue::{MarketResolver, QuoteSource},
};

pub use registry::Registry;
pub use reload::Reconciler;
pub use supervisor::{ReconcileReport, Supervisor, STOP_TIMEOUT};

/// External services every worker depends on.
///
/// One instance of each is shared by all workers.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn MarketResolver>,
    pub quotes: Arc<dyn QuoteSource>,
    pub sink: Arc<dyn LogSink>,
}
