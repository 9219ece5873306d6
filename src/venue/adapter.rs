use thiserror::Error;

use crate::schema::Quote;

/// A market as returned by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMarket {
    /// Venue-specific token id the quote source understands
    pub instrument_id: String,

    /// Market question, if the venue reports one
    pub question: Option<String>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("market `{0}` not found")]
    NotFound(String),

    #[error("market `{0}` has no tradable token")]
    NoToken(String),

    #[error("resolver returned HTTP {0}")]
    Status(u16),

    #[error("resolver request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum QuoteFetchError {
    #[error("quote source returned HTTP {0}")]
    Status(u16),

    #[error("quote request failed: {0}")]
    Request(String),

    #[error("quote response malformed: {0}")]
    Malformed(String),
}

/// MarketResolver maps a human-readable slug to a stable
/// instrument identifier.
///
/// CONTRACT:
/// - Called once per worker start, never cached across restarts
/// - Must never panic; every failure is a `ResolveError`
///
/// THREAD SAFETY:
/// - Must be Send + Sync, one instance is shared by all workers
///
#[async_trait::async_trait]
pub trait MarketResolver: Send + Sync {
    async fn resolve(&self, slug: &str) -> Result<ResolvedMarket, ResolveError>;
}

/// QuoteSource returns the current best bid / ask for an instrument.
///
/// CONTRACT:
/// - One call is one attempt; retries are the worker's cadence
/// - Either side may be absent in a successful `Quote`
///
#[async_trait::async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(&self, instrument_id: &str) -> Result<Quote, QuoteFetchError>;
}
