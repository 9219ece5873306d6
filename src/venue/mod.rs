//! Venue collaborators
//!
//! This module provides:
//! - The `MarketResolver` / `QuoteSource` traits the monitor talks to
//! - The Polymarket implementation of both (Gamma + CLOB HTTP APIs)
//!
//! The rest of the application must interact exclusively through
//! the traits, never through the concrete client.

pub mod adapter;
pub mod polymarket;

pub use adapter::{MarketResolver, QuoteFetchError, QuoteSource, ResolveError, ResolvedMarket};
pub use polymarket::PolymarketClient;
