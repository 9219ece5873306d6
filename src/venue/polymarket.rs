use reqwest::Url;
use serde_json::Value;

use crate::{
    config::ApiEndpoints,
    schema::Quote,
};

use super::adapter::{
    MarketResolver, QuoteFetchError, QuoteSource, ResolveError, ResolvedMarket,
};

/// Polymarket HTTP client
///
/// Implements both collaborator traits:
/// - `MarketResolver` via the Gamma API (`/markets?slug=`)
/// - `QuoteSource` via the CLOB API (`/price?token_id=&side=`)
///
/// DESIGN PRINCIPLES:
/// - No retry logic, one call is one attempt
/// - No caching, every worker start resolves from scratch
/// - Pure protocol translation only
///
/// The inner `reqwest::Client` is connection-pooled and cheap to clone.
#[derive(Clone)]
pub struct PolymarketClient {
    http: reqwest::Client,
    gamma_url: String,
    clob_url: String,
}

impl PolymarketClient {
    pub fn new(api: &ApiEndpoints) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(api.request_timeout)
            .build()?;

        Ok(Self {
            http,
            gamma_url: api.gamma_url.trim_end_matches('/').to_string(),
            clob_url: api.clob_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetches one side of the book.
    ///
    /// `side=buy` is the best bid, `side=sell` the best ask.
    async fn fetch_side(&self, token_id: &str, side: &str) -> Result<Option<f64>, QuoteFetchError> {
        let url = Url::parse_with_params(
            &format!("{}/price", self.clob_url),
            &[("token_id", token_id), ("side", side)],
        )
        .map_err(|e| QuoteFetchError::Request(e.to_string()))?;

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| QuoteFetchError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(QuoteFetchError::Status(status.as_u16()));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| QuoteFetchError::Malformed(e.to_string()))?;

        parse_price(&body)
    }
}

#[async_trait::async_trait]
impl MarketResolver for PolymarketClient {
    async fn resolve(&self, slug: &str) -> Result<ResolvedMarket, ResolveError> {
        let url = Url::parse_with_params(&format!("{}/markets", self.gamma_url), &[("slug", slug)])
            .map_err(|e| ResolveError::Request(e.to_string()))?;

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ResolveError::Status(status.as_u16()));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ResolveError::Request(e.to_string()))?;

        parse_market(slug, &body)
    }
}

#[async_trait::async_trait]
impl QuoteSource for PolymarketClient {
    async fn fetch_quote(&self, instrument_id: &str) -> Result<Quote, QuoteFetchError> {
        let (bid, ask) = tokio::try_join!(
            self.fetch_side(instrument_id, "buy"),
            self.fetch_side(instrument_id, "sell"),
        )?;

        Ok(Quote { bid, ask })
    }
}

// ------------------------------------------------------------
// Response parsing
// ------------------------------------------------------------

/// Extracts the YES token from a Gamma `/markets` response.
///
/// The response is an array; only the first market is used.
/// `clobTokenIds` is usually a JSON-encoded string
/// (`"[\"123\", \"456\"]"`) but a plain array is accepted too.
fn parse_market(slug: &str, body: &Value) -> Result<ResolvedMarket, ResolveError> {
    let market = body
        .as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| ResolveError::NotFound(slug.to_string()))?;

    let ids = match market.get("clobTokenIds") {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s)
            .map_err(|_| ResolveError::NoToken(slug.to_string()))?,
        Some(v) => v.clone(),
        None => return Err(ResolveError::NoToken(slug.to_string())),
    };

    let instrument_id = ids
        .as_array()
        .and_then(|a| a.first())
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| ResolveError::NoToken(slug.to_string()))?;

    Ok(ResolvedMarket {
        instrument_id,
        question: market
            .get("question")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Reads `{"price": "0.42"}`.
///
/// Missing, null or empty prices mean the side is empty.
fn parse_price(body: &Value) -> Result<Option<f64>, QuoteFetchError> {
    match body.get("price") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| QuoteFetchError::Malformed(format!("price `{s}`"))),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => Err(QuoteFetchError::Malformed(format!("price {other}"))),
    }
}
