use serde::{Serialize, Deserialize};

/// Best bid / ask returned by the quote source for one token.
///
/// Either side may be absent when the book is empty on that side.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quote {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

impl Quote {
    /// Midpoint, only when both sides are present.
    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }
}

// ------------------------------------------------------------
// Observation record
// ------------------------------------------------------------
//
// One line of the per-market daily log.
//
// IMPORTANT:
// - Field names on disk are kept compatible with the existing
//   log files (`market_slug`, `market_name`, `token_id`).
// - Absent prices are written as `null`, never omitted.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Observation {
    /// Local time, ISO-8601
    pub timestamp: String,

    #[serde(rename = "market_slug")]
    pub instrument_key: String,

    #[serde(rename = "market_name")]
    pub display_name: String,

    #[serde(rename = "token_id")]
    pub instrument_id: String,

    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub mid: Option<f64>,
}

impl Observation {
    pub fn new(
        timestamp: String,
        instrument_key: &str,
        display_name: &str,
        instrument_id: &str,
        quote: Quote,
    ) -> Self {
        Self {
            timestamp,
            instrument_key: instrument_key.to_string(),
            display_name: display_name.to_string(),
            instrument_id: instrument_id.to_string(),
            bid: quote.bid,
            ask: quote.ask,
            mid: quote.mid(),
        }
    }
}
