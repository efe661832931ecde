//! Market data & quotes from the two external venues.
//!
//! The fund engine consumes these through [`MarketAdapter`] only; no ledger
//! state depends on an adapter call succeeding.

pub mod client;
pub mod decimal;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};

use crate::fund::error::{FundError, FundResult};
use crate::fund::money::decimal_str;
use crate::fund::trade_ledger::{OutcomeSide, TradeDirection};

pub use client::HttpMarketAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    /// Polygon-based order book venue.
    #[serde(alias = "polymarket")]
    Polygon,
    /// Solana-based venue.
    #[serde(alias = "dflow")]
    Solana,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Polygon => "polygon",
            Venue::Solana => "solana",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "polygon" | "polymarket" => Some(Venue::Polygon),
            "solana" | "dflow" => Some(Venue::Solana),
            _ => None,
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Market {
    pub id: String,
    pub venue: Venue,
    pub title: String,
    pub active: bool,
    #[serde(with = "decimal_str::option")]
    pub yes_price: Option<u64>,
    #[serde(with = "decimal_str::option")]
    pub no_price: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub market_id: String,
    pub side: OutcomeSide,
    pub direction: TradeDirection,
    /// Micro-USDC for buys, micro-shares for sells.
    #[serde(with = "decimal_str")]
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_public_key: Option<String>,
}

/// All figures in micro-units; `price_impact` is a fraction scaled by 10^6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quote {
    #[serde(with = "decimal_str")]
    pub input_amount: u64,
    #[serde(with = "decimal_str")]
    pub output_amount: u64,
    #[serde(with = "decimal_str")]
    pub price: u64,
    #[serde(with = "decimal_str")]
    pub fee: u64,
    #[serde(with = "decimal_str")]
    pub price_impact: u64,
}

#[async_trait]
pub trait MarketAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    async fn get_markets(&self) -> FundResult<Vec<Market>>;

    async fn get_market(&self, market_id: &str) -> FundResult<Market>;

    /// Current YES price in micro-USDC.
    async fn get_price(&self, market_id: &str) -> FundResult<u64>;

    async fn get_quote(&self, request: &QuoteRequest) -> FundResult<Quote>;
}

/// One adapter per venue.
#[derive(Clone, Default)]
pub struct MarketAdapters {
    adapters: HashMap<Venue, Arc<dyn MarketAdapter>>,
}

impl MarketAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn MarketAdapter>) -> Self {
        self.adapters.insert(adapter.venue(), adapter);
        self
    }

    pub fn get(&self, venue: Venue) -> FundResult<Arc<dyn MarketAdapter>> {
        self.adapters
            .get(&venue)
            .cloned()
            .ok_or_else(|| {
                FundError::AdapterUnavailable(format!("no adapter configured for {venue}"))
            })
    }

    pub fn venues(&self) -> Vec<Venue> {
        let mut venues: Vec<Venue> = self.adapters.keys().copied().collect();
        venues.sort_by_key(|v| v.as_str());
        venues
    }
}

pub fn validate_market_id(market_id: &str) -> FundResult<&str> {
    let id = market_id.trim();
    if id.is_empty()
        || id.len() > 256
        || id.contains(['/', '?', '#'])
        || id.contains(char::is_whitespace)
    {
        return Err(FundError::validation("invalid market id"));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_aliases() {
        assert_eq!(Venue::from_str("Polymarket"), Some(Venue::Polygon));
        assert_eq!(Venue::from_str("dflow"), Some(Venue::Solana));
        assert_eq!(Venue::from_str("kalshi"), None);
        let v: Venue = serde_json::from_str("\"polymarket\"").unwrap();
        assert_eq!(v, Venue::Polygon);
    }

    #[test]
    fn market_ids_are_path_safe() {
        assert_eq!(validate_market_id(" 0xabc ").unwrap(), "0xabc");
        assert!(validate_market_id("a/b").is_err());
        assert!(validate_market_id("a b").is_err());
        assert!(validate_market_id("").is_err());
    }

    #[test]
    fn missing_adapter_is_unavailable() {
        let adapters = MarketAdapters::new();
        let err = adapters.get(Venue::Solana).err().unwrap();
        assert!(err.is_retryable());
    }
}
