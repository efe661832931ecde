//! Fixtures shared by the fund unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::accounting::FeeSchedule;
use super::error::{FundError, FundResult};
use super::fund_db::NewFund;
use crate::markets::{Market, MarketAdapter, Quote, QuoteRequest, Venue};

pub fn new_fund(fund_id: u64) -> NewFund {
    NewFund {
        fund_id,
        address: format!("0xfund{fund_id:04}"),
        manager: "0xmanager".to_string(),
        name: format!("Fund {fund_id}"),
        symbol: "FUND".to_string(),
        description: None,
        fees: FeeSchedule {
            deposit_fee_bps: 100,
            perf_fee_bps: 2_000,
            early_exit_fee_bps: 500,
            liquidity_buffer_bps: 1_000,
        },
        trading_start_ts: None,
        trading_end_ts: None,
    }
}

/// Adapter answering every quote at a fixed price, or failing on demand.
pub struct FixedPriceAdapter {
    pub venue: Venue,
    pub price: u64,
    pub fail: bool,
    pub quotes: Mutex<Vec<QuoteRequest>>,
}

impl FixedPriceAdapter {
    pub fn new(venue: Venue, price: u64) -> Arc<Self> {
        Arc::new(Self {
            venue,
            price,
            fail: false,
            quotes: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(venue: Venue) -> Arc<Self> {
        Arc::new(Self {
            venue,
            price: 0,
            fail: true,
            quotes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MarketAdapter for FixedPriceAdapter {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn get_markets(&self) -> FundResult<Vec<Market>> {
        Ok(Vec::new())
    }

    async fn get_market(&self, market_id: &str) -> FundResult<Market> {
        Err(FundError::not_found(format!("market {market_id}")))
    }

    async fn get_price(&self, _market_id: &str) -> FundResult<u64> {
        Ok(self.price)
    }

    async fn get_quote(&self, request: &QuoteRequest) -> FundResult<Quote> {
        self.quotes.lock().push(request.clone());
        if self.fail {
            return Err(FundError::AdapterUnavailable("venue timed out".to_string()));
        }
        let (input_amount, output_amount) = match request.direction {
            crate::fund::trade_ledger::TradeDirection::Buy => (
                request.amount,
                crate::fund::money::usdc_to_shares(request.amount, self.price)?,
            ),
            crate::fund::trade_ledger::TradeDirection::Sell => (
                request.amount,
                crate::fund::money::shares_to_usdc(request.amount, self.price)?,
            ),
        };
        Ok(Quote {
            input_amount,
            output_amount,
            price: self.price,
            fee: 0,
            price_impact: 0,
        })
    }
}
