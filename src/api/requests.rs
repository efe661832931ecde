//! Typed request bodies. Each endpoint has its own shape; amounts are
//! micro-unit integers given as decimal strings (bare JSON integers are
//! accepted too). Conversion into service parameters happens here so the
//! fund core only sees well-typed values.

use serde::Deserialize;

use crate::fund::money::decimal_str;
use crate::fund::service::{CreateFund, IndexerSnapshot, TradeOrder};
use crate::fund::{FundStage, OutcomeSide, TradeDirection, TradeFill};
use crate::markets::Venue;

#[derive(Debug, Deserialize)]
pub struct CreateFundRequest {
    #[serde(with = "decimal_str")]
    pub fund_id: u64,
    pub address: String,
    pub manager: String,
    pub name: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub deposit_fee_bps: Option<u16>,
    #[serde(default)]
    pub perf_fee_bps: Option<u16>,
    #[serde(default)]
    pub early_exit_fee_bps: Option<u16>,
    #[serde(default)]
    pub liquidity_buffer_bps: Option<u16>,
    #[serde(default)]
    pub trading_start_ts: Option<i64>,
    #[serde(default)]
    pub trading_end_ts: Option<i64>,
}

impl From<CreateFundRequest> for CreateFund {
    fn from(req: CreateFundRequest) -> Self {
        CreateFund {
            fund_id: req.fund_id,
            address: req.address,
            manager: req.manager,
            name: req.name,
            symbol: req.symbol,
            description: req.description,
            deposit_fee_bps: req.deposit_fee_bps,
            perf_fee_bps: req.perf_fee_bps,
            early_exit_fee_bps: req.early_exit_fee_bps,
            liquidity_buffer_bps: req.liquidity_buffer_bps,
            trading_start_ts: req.trading_start_ts,
            trading_end_ts: req.trading_end_ts,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub wallet: String,
    #[serde(with = "decimal_str")]
    pub amount_usdc: u64,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub wallet: String,
    #[serde(with = "decimal_str")]
    pub shares: u64,
}

/// `{"action": "start_trading", "initial_aum_usdc": "..."}` and friends.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StageRequest {
    StartTrading {
        #[serde(default, with = "decimal_str::option")]
        initial_aum_usdc: Option<u64>,
    },
    EndTrading,
    Finalize {
        #[serde(default, with = "decimal_str::option")]
        final_balance_usdc: Option<u64>,
    },
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    #[serde(with = "decimal_str")]
    pub nav: u64,
    #[serde(with = "decimal_str")]
    pub share_price: u64,
    #[serde(with = "decimal_str")]
    pub tvl: u64,
    #[serde(with = "decimal_str")]
    pub total_shares: u64,
    #[serde(default)]
    pub stage: Option<FundStage>,
}

impl From<SnapshotRequest> for IndexerSnapshot {
    fn from(req: SnapshotRequest) -> Self {
        IndexerSnapshot {
            nav: req.nav,
            share_price: req.share_price,
            tvl: req.tvl,
            total_shares: req.total_shares,
            stage: req.stage,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueueWithdrawalRequest {
    pub wallet: String,
    #[serde(with = "decimal_str")]
    pub shares: u64,
}

#[derive(Debug, Deserialize)]
pub struct CancelWithdrawalRequest {
    pub wallet: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteTradeRequest {
    pub venue: Venue,
    pub market_id: String,
    pub side: OutcomeSide,
    pub direction: TradeDirection,
    #[serde(with = "decimal_str")]
    pub amount: u64,
    #[serde(default)]
    pub user_public_key: Option<String>,
}

impl From<ExecuteTradeRequest> for TradeOrder {
    fn from(req: ExecuteTradeRequest) -> Self {
        TradeOrder {
            venue: req.venue,
            market_id: req.market_id,
            side: req.side,
            direction: req.direction,
            amount: req.amount,
            user_public_key: req.user_public_key,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RecordTradeRequest {
    pub venue: Venue,
    pub market_id: String,
    pub side: OutcomeSide,
    pub direction: TradeDirection,
    #[serde(with = "decimal_str")]
    pub quantity: u64,
    #[serde(with = "decimal_str")]
    pub price: u64,
    #[serde(default, with = "decimal_str::option")]
    pub fee: Option<u64>,
}

impl From<RecordTradeRequest> for TradeFill {
    fn from(req: RecordTradeRequest) -> Self {
        TradeFill {
            venue: req.venue,
            market_id: req.market_id,
            side: req.side,
            direction: req.direction,
            quantity: req.quantity,
            price: req.price,
            fee: req.fee.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MarkPositionRequest {
    pub venue: Venue,
    pub market_id: String,
    pub side: OutcomeSide,
    #[serde(with = "decimal_str")]
    pub price: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct FundListQuery {
    pub stage: Option<FundStage>,
    pub manager: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenOnlyQuery {
    pub open_only: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub wallet: Option<String>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_requests_are_tagged() {
        let start: StageRequest =
            serde_json::from_str(r#"{"action":"start_trading","initial_aum_usdc":"5000000"}"#)
                .unwrap();
        assert!(matches!(
            start,
            StageRequest::StartTrading {
                initial_aum_usdc: Some(5_000_000)
            }
        ));

        let bare: StageRequest = serde_json::from_str(r#"{"action":"start_trading"}"#).unwrap();
        assert!(matches!(
            bare,
            StageRequest::StartTrading {
                initial_aum_usdc: None
            }
        ));

        let end: StageRequest = serde_json::from_str(r#"{"action":"end_trading"}"#).unwrap();
        assert!(matches!(end, StageRequest::EndTrading));

        assert!(serde_json::from_str::<StageRequest>(r#"{"action":"reopen"}"#).is_err());
        assert!(serde_json::from_str::<StageRequest>(r#"{"initial_aum_usdc":"1"}"#).is_err());
    }

    #[test]
    fn amounts_must_be_integer_micro_units() {
        let ok: DepositRequest =
            serde_json::from_str(r#"{"wallet":"0xa","amount_usdc":"10000000000"}"#).unwrap();
        assert_eq!(ok.amount_usdc, 10_000_000_000);

        assert!(serde_json::from_str::<DepositRequest>(r#"{"wallet":"0xa","amount_usdc":10.5}"#)
            .is_err());
        assert!(serde_json::from_str::<DepositRequest>(r#"{"wallet":"0xa","amount_usdc":"-1"}"#)
            .is_err());
        assert!(serde_json::from_str::<DepositRequest>(r#"{"amount_usdc":"1"}"#).is_err());
    }

    #[test]
    fn create_fund_requires_identity_fields() {
        let ok: CreateFundRequest = serde_json::from_str(
            r#"{"fund_id":"7","address":"0xf","manager":"0xm","name":"Alpha","perf_fee_bps":1500}"#,
        )
        .unwrap();
        let params = CreateFund::from(ok);
        assert_eq!(params.fund_id, 7);
        assert_eq!(params.perf_fee_bps, Some(1_500));
        assert_eq!(params.symbol, None);

        assert!(serde_json::from_str::<CreateFundRequest>(
            r#"{"fund_id":"7","address":"0xf","name":"Alpha"}"#
        )
        .is_err());
    }

    #[test]
    fn venues_accept_aliases() {
        let req: ExecuteTradeRequest = serde_json::from_str(
            r#"{"venue":"dflow","market_id":"m","side":"NO","direction":"SELL","amount":"1"}"#,
        )
        .unwrap();
        assert_eq!(req.venue, Venue::Solana);
        assert_eq!(req.side, OutcomeSide::No);
    }
}
