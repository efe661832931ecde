//! Response shapes. Every micro-unit amount and identifier is a decimal
//! string; basis points and timestamps stay JSON numbers.

use serde::Serialize;

use crate::fund::money::{decimal_str, signed_decimal_str};
use crate::fund::service::{
    DepositReceipt, FinalizeReceipt, FundView, ProcessedWithdrawal, TradeReceipt, WithdrawReceipt,
};
use crate::fund::{
    ActivityKind, ActivityRecord, Depositor, FundError, FundStage, OutcomeSide, Position,
    RequestStatus, Snapshot, SnapshotSource, Trade, TradeDirection, WithdrawalRequest,
};
use crate::markets::{Market, Quote, Venue};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub venues: Vec<Venue>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotDto {
    pub seq: i64,
    pub ts: i64,
    #[serde(with = "decimal_str")]
    pub nav: u64,
    #[serde(with = "decimal_str")]
    pub share_price: u64,
    #[serde(with = "decimal_str")]
    pub tvl: u64,
    #[serde(with = "decimal_str")]
    pub total_shares: u64,
    pub stage: FundStage,
    pub source: SnapshotSource,
}

impl From<Snapshot> for SnapshotDto {
    fn from(s: Snapshot) -> Self {
        Self {
            seq: s.seq,
            ts: s.ts,
            nav: s.nav,
            share_price: s.share_price,
            tvl: s.tvl,
            total_shares: s.total_shares,
            stage: s.stage,
            source: s.source,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FundDto {
    #[serde(with = "decimal_str")]
    pub fund_id: u64,
    pub address: String,
    pub manager: String,
    pub name: String,
    pub symbol: String,
    pub description: Option<String>,
    pub stage: FundStage,
    pub deposit_fee_bps: u16,
    pub perf_fee_bps: u16,
    pub early_exit_fee_bps: u16,
    pub liquidity_buffer_bps: u16,
    pub trading_start_ts: Option<i64>,
    pub trading_end_ts: Option<i64>,
    #[serde(with = "decimal_str::option")]
    pub initial_aum_usdc: Option<u64>,
    #[serde(with = "decimal_str::option")]
    pub final_balance_usdc: Option<u64>,
    #[serde(with = "decimal_str::option")]
    pub perf_fee_due_usdc: Option<u64>,
    pub perf_fee_paid: bool,
    #[serde(with = "decimal_str")]
    pub total_deposited_usdc: u64,
    #[serde(with = "decimal_str")]
    pub total_withdrawn_usdc: u64,
    pub created_at: i64,
    pub updated_at: i64,
    pub latest: SnapshotDto,
}

impl From<FundView> for FundDto {
    fn from(view: FundView) -> Self {
        let f = view.fund;
        Self {
            fund_id: f.fund_id,
            address: f.address,
            manager: f.manager,
            name: f.name,
            symbol: f.symbol,
            description: f.description,
            stage: f.stage,
            deposit_fee_bps: f.fees.deposit_fee_bps,
            perf_fee_bps: f.fees.perf_fee_bps,
            early_exit_fee_bps: f.fees.early_exit_fee_bps,
            liquidity_buffer_bps: f.fees.liquidity_buffer_bps,
            trading_start_ts: f.trading_start_ts,
            trading_end_ts: f.trading_end_ts,
            initial_aum_usdc: f.initial_aum_usdc,
            final_balance_usdc: f.final_balance_usdc,
            perf_fee_due_usdc: f.perf_fee_due_usdc,
            perf_fee_paid: f.perf_fee_paid,
            total_deposited_usdc: f.total_deposited_usdc,
            total_withdrawn_usdc: f.total_withdrawn_usdc,
            created_at: f.created_at,
            updated_at: f.updated_at,
            latest: view.latest.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FundsResponse {
    pub count: usize,
    pub funds: Vec<FundDto>,
}

#[derive(Debug, Serialize)]
pub struct DepositorDto {
    pub wallet: String,
    #[serde(with = "decimal_str")]
    pub shares: u64,
    #[serde(with = "decimal_str")]
    pub pending_withdrawal_shares: u64,
    #[serde(with = "decimal_str")]
    pub available_shares: u64,
    #[serde(with = "decimal_str")]
    pub total_deposited_usdc: u64,
    #[serde(with = "decimal_str")]
    pub total_withdrawn_usdc: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<Depositor> for DepositorDto {
    fn from(d: Depositor) -> Self {
        Self {
            available_shares: d.available_shares(),
            wallet: d.wallet,
            shares: d.shares,
            pending_withdrawal_shares: d.pending_withdrawal_shares,
            total_deposited_usdc: d.total_deposited_usdc,
            total_withdrawn_usdc: d.total_withdrawn_usdc,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DepositorsResponse {
    #[serde(with = "decimal_str")]
    pub fund_id: u64,
    pub count: usize,
    pub depositors: Vec<DepositorDto>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    #[serde(with = "decimal_str")]
    pub fund_id: u64,
    pub count: usize,
    pub snapshots: Vec<SnapshotDto>,
}

#[derive(Debug, Serialize)]
pub struct DepositResponse {
    #[serde(with = "decimal_str")]
    pub fund_id: u64,
    pub wallet: String,
    #[serde(with = "decimal_str")]
    pub amount_usdc: u64,
    #[serde(with = "decimal_str")]
    pub fee_usdc: u64,
    #[serde(with = "decimal_str")]
    pub net_usdc: u64,
    #[serde(with = "decimal_str")]
    pub shares_minted: u64,
    pub depositor: DepositorDto,
    pub snapshot: SnapshotDto,
}

impl From<DepositReceipt> for DepositResponse {
    fn from(r: DepositReceipt) -> Self {
        Self {
            fund_id: r.fund_id,
            wallet: r.wallet,
            amount_usdc: r.amount_usdc,
            fee_usdc: r.fee_usdc,
            net_usdc: r.net_usdc,
            shares_minted: r.shares_minted,
            depositor: r.depositor.into(),
            snapshot: r.snapshot.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WithdrawResponse {
    #[serde(with = "decimal_str")]
    pub fund_id: u64,
    pub wallet: String,
    #[serde(with = "decimal_str")]
    pub shares_burned: u64,
    #[serde(with = "decimal_str")]
    pub gross_usdc: u64,
    #[serde(with = "decimal_str")]
    pub exit_fee_usdc: u64,
    #[serde(with = "decimal_str")]
    pub net_usdc: u64,
    #[serde(
        with = "decimal_str::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub perf_fee_collected_usdc: Option<u64>,
    pub depositor: DepositorDto,
    pub snapshot: SnapshotDto,
}

impl From<WithdrawReceipt> for WithdrawResponse {
    fn from(r: WithdrawReceipt) -> Self {
        Self {
            fund_id: r.fund_id,
            wallet: r.wallet,
            shares_burned: r.shares_burned,
            gross_usdc: r.gross_usdc,
            exit_fee_usdc: r.exit_fee_usdc,
            net_usdc: r.net_usdc,
            perf_fee_collected_usdc: r.perf_fee_collected_usdc,
            depositor: r.depositor.into(),
            snapshot: r.snapshot.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub fund: FundDto,
    #[serde(with = "decimal_str")]
    pub profit_usdc: u64,
    #[serde(with = "decimal_str")]
    pub perf_fee_usdc: u64,
    pub released_requests: usize,
}

impl From<FinalizeReceipt> for FinalizeResponse {
    fn from(r: FinalizeReceipt) -> Self {
        Self {
            fund: FundView {
                fund: r.fund,
                latest: r.snapshot,
            }
            .into(),
            profit_usdc: r.profit_usdc,
            perf_fee_usdc: r.perf_fee_usdc,
            released_requests: r.released_requests,
        }
    }
}

/// Start/end return the fund; finalize adds the settlement figures.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StageResponse {
    Fund(FundDto),
    Finalized(FinalizeResponse),
}

#[derive(Debug, Serialize)]
pub struct WithdrawalRequestDto {
    pub id: i64,
    pub wallet: String,
    #[serde(with = "decimal_str")]
    pub shares_requested: u64,
    #[serde(with = "decimal_str")]
    pub shares_filled: u64,
    #[serde(with = "decimal_str")]
    pub remaining_shares: u64,
    #[serde(with = "decimal_str")]
    pub usdc_paid: u64,
    #[serde(with = "decimal_str")]
    pub locked_share_price: u64,
    pub status: RequestStatus,
    pub requested_at: i64,
    pub updated_at: i64,
}

impl From<WithdrawalRequest> for WithdrawalRequestDto {
    fn from(r: WithdrawalRequest) -> Self {
        Self {
            remaining_shares: r.remaining_shares(),
            id: r.id,
            wallet: r.wallet,
            shares_requested: r.shares_requested,
            shares_filled: r.shares_filled,
            usdc_paid: r.usdc_paid,
            locked_share_price: r.locked_share_price,
            status: r.status,
            requested_at: r.requested_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WithdrawalRequestsResponse {
    pub count: usize,
    pub requests: Vec<WithdrawalRequestDto>,
}

#[derive(Debug, Serialize)]
pub struct ProcessedWithdrawalResponse {
    pub request: WithdrawalRequestDto,
    #[serde(with = "decimal_str")]
    pub shares_burned: u64,
    #[serde(with = "decimal_str")]
    pub usdc_paid: u64,
    pub snapshot: SnapshotDto,
}

impl From<ProcessedWithdrawal> for ProcessedWithdrawalResponse {
    fn from(p: ProcessedWithdrawal) -> Self {
        Self {
            request: p.request.into(),
            shares_burned: p.shares_burned,
            usdc_paid: p.usdc_paid,
            snapshot: p.snapshot.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PositionDto {
    pub venue: Venue,
    pub market_id: String,
    pub side: OutcomeSide,
    #[serde(with = "decimal_str")]
    pub quantity: u64,
    #[serde(with = "decimal_str")]
    pub avg_price: u64,
    #[serde(with = "decimal_str")]
    pub current_price: u64,
    #[serde(with = "decimal_str")]
    pub market_value: u64,
    #[serde(with = "signed_decimal_str")]
    pub unrealized_pnl: i128,
    pub updated_at: i64,
}

impl TryFrom<Position> for PositionDto {
    type Error = FundError;

    fn try_from(p: Position) -> Result<Self, Self::Error> {
        Ok(Self {
            market_value: p.market_value()?,
            unrealized_pnl: p.unrealized_pnl(),
            venue: p.venue,
            market_id: p.market_id,
            side: p.side,
            quantity: p.quantity,
            avg_price: p.avg_price,
            current_price: p.current_price,
            updated_at: p.updated_at,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct PositionsResponse {
    pub count: usize,
    #[serde(with = "signed_decimal_str")]
    pub total_unrealized_pnl: i128,
    pub positions: Vec<PositionDto>,
}

impl TryFrom<Vec<Position>> for PositionsResponse {
    type Error = FundError;

    fn try_from(positions: Vec<Position>) -> Result<Self, Self::Error> {
        let total_unrealized_pnl = positions.iter().map(Position::unrealized_pnl).sum();
        let positions = positions
            .into_iter()
            .map(PositionDto::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            count: positions.len(),
            total_unrealized_pnl,
            positions,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct TradeDto {
    pub id: String,
    pub venue: Venue,
    pub market_id: String,
    pub side: OutcomeSide,
    pub direction: TradeDirection,
    #[serde(with = "decimal_str")]
    pub quantity: u64,
    #[serde(with = "decimal_str")]
    pub price: u64,
    #[serde(with = "decimal_str")]
    pub fee: u64,
    pub ts: i64,
}

impl From<Trade> for TradeDto {
    fn from(t: Trade) -> Self {
        Self {
            id: t.id,
            venue: t.venue,
            market_id: t.market_id,
            side: t.side,
            direction: t.direction,
            quantity: t.quantity,
            price: t.price,
            fee: t.fee,
            ts: t.ts,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TradesResponse {
    pub count: usize,
    pub trades: Vec<TradeDto>,
}

#[derive(Debug, Serialize)]
pub struct TradeReceiptResponse {
    pub trade: TradeDto,
    pub position: PositionDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<Quote>,
}

impl TryFrom<TradeReceipt> for TradeReceiptResponse {
    type Error = FundError;

    fn try_from(r: TradeReceipt) -> Result<Self, Self::Error> {
        Ok(Self {
            trade: r.trade.into(),
            position: r.position.try_into()?,
            quote: r.quote,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ActivityDto {
    pub id: String,
    pub ts: i64,
    pub kind: ActivityKind,
    pub wallet: Option<String>,
    #[serde(with = "decimal_str::option")]
    pub amount_usdc: Option<u64>,
    #[serde(with = "decimal_str::option")]
    pub shares: Option<u64>,
    #[serde(with = "decimal_str::option")]
    pub fee_usdc: Option<u64>,
    pub detail: Option<String>,
}

impl From<ActivityRecord> for ActivityDto {
    fn from(a: ActivityRecord) -> Self {
        Self {
            id: a.id,
            ts: a.ts,
            kind: a.kind,
            wallet: a.wallet,
            amount_usdc: a.amount_usdc,
            shares: a.shares,
            fee_usdc: a.fee_usdc,
            detail: a.detail,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub count: usize,
    pub activity: Vec<ActivityDto>,
}

#[derive(Debug, Serialize)]
pub struct MarketsResponse {
    pub venue: Venue,
    pub count: usize,
    pub markets: Vec<Market>,
}

#[derive(Debug, Serialize)]
pub struct PriceResponse {
    pub venue: Venue,
    pub market_id: String,
    #[serde(with = "decimal_str")]
    pub price: u64,
}
