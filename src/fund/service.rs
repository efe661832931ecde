//! Fund Service - the only writer of fund state.
//!
//! Every mutating operation:
//! 1. takes the fund's lock (one in-flight mutation per fund, funds independent)
//! 2. re-reads the fund record and latest snapshot inside a SQLite transaction
//! 3. runs the pure accounting / stage logic
//! 4. writes depositor rows, the new snapshot and an activity row, then commits
//!
//! Any error before the commit rolls the whole operation back. External quote
//! calls happen before the lock is taken.

use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::accounting::{self, Aggregates, FeeSchedule, DEFAULT_PERF_FEE_BPS};
use super::error::{FundError, FundResult};
use super::fund_db::{
    self, ActivityKind, ActivityRecord, Depositor, Fund, FundDb, NewFund, RequestStatus,
    WithdrawalRequest,
};
use super::money;
use super::snapshot_ledger::{self, Snapshot, SnapshotSource};
use super::stage::{FundStage, StageAction};
use super::trade_ledger::{self, OutcomeSide, Position, Trade, TradeDirection, TradeFill};
use crate::markets::{validate_market_id, MarketAdapters, Quote, QuoteRequest, Venue};

pub const MAX_NAME_LEN: usize = 32;
pub const MAX_SYMBOL_LEN: usize = 8;
pub const DEFAULT_SYMBOL: &str = "FUND";

/// Creation defaults for parameters the caller may omit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundDefaults {
    pub early_exit_fee_bps: u16,
    pub liquidity_buffer_bps: u16,
}

impl Default for FundDefaults {
    fn default() -> Self {
        Self {
            early_exit_fee_bps: 500,
            liquidity_buffer_bps: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateFund {
    pub fund_id: u64,
    pub address: String,
    pub manager: String,
    pub name: String,
    pub symbol: Option<String>,
    pub description: Option<String>,
    pub deposit_fee_bps: Option<u16>,
    pub perf_fee_bps: Option<u16>,
    pub early_exit_fee_bps: Option<u16>,
    pub liquidity_buffer_bps: Option<u16>,
    pub trading_start_ts: Option<i64>,
    pub trading_end_ts: Option<i64>,
}

/// Authoritative figures pushed by an external indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexerSnapshot {
    pub nav: u64,
    pub share_price: u64,
    pub tvl: u64,
    pub total_shares: u64,
    pub stage: Option<FundStage>,
}

#[derive(Debug, Clone)]
pub struct TradeOrder {
    pub venue: Venue,
    pub market_id: String,
    pub side: OutcomeSide,
    pub direction: TradeDirection,
    /// Micro-USDC to spend on a buy, micro-shares to sell.
    pub amount: u64,
    pub user_public_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FundView {
    pub fund: Fund,
    pub latest: Snapshot,
}

#[derive(Debug, Clone)]
pub struct DepositReceipt {
    pub fund_id: u64,
    pub wallet: String,
    pub amount_usdc: u64,
    pub fee_usdc: u64,
    pub net_usdc: u64,
    pub shares_minted: u64,
    pub depositor: Depositor,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone)]
pub struct WithdrawReceipt {
    pub fund_id: u64,
    pub wallet: String,
    pub shares_burned: u64,
    pub gross_usdc: u64,
    pub exit_fee_usdc: u64,
    pub net_usdc: u64,
    /// Set on the withdrawal that triggered the performance fee payout.
    pub perf_fee_collected_usdc: Option<u64>,
    pub depositor: Depositor,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone)]
pub struct FinalizeReceipt {
    pub fund: Fund,
    pub profit_usdc: u64,
    pub perf_fee_usdc: u64,
    pub released_requests: usize,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone)]
pub struct ProcessedWithdrawal {
    pub request: WithdrawalRequest,
    pub shares_burned: u64,
    pub usdc_paid: u64,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone)]
pub struct TradeReceipt {
    pub trade: Trade,
    pub position: Position,
    pub quote: Option<Quote>,
}

/// Trim, and lowercase EVM-style hex addresses. Base58 addresses are
/// case-sensitive and kept as given.
pub fn normalize_wallet(raw: &str) -> FundResult<String> {
    let wallet = raw.trim();
    if wallet.is_empty() {
        return Err(FundError::validation("wallet required"));
    }
    if wallet.len() > 128 || wallet.contains(char::is_whitespace) {
        return Err(FundError::validation("invalid wallet"));
    }
    if wallet.starts_with("0x") || wallet.starts_with("0X") {
        Ok(wallet.to_lowercase())
    } else {
        Ok(wallet.to_string())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct FundService {
    db: FundDb,
    adapters: MarketAdapters,
    defaults: FundDefaults,
    locks: Arc<parking_lot::Mutex<HashMap<u64, Arc<Mutex<()>>>>>,
}

impl FundService {
    pub fn new(db: FundDb, adapters: MarketAdapters, defaults: FundDefaults) -> Self {
        Self {
            db,
            adapters,
            defaults,
            locks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    pub fn db(&self) -> &FundDb {
        &self.db
    }

    pub fn adapters(&self) -> &MarketAdapters {
        &self.adapters
    }

    fn fund_lock(&self, fund_id: u64) -> Arc<Mutex<()>> {
        self.locks.lock().entry(fund_id).or_default().clone()
    }

    fn validate_new_fund(&self, req: CreateFund) -> FundResult<NewFund> {
        money::storable(req.fund_id).map_err(|_| {
            FundError::validation(format!("fund id {} is out of range", req.fund_id))
        })?;
        let address = normalize_wallet(&req.address)
            .map_err(|_| FundError::validation("address required"))?;
        let manager = normalize_wallet(&req.manager)
            .map_err(|_| FundError::validation("manager required"))?;

        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(FundError::validation("name required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(FundError::validation(format!(
                "name must be at most {MAX_NAME_LEN} bytes"
            )));
        }

        let symbol = req
            .symbol
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SYMBOL)
            .to_string();
        if symbol.len() > MAX_SYMBOL_LEN {
            return Err(FundError::validation(format!(
                "symbol must be at most {MAX_SYMBOL_LEN} bytes"
            )));
        }

        let fees = FeeSchedule {
            deposit_fee_bps: req.deposit_fee_bps.unwrap_or(0),
            perf_fee_bps: req.perf_fee_bps.unwrap_or(DEFAULT_PERF_FEE_BPS),
            early_exit_fee_bps: req
                .early_exit_fee_bps
                .unwrap_or(self.defaults.early_exit_fee_bps),
            liquidity_buffer_bps: req
                .liquidity_buffer_bps
                .unwrap_or(self.defaults.liquidity_buffer_bps),
        };
        fees.validate()?;

        if req.trading_start_ts.is_some_and(|ts| ts < 0)
            || req.trading_end_ts.is_some_and(|ts| ts < 0)
        {
            return Err(FundError::validation("trading timestamps must be non-negative"));
        }
        if let (Some(start), Some(end)) = (req.trading_start_ts, req.trading_end_ts) {
            if end <= start {
                return Err(FundError::validation(
                    "trading_end_ts must be after trading_start_ts",
                ));
            }
        }

        Ok(NewFund {
            fund_id: req.fund_id,
            address,
            manager,
            name,
            symbol,
            description: req
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            fees,
            trading_start_ts: req.trading_start_ts,
            trading_end_ts: req.trading_end_ts,
        })
    }

    /// New fund in `Open` with the genesis snapshot.
    pub async fn create_fund(&self, req: CreateFund) -> FundResult<FundView> {
        let new = self.validate_new_fund(req)?;
        let fund_id = new.fund_id;
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let view = self
            .db
            .write(|tx| {
                let fund = fund_db::insert_fund(tx, &new, now)?;
                let latest = snapshot_ledger::append(
                    tx,
                    fund_id,
                    Aggregates::genesis(),
                    FundStage::Open,
                    SnapshotSource::Genesis,
                    now,
                )?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::FundCreated, now)
                        .wallet(&fund.manager)
                        .detail(fund.name.clone()),
                )?;
                Ok(FundView { fund, latest })
            })
            .await?;

        info!(
            fund_id,
            address = %view.fund.address,
            manager = %view.fund.manager,
            deposit_fee_bps = view.fund.fees.deposit_fee_bps,
            perf_fee_bps = view.fund.fees.perf_fee_bps,
            "fund created"
        );
        Ok(view)
    }

    pub async fn deposit(
        &self,
        fund_id: u64,
        wallet: &str,
        amount_usdc: u64,
    ) -> FundResult<DepositReceipt> {
        let wallet = normalize_wallet(wallet)?;
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let receipt = self
            .db
            .write(|tx| {
                let mut fund = fund_db::load_fund(tx, fund_id)?;
                let current = snapshot_ledger::latest(tx, fund_id)?;
                let out = accounting::compute_deposit(
                    &fund.fees,
                    fund.stage,
                    current.aggregates(),
                    amount_usdc,
                )?;

                let mut depositor = fund_db::load_depositor(tx, fund_id, &wallet)?
                    .unwrap_or_else(|| Depositor::new(fund_id, &wallet, now));
                depositor.shares = money::checked_add(depositor.shares, out.shares_minted)?;
                depositor.total_deposited_usdc =
                    money::checked_add(depositor.total_deposited_usdc, amount_usdc)?;
                depositor.updated_at = now;
                fund_db::save_depositor(tx, &depositor)?;

                fund.total_deposited_usdc =
                    money::checked_add(fund.total_deposited_usdc, amount_usdc)?;
                fund_db::save_fund_state(tx, &fund, now)?;

                let snapshot = snapshot_ledger::append(
                    tx,
                    fund_id,
                    out.after,
                    fund.stage,
                    SnapshotSource::Deposit,
                    now,
                )?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::Deposit, now)
                        .wallet(&wallet)
                        .amount(amount_usdc)
                        .shares(out.shares_minted)
                        .fee(out.fee),
                )?;

                Ok(DepositReceipt {
                    fund_id,
                    wallet: wallet.clone(),
                    amount_usdc,
                    fee_usdc: out.fee,
                    net_usdc: out.net_amount,
                    shares_minted: out.shares_minted,
                    depositor,
                    snapshot,
                })
            })
            .await?;

        info!(
            fund_id,
            wallet = %receipt.wallet,
            amount_usdc,
            fee_usdc = receipt.fee_usdc,
            shares_minted = receipt.shares_minted,
            share_price = receipt.snapshot.share_price,
            "deposit"
        );
        Ok(receipt)
    }

    pub async fn withdraw(
        &self,
        fund_id: u64,
        wallet: &str,
        shares: u64,
    ) -> FundResult<WithdrawReceipt> {
        let wallet = normalize_wallet(wallet)?;
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let receipt = self
            .db
            .write(|tx| {
                let mut fund = fund_db::load_fund(tx, fund_id)?;
                let current = snapshot_ledger::latest(tx, fund_id)?;
                let mut depositor = fund_db::load_depositor(tx, fund_id, &wallet)?
                    .ok_or_else(|| FundError::not_found(format!("depositor {wallet}")))?;

                let out = accounting::compute_withdraw(
                    &fund.fees,
                    fund.stage,
                    current.aggregates(),
                    shares,
                    depositor.available_shares(),
                )?;

                let mut perf_fee_collected_usdc = None;
                if fund.stage == FundStage::Closed && !fund.perf_fee_paid {
                    let due = fund.perf_fee_due_usdc.unwrap_or(0);
                    fund.perf_fee_paid = true;
                    perf_fee_collected_usdc = Some(due);
                    fund_db::insert_activity(
                        tx,
                        &ActivityRecord::new(fund_id, ActivityKind::PerformanceFee, now)
                            .wallet(&fund.manager)
                            .fee(due),
                    )?;
                }

                depositor.shares -= shares;
                depositor.total_withdrawn_usdc =
                    money::checked_add(depositor.total_withdrawn_usdc, out.net_usdc)?;
                depositor.updated_at = now;
                fund_db::save_depositor(tx, &depositor)?;

                fund.total_withdrawn_usdc =
                    money::checked_add(fund.total_withdrawn_usdc, out.net_usdc)?;
                fund_db::save_fund_state(tx, &fund, now)?;

                let snapshot = snapshot_ledger::append(
                    tx,
                    fund_id,
                    out.after,
                    fund.stage,
                    SnapshotSource::Withdraw,
                    now,
                )?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::Withdraw, now)
                        .wallet(&wallet)
                        .amount(out.net_usdc)
                        .shares(shares)
                        .fee(out.exit_fee),
                )?;

                Ok(WithdrawReceipt {
                    fund_id,
                    wallet: wallet.clone(),
                    shares_burned: shares,
                    gross_usdc: out.gross_usdc,
                    exit_fee_usdc: out.exit_fee,
                    net_usdc: out.net_usdc,
                    perf_fee_collected_usdc,
                    depositor,
                    snapshot,
                })
            })
            .await?;

        info!(
            fund_id,
            wallet = %receipt.wallet,
            shares,
            net_usdc = receipt.net_usdc,
            exit_fee_usdc = receipt.exit_fee_usdc,
            stage = %receipt.snapshot.stage,
            "withdraw"
        );
        if let Some(fee) = receipt.perf_fee_collected_usdc {
            info!(fund_id, perf_fee_usdc = fee, "performance fee collected on first redemption");
        }
        Ok(receipt)
    }

    /// `Open -> Trading`. The baseline defaults to the current TVL.
    pub async fn start_trading(
        &self,
        fund_id: u64,
        initial_aum_usdc: Option<u64>,
    ) -> FundResult<FundView> {
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let view = self
            .db
            .write(|tx| {
                let mut fund = fund_db::load_fund(tx, fund_id)?;
                let next = fund.stage.transition(StageAction::StartTrading)?;
                if let Some(start) = fund.trading_start_ts {
                    if start > now / 1_000 {
                        return Err(FundError::validation("trading window has not opened"));
                    }
                }

                let current = snapshot_ledger::latest(tx, fund_id)?;
                let initial = initial_aum_usdc.unwrap_or(current.tvl);
                let from = fund.stage;
                fund.stage = next;
                fund.initial_aum_usdc = Some(initial);
                fund_db::save_fund_state(tx, &fund, now)?;

                let latest = snapshot_ledger::append(
                    tx,
                    fund_id,
                    current.aggregates(),
                    next,
                    SnapshotSource::StageChange,
                    now,
                )?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::StageChange, now)
                        .amount(initial)
                        .detail(format!("{from} -> {next}")),
                )?;
                fund.updated_at = now;
                Ok(FundView { fund, latest })
            })
            .await?;

        info!(
            fund_id,
            initial_aum_usdc = view.fund.initial_aum_usdc.unwrap_or(0),
            "trading started"
        );
        Ok(view)
    }

    /// `Trading -> Settlement`.
    pub async fn end_trading(&self, fund_id: u64) -> FundResult<FundView> {
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let view = self
            .db
            .write(|tx| {
                let mut fund = fund_db::load_fund(tx, fund_id)?;
                let next = fund.stage.transition(StageAction::EndTrading)?;
                let current = snapshot_ledger::latest(tx, fund_id)?;
                let from = fund.stage;
                fund.stage = next;
                fund_db::save_fund_state(tx, &fund, now)?;

                let latest = snapshot_ledger::append(
                    tx,
                    fund_id,
                    current.aggregates(),
                    next,
                    SnapshotSource::StageChange,
                    now,
                )?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::StageChange, now)
                        .detail(format!("{from} -> {next}")),
                )?;
                fund.updated_at = now;
                Ok(FundView { fund, latest })
            })
            .await?;

        info!(fund_id, "trading ended");
        Ok(view)
    }

    /// `Settlement -> Closed`: reserve the performance fee and fix the final
    /// share price. Open withdrawal requests are released so holders redeem
    /// directly at that price.
    pub async fn finalize(
        &self,
        fund_id: u64,
        final_balance_usdc: Option<u64>,
    ) -> FundResult<FinalizeReceipt> {
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let receipt = self
            .db
            .write(|tx| {
                let mut fund = fund_db::load_fund(tx, fund_id)?;
                let next = fund.stage.transition(StageAction::Finalize)?;

                let open_positions = trade_ledger::open_position_count(tx, fund_id)?;
                if open_positions > 0 {
                    return Err(FundError::validation(format!(
                        "close all positions before finalizing ({open_positions} open)"
                    )));
                }

                let current = snapshot_ledger::latest(tx, fund_id)?;
                let initial = fund.initial_aum_usdc.ok_or_else(|| {
                    FundError::validation("fund has no recorded initial AUM")
                })?;
                let final_balance = final_balance_usdc.unwrap_or(current.tvl);
                let out = accounting::compute_close(
                    &fund.fees,
                    current.aggregates(),
                    initial,
                    final_balance,
                )?;

                let open_requests = fund_db::list_withdrawal_requests(tx, fund_id, true)?;
                let released_requests = open_requests.len();
                for mut request in open_requests {
                    if let Some(mut depositor) =
                        fund_db::load_depositor(tx, fund_id, &request.wallet)?
                    {
                        depositor.pending_withdrawal_shares = depositor
                            .pending_withdrawal_shares
                            .saturating_sub(request.remaining_shares());
                        depositor.updated_at = now;
                        fund_db::save_depositor(tx, &depositor)?;
                    }
                    request.status = RequestStatus::Cancelled;
                    request.updated_at = now;
                    fund_db::save_withdrawal_request(tx, &request)?;
                    fund_db::insert_activity(
                        tx,
                        &ActivityRecord::new(fund_id, ActivityKind::WithdrawalCancelled, now)
                            .wallet(&request.wallet)
                            .shares(request.remaining_shares())
                            .detail(format!("request {} released at close", request.id)),
                    )?;
                }

                fund.stage = next;
                fund.final_balance_usdc = Some(final_balance);
                fund.perf_fee_due_usdc = Some(out.perf_fee);
                fund_db::save_fund_state(tx, &fund, now)?;

                let snapshot = snapshot_ledger::append(
                    tx,
                    fund_id,
                    out.after,
                    next,
                    SnapshotSource::Close,
                    now,
                )?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::StageChange, now)
                        .amount(final_balance)
                        .fee(out.perf_fee)
                        .detail(format!("settlement -> closed, profit {}", out.profit)),
                )?;
                fund.updated_at = now;

                Ok(FinalizeReceipt {
                    fund,
                    profit_usdc: out.profit,
                    perf_fee_usdc: out.perf_fee,
                    released_requests,
                    snapshot,
                })
            })
            .await?;

        info!(
            fund_id,
            profit_usdc = receipt.profit_usdc,
            perf_fee_usdc = receipt.perf_fee_usdc,
            final_share_price = receipt.snapshot.share_price,
            released_requests = receipt.released_requests,
            "fund finalized"
        );
        Ok(receipt)
    }

    /// Explicit manager payout of the reserved performance fee.
    pub async fn collect_performance_fee(&self, fund_id: u64) -> FundResult<Fund> {
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let fund = self
            .db
            .write(|tx| {
                let mut fund = fund_db::load_fund(tx, fund_id)?;
                if fund.stage != FundStage::Closed {
                    return Err(FundError::InvalidStage {
                        stage: fund.stage,
                        operation: "collect performance fee",
                    });
                }
                if fund.perf_fee_paid {
                    return Err(FundError::validation("performance fee already collected"));
                }
                fund.perf_fee_paid = true;
                fund_db::save_fund_state(tx, &fund, now)?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::PerformanceFee, now)
                        .wallet(&fund.manager)
                        .fee(fund.perf_fee_due_usdc.unwrap_or(0)),
                )?;
                fund.updated_at = now;
                Ok(fund)
            })
            .await?;

        info!(
            fund_id,
            perf_fee_usdc = fund.perf_fee_due_usdc.unwrap_or(0),
            "performance fee collected"
        );
        Ok(fund)
    }

    /// Append an externally computed snapshot. It must agree with the share
    /// ledger on `total_shares` and with the fund on stage.
    pub async fn push_snapshot(
        &self,
        fund_id: u64,
        pushed: IndexerSnapshot,
    ) -> FundResult<Snapshot> {
        if pushed.share_price == 0 {
            return Err(FundError::validation("share_price must be greater than zero"));
        }
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let snapshot = self
            .db
            .write(|tx| {
                let fund = fund_db::load_fund(tx, fund_id)?;
                let current = snapshot_ledger::latest(tx, fund_id)?;
                if pushed.total_shares != current.total_shares {
                    return Err(FundError::validation(format!(
                        "total_shares {} does not match ledger {}",
                        pushed.total_shares, current.total_shares
                    )));
                }
                if let Some(stage) = pushed.stage {
                    if stage != fund.stage {
                        return Err(FundError::validation(format!(
                            "stage {stage} does not match fund stage {}",
                            fund.stage
                        )));
                    }
                }

                let aggregates = Aggregates {
                    nav: pushed.nav,
                    share_price: pushed.share_price,
                    tvl: pushed.tvl,
                    total_shares: pushed.total_shares,
                };
                let snapshot = snapshot_ledger::append(
                    tx,
                    fund_id,
                    aggregates,
                    fund.stage,
                    SnapshotSource::Indexer,
                    now,
                )?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::IndexerSnapshot, now)
                        .amount(pushed.nav)
                        .shares(pushed.total_shares),
                )?;
                Ok(snapshot)
            })
            .await?;

        debug!(
            fund_id,
            nav = snapshot.nav,
            tvl = snapshot.tvl,
            share_price = snapshot.share_price,
            "indexer snapshot appended"
        );
        Ok(snapshot)
    }

    /// Queue a redemption at the current share price. Shares are reserved,
    /// not burned, until processed.
    pub async fn request_withdrawal(
        &self,
        fund_id: u64,
        wallet: &str,
        shares: u64,
    ) -> FundResult<WithdrawalRequest> {
        let wallet = normalize_wallet(wallet)?;
        if shares == 0 {
            return Err(FundError::validation("withdrawal shares must be greater than zero"));
        }
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let request = self
            .db
            .write(|tx| {
                let fund = fund_db::load_fund(tx, fund_id)?;
                if !fund.stage.accepts_withdrawal_requests() {
                    return Err(FundError::InvalidStage {
                        stage: fund.stage,
                        operation: "request withdrawal",
                    });
                }
                let mut depositor = fund_db::load_depositor(tx, fund_id, &wallet)?
                    .ok_or_else(|| FundError::not_found(format!("depositor {wallet}")))?;
                if shares > depositor.available_shares() {
                    return Err(FundError::InsufficientShares {
                        requested: shares,
                        available: depositor.available_shares(),
                    });
                }

                let current = snapshot_ledger::latest(tx, fund_id)?;
                depositor.pending_withdrawal_shares += shares;
                depositor.updated_at = now;
                fund_db::save_depositor(tx, &depositor)?;

                let request = fund_db::insert_withdrawal_request(
                    tx,
                    fund_id,
                    &wallet,
                    shares,
                    current.share_price,
                    now,
                )?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::WithdrawalRequested, now)
                        .wallet(&wallet)
                        .shares(shares)
                        .detail(format!("request {}", request.id)),
                )?;
                Ok(request)
            })
            .await?;

        info!(
            fund_id,
            wallet = %request.wallet,
            request_id = request.id,
            shares,
            locked_share_price = request.locked_share_price,
            "withdrawal requested"
        );
        Ok(request)
    }

    pub async fn cancel_withdrawal(
        &self,
        fund_id: u64,
        request_id: i64,
        wallet: &str,
    ) -> FundResult<WithdrawalRequest> {
        let wallet = normalize_wallet(wallet)?;
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let request = self
            .db
            .write(|tx| {
                let mut request = fund_db::load_withdrawal_request(tx, fund_id, request_id)?;
                if request.wallet != wallet {
                    return Err(FundError::validation("request belongs to another wallet"));
                }
                if request.status != RequestStatus::Pending {
                    return Err(FundError::validation(format!(
                        "only pending requests can be cancelled (request is {})",
                        request.status.as_str()
                    )));
                }

                let mut depositor = fund_db::load_depositor(tx, fund_id, &wallet)?
                    .ok_or_else(|| FundError::not_found(format!("depositor {wallet}")))?;
                depositor.pending_withdrawal_shares = depositor
                    .pending_withdrawal_shares
                    .saturating_sub(request.remaining_shares());
                depositor.updated_at = now;
                fund_db::save_depositor(tx, &depositor)?;

                request.status = RequestStatus::Cancelled;
                request.updated_at = now;
                fund_db::save_withdrawal_request(tx, &request)?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::WithdrawalCancelled, now)
                        .wallet(&wallet)
                        .shares(request.remaining_shares())
                        .detail(format!("request {request_id}")),
                )?;
                Ok(request)
            })
            .await?;

        info!(fund_id, request_id, wallet = %request.wallet, "withdrawal cancelled");
        Ok(request)
    }

    /// Pay a queued request as far as liquidity allows, at its locked price
    /// and without the early-exit fee.
    pub async fn process_withdrawal(
        &self,
        fund_id: u64,
        request_id: i64,
    ) -> FundResult<ProcessedWithdrawal> {
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let processed = self
            .db
            .write(|tx| {
                let mut fund = fund_db::load_fund(tx, fund_id)?;
                if !fund.stage.processes_withdrawal_requests() {
                    return Err(FundError::InvalidStage {
                        stage: fund.stage,
                        operation: "process withdrawal",
                    });
                }
                let mut request = fund_db::load_withdrawal_request(tx, fund_id, request_id)?;
                if !request.status.is_open() {
                    return Err(FundError::validation(format!(
                        "request {request_id} is {}",
                        request.status.as_str()
                    )));
                }

                let current = snapshot_ledger::latest(tx, fund_id)?;
                let fill = accounting::compute_queued_fill(
                    current.aggregates(),
                    request.remaining_shares(),
                    request.locked_share_price,
                )?
                .ok_or_else(|| {
                    FundError::InsufficientBalance("no liquidity available to fill request".into())
                })?;

                let mut depositor = fund_db::load_depositor(tx, fund_id, &request.wallet)?
                    .ok_or_else(|| FundError::not_found(format!("depositor {}", request.wallet)))?;
                if fill.shares > depositor.shares {
                    return Err(FundError::InsufficientShares {
                        requested: fill.shares,
                        available: depositor.shares,
                    });
                }
                depositor.shares -= fill.shares;
                depositor.pending_withdrawal_shares =
                    depositor.pending_withdrawal_shares.saturating_sub(fill.shares);
                depositor.total_withdrawn_usdc =
                    money::checked_add(depositor.total_withdrawn_usdc, fill.usdc)?;
                depositor.updated_at = now;
                fund_db::save_depositor(tx, &depositor)?;

                request.shares_filled += fill.shares;
                request.usdc_paid = money::checked_add(request.usdc_paid, fill.usdc)?;
                request.status = if request.remaining_shares() == 0 {
                    RequestStatus::Completed
                } else {
                    RequestStatus::PartiallyFilled
                };
                request.updated_at = now;
                fund_db::save_withdrawal_request(tx, &request)?;

                fund.total_withdrawn_usdc =
                    money::checked_add(fund.total_withdrawn_usdc, fill.usdc)?;
                fund_db::save_fund_state(tx, &fund, now)?;

                let snapshot = snapshot_ledger::append(
                    tx,
                    fund_id,
                    fill.after,
                    fund.stage,
                    SnapshotSource::QueuedWithdraw,
                    now,
                )?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::WithdrawalProcessed, now)
                        .wallet(&request.wallet)
                        .amount(fill.usdc)
                        .shares(fill.shares)
                        .detail(format!("request {request_id} {}", request.status.as_str())),
                )?;

                Ok(ProcessedWithdrawal {
                    request,
                    shares_burned: fill.shares,
                    usdc_paid: fill.usdc,
                    snapshot,
                })
            })
            .await?;

        info!(
            fund_id,
            request_id,
            shares_burned = processed.shares_burned,
            usdc_paid = processed.usdc_paid,
            status = processed.request.status.as_str(),
            "withdrawal processed"
        );
        Ok(processed)
    }

    /// Quote the order on its venue, then record the fill. The quote is taken
    /// without holding the fund lock; the stage is checked again before the
    /// fill is written.
    pub async fn execute_trade(&self, fund_id: u64, order: TradeOrder) -> FundResult<TradeReceipt> {
        let market_id = validate_market_id(&order.market_id)?.to_string();
        if order.amount == 0 {
            return Err(FundError::validation("trade amount must be greater than zero"));
        }

        let (fund, held) = self
            .db
            .read(|conn| {
                let fund = fund_db::load_fund(conn, fund_id)?;
                let held = trade_ledger::load_position(
                    conn,
                    fund_id,
                    order.venue,
                    &market_id,
                    order.side,
                )?
                .map(|p| p.quantity)
                .unwrap_or(0);
                Ok((fund, held))
            })
            .await?;
        check_trade_stage(fund.stage, order.direction)?;
        if order.direction == TradeDirection::Sell && order.amount > held {
            return Err(FundError::InsufficientShares {
                requested: order.amount,
                available: held,
            });
        }

        let adapter = self.adapters.get(order.venue)?;
        let request = QuoteRequest {
            market_id: market_id.clone(),
            side: order.side,
            direction: order.direction,
            amount: order.amount,
            user_public_key: order.user_public_key.clone(),
        };
        let quote = adapter.get_quote(&request).await.map_err(|e| {
            warn!(fund_id, venue = %order.venue, market_id = %market_id, error = %e, "quote failed");
            e
        })?;

        let quantity = match order.direction {
            TradeDirection::Buy => quote.output_amount,
            TradeDirection::Sell => order.amount,
        };
        if quantity == 0 || quote.price == 0 {
            return Err(FundError::AdapterUnavailable(format!(
                "{} returned an empty quote for {market_id}",
                order.venue
            )));
        }

        let fill = TradeFill {
            venue: order.venue,
            market_id,
            side: order.side,
            direction: order.direction,
            quantity,
            price: quote.price,
            fee: quote.fee,
        };
        self.apply_fill(fund_id, fill, Some(quote)).await
    }

    /// Record a fill executed elsewhere.
    pub async fn record_trade(&self, fund_id: u64, fill: TradeFill) -> FundResult<TradeReceipt> {
        validate_market_id(&fill.market_id)?;
        fill.validate()?;
        self.apply_fill(fund_id, fill, None).await
    }

    async fn apply_fill(
        &self,
        fund_id: u64,
        fill: TradeFill,
        quote: Option<Quote>,
    ) -> FundResult<TradeReceipt> {
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let (trade, position) = self
            .db
            .write(|tx| {
                let fund = fund_db::load_fund(tx, fund_id)?;
                check_trade_stage(fund.stage, fill.direction)?;
                let (trade, position) = trade_ledger::record_fill(tx, fund_id, &fill, now)?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::Trade, now)
                        .amount(money::shares_to_usdc(trade.quantity, trade.price)?)
                        .shares(trade.quantity)
                        .fee(trade.fee)
                        .detail(format!(
                            "{} {} {}/{} @ {}",
                            trade.direction.as_str(),
                            trade.side.as_str(),
                            trade.venue,
                            trade.market_id,
                            trade.price
                        )),
                )?;
                Ok((trade, position))
            })
            .await?;

        info!(
            fund_id,
            trade_id = %trade.id,
            venue = %trade.venue,
            market_id = %trade.market_id,
            side = trade.side.as_str(),
            direction = trade.direction.as_str(),
            quantity = trade.quantity,
            price = trade.price,
            "trade recorded"
        );
        Ok(TradeReceipt {
            trade,
            position,
            quote,
        })
    }

    pub async fn mark_position(
        &self,
        fund_id: u64,
        venue: Venue,
        market_id: &str,
        side: OutcomeSide,
        price: u64,
    ) -> FundResult<Position> {
        let market_id = validate_market_id(market_id)?.to_string();
        let lock = self.fund_lock(fund_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let position = self
            .db
            .write(|tx| {
                let fund = fund_db::load_fund(tx, fund_id)?;
                if fund.stage == FundStage::Closed {
                    return Err(FundError::InvalidStage {
                        stage: fund.stage,
                        operation: "mark position",
                    });
                }
                let position =
                    trade_ledger::mark_position(tx, fund_id, venue, &market_id, side, price, now)?;
                fund_db::insert_activity(
                    tx,
                    &ActivityRecord::new(fund_id, ActivityKind::Mark, now)
                        .shares(position.quantity)
                        .detail(format!("{venue}/{market_id} {} @ {price}", side.as_str())),
                )?;
                Ok(position)
            })
            .await?;

        debug!(fund_id, market_id = %position.market_id, price, "position marked");
        Ok(position)
    }

    pub async fn get_fund(&self, fund_id: u64) -> FundResult<FundView> {
        self.db
            .read(|conn| {
                Ok(FundView {
                    fund: fund_db::load_fund(conn, fund_id)?,
                    latest: snapshot_ledger::latest(conn, fund_id)?,
                })
            })
            .await
    }

    pub async fn list_funds(
        &self,
        stage: Option<FundStage>,
        manager: Option<&str>,
        limit: usize,
    ) -> FundResult<Vec<FundView>> {
        let manager = manager.map(normalize_wallet).transpose()?;
        self.db
            .read(|conn| {
                fund_db::list_funds(conn, stage, manager.as_deref(), limit)?
                    .into_iter()
                    .map(|fund| -> FundResult<FundView> {
                        let latest = snapshot_ledger::latest(conn, fund.fund_id)?;
                        Ok(FundView { fund, latest })
                    })
                    .collect()
            })
            .await
    }

    pub async fn depositors(&self, fund_id: u64) -> FundResult<Vec<Depositor>> {
        self.db
            .read(|conn| {
                fund_db::load_fund(conn, fund_id)?;
                fund_db::list_depositors(conn, fund_id)
            })
            .await
    }

    pub async fn depositor(&self, fund_id: u64, wallet: &str) -> FundResult<Depositor> {
        let wallet = normalize_wallet(wallet)?;
        self.db
            .read(|conn| {
                fund_db::load_fund(conn, fund_id)?;
                fund_db::load_depositor(conn, fund_id, &wallet)?
                    .ok_or_else(|| FundError::not_found(format!("depositor {wallet}")))
            })
            .await
    }

    /// Performance history, newest first.
    pub async fn history(&self, fund_id: u64, limit: usize) -> FundResult<Vec<Snapshot>> {
        self.db
            .read(|conn| {
                fund_db::load_fund(conn, fund_id)?;
                snapshot_ledger::history(conn, fund_id, limit)
            })
            .await
    }

    pub async fn positions(&self, fund_id: u64, open_only: bool) -> FundResult<Vec<Position>> {
        self.db
            .read(|conn| {
                fund_db::load_fund(conn, fund_id)?;
                trade_ledger::list_positions(conn, fund_id, open_only)
            })
            .await
    }

    pub async fn trades(&self, fund_id: u64, limit: usize) -> FundResult<Vec<Trade>> {
        self.db
            .read(|conn| {
                fund_db::load_fund(conn, fund_id)?;
                trade_ledger::list_trades(conn, fund_id, limit)
            })
            .await
    }

    pub async fn withdrawal_requests(
        &self,
        fund_id: u64,
        open_only: bool,
    ) -> FundResult<Vec<WithdrawalRequest>> {
        self.db
            .read(|conn| {
                fund_db::load_fund(conn, fund_id)?;
                fund_db::list_withdrawal_requests(conn, fund_id, open_only)
            })
            .await
    }

    pub async fn activity(
        &self,
        fund_id: u64,
        wallet: Option<&str>,
        limit: usize,
    ) -> FundResult<Vec<ActivityRecord>> {
        let wallet = wallet.map(normalize_wallet).transpose()?;
        self.db
            .read(|conn| {
                fund_db::load_fund(conn, fund_id)?;
                fund_db::list_activity(conn, fund_id, wallet.as_deref(), limit)
            })
            .await
    }
}

fn check_trade_stage(stage: FundStage, direction: TradeDirection) -> FundResult<()> {
    let (allowed, operation) = match direction {
        TradeDirection::Buy => (stage.accepts_buys(), "buy"),
        TradeDirection::Sell => (stage.accepts_sells(), "sell"),
    };
    if allowed {
        Ok(())
    } else {
        Err(FundError::InvalidStage { stage, operation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fund::money::MICROS;
    use crate::fund::testing::FixedPriceAdapter;

    fn service_with(adapters: MarketAdapters) -> FundService {
        FundService::new(FundDb::in_memory().unwrap(), adapters, FundDefaults::default())
    }

    fn service() -> FundService {
        service_with(MarketAdapters::new())
    }

    fn create(fund_id: u64, deposit_fee_bps: u16) -> CreateFund {
        CreateFund {
            fund_id,
            address: format!("0xFUND{fund_id}"),
            manager: "0xManager".to_string(),
            name: "Election Alpha".to_string(),
            deposit_fee_bps: Some(deposit_fee_bps),
            ..Default::default()
        }
    }

    async fn assert_shares_balance(svc: &FundService, fund_id: u64) {
        let (sum, latest) = svc
            .db()
            .read(|conn| {
                Ok((
                    fund_db::sum_depositor_shares(conn, fund_id)?,
                    snapshot_ledger::latest(conn, fund_id)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(sum, latest.total_shares);
    }

    async fn snapshot_count(svc: &FundService, fund_id: u64) -> u64 {
        svc.db()
            .read(|conn| snapshot_ledger::count(conn, fund_id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_fund_writes_genesis_snapshot() {
        let svc = service();
        let view = svc.create_fund(create(1, 100)).await.unwrap();
        assert_eq!(view.fund.stage, FundStage::Open);
        assert_eq!(view.fund.address, "0xfund1");
        assert_eq!(view.fund.manager, "0xmanager");
        assert_eq!(view.fund.symbol, DEFAULT_SYMBOL);
        assert_eq!(view.fund.fees.perf_fee_bps, DEFAULT_PERF_FEE_BPS);
        assert_eq!(view.fund.fees.early_exit_fee_bps, 500);
        assert_eq!(view.latest.aggregates(), Aggregates::genesis());
        assert_eq!(view.latest.source, SnapshotSource::Genesis);
    }

    #[tokio::test]
    async fn create_fund_validates_input() {
        let svc = service();
        let mut bad = create(1, 0);
        bad.perf_fee_bps = Some(999);
        assert!(matches!(svc.create_fund(bad).await, Err(FundError::Validation(_))));

        let mut bad = create(1, 0);
        bad.name = "x".repeat(33);
        assert!(matches!(svc.create_fund(bad).await, Err(FundError::Validation(_))));

        let mut bad = create(1, 0);
        bad.trading_start_ts = Some(200);
        bad.trading_end_ts = Some(100);
        assert!(matches!(svc.create_fund(bad).await, Err(FundError::Validation(_))));

        assert!(matches!(
            svc.create_fund(create(1, 301)).await,
            Err(FundError::Validation(_))
        ));
        assert!(svc.list_funds(None, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn values_beyond_the_storable_range_are_validation_errors() {
        let svc = service();
        let too_big = money::MAX_STORABLE + 1;

        let err = svc.create_fund(create(too_big, 0)).await.unwrap_err();
        assert!(matches!(err, FundError::Validation(_)), "{err}");
        let err = svc.get_fund(too_big).await.unwrap_err();
        assert!(matches!(err, FundError::Validation(_)), "{err}");

        svc.create_fund(create(1, 0)).await.unwrap();
        let err = svc.deposit(1, "0xaaa", 1 << 63).await.unwrap_err();
        assert!(matches!(err, FundError::Validation(_)), "{err}");

        // Each deposit fits but the running totals would not.
        svc.deposit(1, "0xaaa", money::MAX_STORABLE - 10).await.unwrap();
        let snaps = snapshot_count(&svc, 1).await;
        let err = svc.deposit(1, "0xbbb", 100).await.unwrap_err();
        assert!(matches!(err, FundError::Validation(_)), "{err}");
        assert_eq!(snapshot_count(&svc, 1).await, snaps);
        assert!(matches!(
            svc.depositor(1, "0xbbb").await.unwrap_err(),
            FundError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn deposit_then_withdraw_in_open_returns_net_amount() {
        let svc = service();
        svc.create_fund(create(1, 100)).await.unwrap();

        let dep = svc.deposit(1, "0xAlice", 10_000 * MICROS).await.unwrap();
        assert_eq!(dep.fee_usdc, 100 * MICROS);
        assert_eq!(dep.net_usdc, 9_900 * MICROS);
        assert_eq!(dep.shares_minted, 9_900 * MICROS);
        assert_eq!(dep.wallet, "0xalice");
        assert_shares_balance(&svc, 1).await;

        let wd = svc.withdraw(1, "0xalice", dep.shares_minted).await.unwrap();
        assert_eq!(wd.exit_fee_usdc, 0);
        assert_eq!(wd.net_usdc, 9_900 * MICROS);
        assert_eq!(wd.depositor.shares, 0);
        assert_eq!(wd.depositor.total_deposited_usdc, 10_000 * MICROS);
        assert_eq!(wd.depositor.total_withdrawn_usdc, 9_900 * MICROS);
        assert_eq!(wd.snapshot.total_shares, 0);
        assert_shares_balance(&svc, 1).await;
        assert_eq!(snapshot_count(&svc, 1).await, 3);
    }

    #[tokio::test]
    async fn failed_withdraw_leaves_state_unchanged() {
        let svc = service();
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 100 * MICROS).await.unwrap();
        let before = svc.depositor(1, "0xalice").await.unwrap();
        let snaps = snapshot_count(&svc, 1).await;

        let err = svc.withdraw(1, "0xalice", 101 * MICROS).await.unwrap_err();
        assert!(matches!(err, FundError::InsufficientShares { .. }));
        assert_eq!(svc.depositor(1, "0xalice").await.unwrap(), before);
        assert_eq!(snapshot_count(&svc, 1).await, snaps);

        let err = svc.withdraw(1, "0xbob", 1).await.unwrap_err();
        assert!(matches!(err, FundError::NotFound(_)));
    }

    #[tokio::test]
    async fn stage_moves_forward_only() {
        let svc = service();
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 100 * MICROS).await.unwrap();

        assert!(matches!(
            svc.end_trading(1).await,
            Err(FundError::InvalidStageTransition { from: FundStage::Open, .. })
        ));
        assert!(matches!(
            svc.finalize(1, None).await,
            Err(FundError::InvalidStageTransition { .. })
        ));

        let view = svc.start_trading(1, None).await.unwrap();
        assert_eq!(view.fund.stage, FundStage::Trading);
        assert_eq!(view.fund.initial_aum_usdc, Some(100 * MICROS));
        assert_eq!(view.latest.stage, FundStage::Trading);

        let snaps = snapshot_count(&svc, 1).await;
        assert!(matches!(
            svc.start_trading(1, Some(5)).await,
            Err(FundError::InvalidStageTransition { from: FundStage::Trading, .. })
        ));
        let fund = svc.get_fund(1).await.unwrap().fund;
        assert_eq!(fund.stage, FundStage::Trading);
        assert_eq!(fund.initial_aum_usdc, Some(100 * MICROS));
        assert_eq!(snapshot_count(&svc, 1).await, snaps);

        assert!(matches!(
            svc.deposit(1, "0xalice", MICROS).await,
            Err(FundError::InvalidStage { .. })
        ));
    }

    #[tokio::test]
    async fn trading_window_gates_start() {
        let svc = service();
        let mut req = create(1, 0);
        req.trading_start_ts = Some(Utc::now().timestamp() + 3_600);
        svc.create_fund(req).await.unwrap();

        let err = svc.start_trading(1, None).await.unwrap_err();
        assert!(matches!(err, FundError::Validation(ref m) if m.contains("not opened")));
        assert_eq!(svc.get_fund(1).await.unwrap().fund.stage, FundStage::Open);
    }

    #[tokio::test]
    async fn full_lifecycle_with_performance_fee() {
        let svc = service();
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 60_000 * MICROS).await.unwrap();
        svc.deposit(1, "0xbob", 40_000 * MICROS).await.unwrap();
        svc.start_trading(1, None).await.unwrap();
        svc.end_trading(1).await.unwrap();

        // settlement is a closed window for direct redemptions
        assert!(matches!(
            svc.withdraw(1, "0xalice", MICROS).await,
            Err(FundError::InvalidStage { .. })
        ));

        let closed = svc.finalize(1, Some(150_000 * MICROS)).await.unwrap();
        assert_eq!(closed.profit_usdc, 50_000 * MICROS);
        assert_eq!(closed.perf_fee_usdc, 10_000 * MICROS);
        assert_eq!(closed.fund.stage, FundStage::Closed);
        assert_eq!(closed.fund.perf_fee_due_usdc, Some(10_000 * MICROS));
        assert_eq!(closed.snapshot.nav, 140_000 * MICROS);
        assert_eq!(closed.snapshot.share_price, 1_400_000);

        let alice = svc.withdraw(1, "0xalice", 60_000 * MICROS).await.unwrap();
        assert_eq!(alice.net_usdc, 84_000 * MICROS);
        assert_eq!(alice.exit_fee_usdc, 0);
        assert_eq!(alice.perf_fee_collected_usdc, Some(10_000 * MICROS));

        let bob = svc.withdraw(1, "0xbob", 40_000 * MICROS).await.unwrap();
        assert_eq!(bob.net_usdc, 56_000 * MICROS);
        assert_eq!(bob.perf_fee_collected_usdc, None);
        assert_eq!(bob.snapshot.tvl, 0);
        assert_shares_balance(&svc, 1).await;

        let err = svc.collect_performance_fee(1).await.unwrap_err();
        assert!(matches!(err, FundError::Validation(_)));
    }

    #[tokio::test]
    async fn loss_produces_no_performance_fee() {
        let svc = service();
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 100_000 * MICROS).await.unwrap();
        svc.start_trading(1, Some(100_000 * MICROS)).await.unwrap();
        svc.end_trading(1).await.unwrap();
        let closed = svc.finalize(1, Some(80_000 * MICROS)).await.unwrap();
        assert_eq!(closed.profit_usdc, 0);
        assert_eq!(closed.perf_fee_usdc, 0);
        assert_eq!(closed.snapshot.share_price, 800_000);

        let fund = svc.collect_performance_fee(1).await.unwrap();
        assert!(fund.perf_fee_paid);
        assert!(matches!(
            svc.collect_performance_fee(1).await,
            Err(FundError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn trading_withdraw_pays_early_exit_fee() {
        let svc = service();
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 10_000 * MICROS).await.unwrap();
        svc.start_trading(1, None).await.unwrap();
        svc.push_snapshot(
            1,
            IndexerSnapshot {
                nav: 12_300 * MICROS,
                share_price: 1_230_000,
                tvl: 12_300 * MICROS,
                total_shares: 10_000 * MICROS,
                stage: Some(FundStage::Trading),
            },
        )
        .await
        .unwrap();

        let wd = svc.withdraw(1, "0xalice", 1_000 * MICROS).await.unwrap();
        assert_eq!(wd.gross_usdc, 1_230 * MICROS);
        assert_eq!(wd.exit_fee_usdc, 61_500_000);
        assert_eq!(wd.net_usdc, 1_168_500_000);
        assert_shares_balance(&svc, 1).await;
    }

    #[tokio::test]
    async fn indexer_snapshot_must_match_ledger() {
        let svc = service();
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 10 * MICROS).await.unwrap();
        let snaps = snapshot_count(&svc, 1).await;

        let mismatched = IndexerSnapshot {
            nav: 11 * MICROS,
            share_price: 1_100_000,
            tvl: 11 * MICROS,
            total_shares: 9 * MICROS,
            stage: None,
        };
        assert!(matches!(
            svc.push_snapshot(1, mismatched).await,
            Err(FundError::Validation(_))
        ));
        let wrong_stage = IndexerSnapshot {
            total_shares: 10 * MICROS,
            stage: Some(FundStage::Closed),
            ..mismatched
        };
        assert!(matches!(
            svc.push_snapshot(1, wrong_stage).await,
            Err(FundError::Validation(_))
        ));
        assert_eq!(snapshot_count(&svc, 1).await, snaps);

        let ok = IndexerSnapshot {
            stage: None,
            ..wrong_stage
        };
        let snap = svc.push_snapshot(1, ok).await.unwrap();
        assert_eq!(snap.source, SnapshotSource::Indexer);
        assert_eq!(snap.nav, 11 * MICROS);
        assert_eq!(svc.history(1, 1).await.unwrap()[0].seq, snap.seq);
    }

    #[tokio::test]
    async fn queued_withdrawal_reserves_then_fills() {
        let svc = service();
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 1_000 * MICROS).await.unwrap();

        // only while trading
        assert!(matches!(
            svc.request_withdrawal(1, "0xalice", MICROS).await,
            Err(FundError::InvalidStage { .. })
        ));
        svc.start_trading(1, None).await.unwrap();

        let req = svc
            .request_withdrawal(1, "0xalice", 600 * MICROS)
            .await
            .unwrap();
        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(req.locked_share_price, MICROS);

        // reserved shares cannot be redeemed directly
        let err = svc.withdraw(1, "0xalice", 500 * MICROS).await.unwrap_err();
        assert!(matches!(err, FundError::InsufficientShares { available, .. } if available == 400 * MICROS));

        // most of the fund is in positions: only 200 USDC cash
        svc.push_snapshot(
            1,
            IndexerSnapshot {
                nav: 1_000 * MICROS,
                share_price: MICROS,
                tvl: 200 * MICROS,
                total_shares: 1_000 * MICROS,
                stage: None,
            },
        )
        .await
        .unwrap();

        let first = svc.process_withdrawal(1, req.id).await.unwrap();
        assert_eq!(first.usdc_paid, 200 * MICROS);
        assert_eq!(first.shares_burned, 200 * MICROS);
        assert_eq!(first.request.status, RequestStatus::PartiallyFilled);
        assert_shares_balance(&svc, 1).await;

        assert!(matches!(
            svc.cancel_withdrawal(1, req.id, "0xalice").await,
            Err(FundError::Validation(_))
        ));
        assert!(matches!(
            svc.process_withdrawal(1, req.id).await,
            Err(FundError::InsufficientBalance(_))
        ));

        let alice = svc.depositor(1, "0xalice").await.unwrap();
        assert_eq!(alice.shares, 800 * MICROS);
        assert_eq!(alice.pending_withdrawal_shares, 400 * MICROS);
    }

    #[tokio::test]
    async fn cancelling_a_request_releases_shares() {
        let svc = service();
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 100 * MICROS).await.unwrap();
        svc.start_trading(1, None).await.unwrap();
        let req = svc.request_withdrawal(1, "0xalice", 50 * MICROS).await.unwrap();

        assert!(matches!(
            svc.cancel_withdrawal(1, req.id, "0xbob").await,
            Err(FundError::Validation(_))
        ));
        let cancelled = svc.cancel_withdrawal(1, req.id, "0xalice").await.unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        let alice = svc.depositor(1, "0xalice").await.unwrap();
        assert_eq!(alice.available_shares(), 100 * MICROS);
        assert!(svc.withdrawal_requests(1, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_releases_open_requests_and_needs_flat_book() {
        let svc = service();
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 100 * MICROS).await.unwrap();
        svc.start_trading(1, None).await.unwrap();
        svc.request_withdrawal(1, "0xalice", 30 * MICROS).await.unwrap();
        svc.record_trade(
            1,
            TradeFill {
                venue: Venue::Polygon,
                market_id: "rain".to_string(),
                side: OutcomeSide::Yes,
                direction: TradeDirection::Buy,
                quantity: 10 * MICROS,
                price: 500_000,
                fee: 0,
            },
        )
        .await
        .unwrap();
        svc.end_trading(1).await.unwrap();

        let err = svc.finalize(1, None).await.unwrap_err();
        assert!(matches!(err, FundError::Validation(ref m) if m.contains("positions")));

        svc.record_trade(
            1,
            TradeFill {
                venue: Venue::Polygon,
                market_id: "rain".to_string(),
                side: OutcomeSide::Yes,
                direction: TradeDirection::Sell,
                quantity: 10 * MICROS,
                price: 600_000,
                fee: 0,
            },
        )
        .await
        .unwrap();

        let closed = svc.finalize(1, None).await.unwrap();
        assert_eq!(closed.released_requests, 1);
        let alice = svc.depositor(1, "0xalice").await.unwrap();
        assert_eq!(alice.pending_withdrawal_shares, 0);
        svc.withdraw(1, "0xalice", 100 * MICROS).await.unwrap();
        assert_shares_balance(&svc, 1).await;
    }

    #[tokio::test]
    async fn execute_trade_quotes_then_records() {
        let adapter = FixedPriceAdapter::new(Venue::Solana, 400_000);
        let svc = service_with(MarketAdapters::new().with(adapter.clone()));
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 1_000 * MICROS).await.unwrap();

        let order = TradeOrder {
            venue: Venue::Solana,
            market_id: "SOL-UP".to_string(),
            side: OutcomeSide::Yes,
            direction: TradeDirection::Buy,
            amount: 100 * MICROS,
            user_public_key: None,
        };

        // open funds do not trade and the venue is never asked
        assert!(matches!(
            svc.execute_trade(1, order.clone()).await,
            Err(FundError::InvalidStage { .. })
        ));
        assert!(adapter.quotes.lock().is_empty());

        svc.start_trading(1, None).await.unwrap();
        let bought = svc.execute_trade(1, order.clone()).await.unwrap();
        assert_eq!(bought.trade.quantity, 250 * MICROS);
        assert_eq!(bought.position.avg_price, 400_000);
        assert!(bought.quote.is_some());

        let sell = TradeOrder {
            direction: TradeDirection::Sell,
            amount: 300 * MICROS,
            ..order.clone()
        };
        assert!(matches!(
            svc.execute_trade(1, sell).await,
            Err(FundError::InsufficientShares { .. })
        ));

        let marked = svc
            .mark_position(1, Venue::Solana, "SOL-UP", OutcomeSide::Yes, 600_000)
            .await
            .unwrap();
        assert_eq!(marked.unrealized_pnl(), 50 * MICROS as i128);
        assert_eq!(svc.trades(1, 10).await.unwrap().len(), 1);
        // trades never touch the share ledger
        assert_shares_balance(&svc, 1).await;
    }

    #[tokio::test]
    async fn adapter_failure_records_nothing() {
        let adapter = FixedPriceAdapter::failing(Venue::Polygon);
        let svc = service_with(MarketAdapters::new().with(adapter));
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 100 * MICROS).await.unwrap();
        svc.start_trading(1, None).await.unwrap();

        let order = TradeOrder {
            venue: Venue::Polygon,
            market_id: "rain".to_string(),
            side: OutcomeSide::No,
            direction: TradeDirection::Buy,
            amount: 10 * MICROS,
            user_public_key: None,
        };
        let err = svc.execute_trade(1, order.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(svc.trades(1, 10).await.unwrap().is_empty());
        assert!(svc.positions(1, false).await.unwrap().is_empty());

        // no adapter configured for the other venue
        let err = svc
            .execute_trade(
                1,
                TradeOrder {
                    venue: Venue::Solana,
                    ..order
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FundError::AdapterUnavailable(_)));
    }

    #[tokio::test]
    async fn concurrent_deposits_are_serialized() {
        let svc = service();
        svc.create_fund(create(1, 100)).await.unwrap();
        svc.create_fund(create(2, 0)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let svc = svc.clone();
            let fund_id = 1 + (i % 2);
            handles.push(tokio::spawn(async move {
                svc.deposit(fund_id, &format!("0xwallet{}", i % 5), (i + 1) * MICROS)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for fund_id in [1, 2] {
            assert_shares_balance(&svc, fund_id).await;
            assert_eq!(snapshot_count(&svc, fund_id).await, 1 + 8);
            let history = svc.history(fund_id, 100).await.unwrap();
            assert!(history.windows(2).all(|w| w[0].seq > w[1].seq && w[0].ts >= w[1].ts));
            assert!(history
                .windows(2)
                .all(|w| w[0].total_shares > w[1].total_shares));
        }
    }

    #[tokio::test]
    async fn activity_journal_tracks_operations() {
        let svc = service();
        svc.create_fund(create(1, 0)).await.unwrap();
        svc.deposit(1, "0xalice", 10 * MICROS).await.unwrap();
        svc.withdraw(1, "0xalice", 5 * MICROS).await.unwrap();
        let _ = svc.withdraw(1, "0xalice", 50 * MICROS).await;

        let all = svc.activity(1, None, 50).await.unwrap();
        let kinds: Vec<_> = all.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![ActivityKind::Withdraw, ActivityKind::Deposit, ActivityKind::FundCreated]
        );
        let mine = svc.activity(1, Some("0xALICE"), 50).await.unwrap();
        assert_eq!(mine.len(), 2);
    }

    #[tokio::test]
    async fn reads_of_unknown_fund_are_not_found() {
        let svc = service();
        assert!(matches!(svc.get_fund(7).await, Err(FundError::NotFound(_))));
        assert!(matches!(svc.depositors(7).await, Err(FundError::NotFound(_))));
        assert!(matches!(svc.history(7, 10).await, Err(FundError::NotFound(_))));
        assert!(matches!(svc.deposit(7, "0xa", 1).await, Err(FundError::NotFound(_))));
    }
}
