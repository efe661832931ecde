//! Share accounting.
//!
//! Pure functions from (fee schedule, stage, latest aggregates, request) to the
//! amounts moved and the aggregates of the snapshot to append. Nothing here
//! touches storage, so a failed computation can never leave partial state.

use serde::{Deserialize, Serialize};

use super::error::{FundError, FundResult};
use super::money::{self, bps_of, shares_to_usdc, usdc_to_shares};
use super::stage::FundStage;

pub const MAX_DEPOSIT_FEE_BPS: u16 = 300;
pub const MIN_PERF_FEE_BPS: u16 = 1_000;
pub const MAX_PERF_FEE_BPS: u16 = 3_000;
pub const MAX_EARLY_EXIT_FEE_BPS: u16 = 500;
pub const DEFAULT_PERF_FEE_BPS: u16 = 2_000;

/// Fee parameters fixed at fund creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub deposit_fee_bps: u16,
    pub perf_fee_bps: u16,
    pub early_exit_fee_bps: u16,
    pub liquidity_buffer_bps: u16,
}

impl FeeSchedule {
    pub fn validate(&self) -> FundResult<()> {
        if self.deposit_fee_bps > MAX_DEPOSIT_FEE_BPS {
            return Err(FundError::validation(format!(
                "deposit_fee_bps must be at most {MAX_DEPOSIT_FEE_BPS}"
            )));
        }
        if !(MIN_PERF_FEE_BPS..=MAX_PERF_FEE_BPS).contains(&self.perf_fee_bps) {
            return Err(FundError::validation(format!(
                "perf_fee_bps must be between {MIN_PERF_FEE_BPS} and {MAX_PERF_FEE_BPS}"
            )));
        }
        if self.early_exit_fee_bps > MAX_EARLY_EXIT_FEE_BPS {
            return Err(FundError::validation(format!(
                "early_exit_fee_bps must be at most {MAX_EARLY_EXIT_FEE_BPS}"
            )));
        }
        if u64::from(self.liquidity_buffer_bps) > money::BPS_DENOMINATOR {
            return Err(FundError::validation(
                "liquidity_buffer_bps must be at most 10000",
            ));
        }
        Ok(())
    }
}

/// Aggregate figures carried by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregates {
    pub nav: u64,
    pub share_price: u64,
    pub tvl: u64,
    pub total_shares: u64,
}

impl Aggregates {
    pub fn genesis() -> Self {
        Self {
            nav: 0,
            share_price: money::INITIAL_SHARE_PRICE,
            tvl: 0,
            total_shares: 0,
        }
    }

    fn reprice(mut self) -> FundResult<Self> {
        self.share_price = money::share_price_of(self.nav, self.total_shares, self.share_price)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositOutcome {
    pub shares_minted: u64,
    pub fee: u64,
    pub net_amount: u64,
    pub after: Aggregates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawOutcome {
    pub gross_usdc: u64,
    pub exit_fee: u64,
    pub net_usdc: u64,
    pub after: Aggregates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    pub profit: u64,
    pub perf_fee: u64,
    pub after: Aggregates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedFill {
    pub shares: u64,
    pub usdc: u64,
    pub after: Aggregates,
}

pub fn compute_deposit(
    fees: &FeeSchedule,
    stage: FundStage,
    current: Aggregates,
    amount_usdc: u64,
) -> FundResult<DepositOutcome> {
    if amount_usdc == 0 {
        return Err(FundError::validation("deposit amount must be greater than zero"));
    }
    money::storable(amount_usdc)?;
    if !stage.accepts_deposits() {
        return Err(FundError::InvalidStage {
            stage,
            operation: "deposit",
        });
    }

    let fee = bps_of(amount_usdc, fees.deposit_fee_bps)?;
    let net_amount = amount_usdc - fee;
    let shares_minted = usdc_to_shares(net_amount, current.share_price)?;
    if shares_minted == 0 {
        return Err(FundError::validation("deposit too small to mint any shares"));
    }

    let after = Aggregates {
        nav: money::checked_add(current.nav, net_amount)?,
        tvl: money::checked_add(current.tvl, net_amount)?,
        total_shares: money::checked_add(current.total_shares, shares_minted)?,
        share_price: current.share_price,
    }
    .reprice()?;

    Ok(DepositOutcome {
        shares_minted,
        fee,
        net_amount,
        after,
    })
}

pub fn compute_withdraw(
    fees: &FeeSchedule,
    stage: FundStage,
    current: Aggregates,
    shares: u64,
    available_shares: u64,
) -> FundResult<WithdrawOutcome> {
    if shares == 0 {
        return Err(FundError::validation("withdrawal shares must be greater than zero"));
    }
    if !stage.accepts_withdrawals() {
        return Err(FundError::InvalidStage {
            stage,
            operation: "withdraw",
        });
    }
    if shares > available_shares || shares > current.total_shares {
        return Err(FundError::InsufficientShares {
            requested: shares,
            available: available_shares.min(current.total_shares),
        });
    }

    let gross_usdc = shares_to_usdc(shares, current.share_price)?;
    let exit_fee = if stage.charges_early_exit() {
        bps_of(gross_usdc, fees.early_exit_fee_bps)?
    } else {
        0
    };
    let net_usdc = gross_usdc - exit_fee;

    if net_usdc > current.tvl || net_usdc > current.nav {
        return Err(FundError::InsufficientBalance(format!(
            "payout {net_usdc} exceeds fund liquidity {}",
            current.tvl.min(current.nav)
        )));
    }

    let after = Aggregates {
        nav: current.nav - net_usdc,
        tvl: current.tvl - net_usdc,
        total_shares: current.total_shares - shares,
        share_price: current.share_price,
    }
    .reprice()?;

    if stage.charges_early_exit() {
        let min_buffer = bps_of(after.nav, fees.liquidity_buffer_bps)?;
        if after.tvl < min_buffer {
            return Err(FundError::InsufficientBalance(format!(
                "early exit would leave {} below the liquidity buffer of {min_buffer}",
                after.tvl
            )));
        }
    }

    Ok(WithdrawOutcome {
        gross_usdc,
        exit_fee,
        net_usdc,
        after,
    })
}

/// `(profit, fee)` with `profit = max(0, final - initial)` and a floored fee.
pub fn performance_fee(
    initial_aum_usdc: u64,
    final_balance_usdc: u64,
    perf_fee_bps: u16,
) -> FundResult<(u64, u64)> {
    let profit = final_balance_usdc.saturating_sub(initial_aum_usdc);
    Ok((profit, bps_of(profit, perf_fee_bps)?))
}

/// Closing figures: the performance fee is reserved out of the final balance
/// and the remainder sets the final share price.
pub fn compute_close(
    fees: &FeeSchedule,
    current: Aggregates,
    initial_aum_usdc: u64,
    final_balance_usdc: u64,
) -> FundResult<CloseOutcome> {
    let (profit, perf_fee) =
        performance_fee(initial_aum_usdc, final_balance_usdc, fees.perf_fee_bps)?;
    let remaining = final_balance_usdc - perf_fee;
    let after = Aggregates {
        nav: remaining,
        tvl: remaining,
        total_shares: current.total_shares,
        share_price: current.share_price,
    }
    .reprice()?;
    Ok(CloseOutcome {
        profit,
        perf_fee,
        after,
    })
}

/// Pay as much of a queued request as current liquidity allows, at the price
/// locked when the request was made. `None` when nothing can be filled.
pub fn compute_queued_fill(
    current: Aggregates,
    remaining_shares: u64,
    locked_price: u64,
) -> FundResult<Option<QueuedFill>> {
    if remaining_shares == 0 {
        return Ok(None);
    }
    let owed = shares_to_usdc(remaining_shares, locked_price)?;
    let liquid = current.tvl.min(current.nav);

    let (shares, usdc) = if owed <= liquid {
        (remaining_shares, owed)
    } else {
        let shares = usdc_to_shares(liquid, locked_price)?.min(remaining_shares);
        (shares, shares_to_usdc(shares, locked_price)?)
    };
    if shares == 0 || usdc == 0 {
        return Ok(None);
    }

    let after = Aggregates {
        nav: current.nav - usdc,
        tvl: current.tvl - usdc,
        total_shares: current.total_shares.saturating_sub(shares),
        share_price: current.share_price,
    }
    .reprice()?;
    Ok(Some(QueuedFill { shares, usdc, after }))
}
