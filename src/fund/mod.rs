//! Fund core: lifecycle, share accounting, snapshot ledger, positions.
//!
//! All amounts are micro-units (`u64`, 10^6 per USDC or share). Mutations go
//! through [`FundService`], which serializes them per fund and commits each
//! one as a single SQLite transaction.

pub mod accounting;
pub mod error;
pub mod fund_db;
pub mod money;
pub mod service;
pub mod snapshot_ledger;
pub mod stage;
pub mod trade_ledger;

#[cfg(test)]
pub(crate) mod testing;

pub use accounting::{Aggregates, FeeSchedule};
pub use error::{ErrorKind, FundError, FundResult};
pub use fund_db::{
    ActivityKind, ActivityRecord, Depositor, Fund, FundDb, RequestStatus, WithdrawalRequest,
};
pub use service::FundService;
pub use snapshot_ledger::{Snapshot, SnapshotSource};
pub use stage::{FundStage, StageAction};
pub use trade_ledger::{OutcomeSide, Position, Trade, TradeDirection, TradeFill};
