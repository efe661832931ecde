use anyhow::{Context, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::accounting::FeeSchedule;
use super::error::{FundError, FundResult};
use super::snapshot_ledger::{self, SnapshotSource};
use super::stage::FundStage;
use super::trade_ledger::{self, OutcomeSide, TradeDirection};
use crate::markets::Venue;

/// Text columns backed by the enum's `as_str` / `from_str`.
macro_rules! sql_text_enum {
    ($($ty:ty),* $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                <$ty>::from_str(s).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} {s:?}", stringify!($ty)).into())
                })
            }
        }
    )*};
}

sql_text_enum!(
    FundStage,
    SnapshotSource,
    Venue,
    OutcomeSide,
    TradeDirection,
    RequestStatus,
    ActivityKind,
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fund {
    pub fund_id: u64,
    pub address: String,
    pub manager: String,
    pub name: String,
    pub symbol: String,
    pub description: Option<String>,
    pub fees: FeeSchedule,
    pub stage: FundStage,
    /// Unix seconds.
    pub trading_start_ts: Option<i64>,
    pub trading_end_ts: Option<i64>,
    pub initial_aum_usdc: Option<u64>,
    pub final_balance_usdc: Option<u64>,
    pub perf_fee_due_usdc: Option<u64>,
    pub perf_fee_paid: bool,
    pub total_deposited_usdc: u64,
    pub total_withdrawn_usdc: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFund {
    pub fund_id: u64,
    pub address: String,
    pub manager: String,
    pub name: String,
    pub symbol: String,
    pub description: Option<String>,
    pub fees: FeeSchedule,
    pub trading_start_ts: Option<i64>,
    pub trading_end_ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Depositor {
    pub fund_id: u64,
    pub wallet: String,
    pub shares: u64,
    /// Reserved by open withdrawal requests.
    pub pending_withdrawal_shares: u64,
    pub total_deposited_usdc: u64,
    pub total_withdrawn_usdc: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Depositor {
    pub fn new(fund_id: u64, wallet: &str, now: i64) -> Self {
        Self {
            fund_id,
            wallet: wallet.to_string(),
            shares: 0,
            pending_withdrawal_shares: 0,
            total_deposited_usdc: 0,
            total_withdrawn_usdc: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn available_shares(&self) -> u64 {
        self.shares.saturating_sub(self.pending_withdrawal_shares)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    PartiallyFilled,
    Completed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::PartiallyFilled => "partially_filled",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "partially_filled" => Some(RequestStatus::PartiallyFilled),
            "completed" => Some(RequestStatus::Completed),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalRequest {
    pub id: i64,
    pub fund_id: u64,
    pub wallet: String,
    pub shares_requested: u64,
    pub shares_filled: u64,
    pub usdc_paid: u64,
    pub locked_share_price: u64,
    pub status: RequestStatus,
    pub requested_at: i64,
    pub updated_at: i64,
}

impl WithdrawalRequest {
    pub fn remaining_shares(&self) -> u64 {
        self.shares_requested.saturating_sub(self.shares_filled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    FundCreated,
    Deposit,
    Withdraw,
    StageChange,
    PerformanceFee,
    WithdrawalRequested,
    WithdrawalCancelled,
    WithdrawalProcessed,
    Trade,
    Mark,
    IndexerSnapshot,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::FundCreated => "FUND_CREATED",
            ActivityKind::Deposit => "DEPOSIT",
            ActivityKind::Withdraw => "WITHDRAW",
            ActivityKind::StageChange => "STAGE_CHANGE",
            ActivityKind::PerformanceFee => "PERFORMANCE_FEE",
            ActivityKind::WithdrawalRequested => "WITHDRAWAL_REQUESTED",
            ActivityKind::WithdrawalCancelled => "WITHDRAWAL_CANCELLED",
            ActivityKind::WithdrawalProcessed => "WITHDRAWAL_PROCESSED",
            ActivityKind::Trade => "TRADE",
            ActivityKind::Mark => "MARK",
            ActivityKind::IndexerSnapshot => "INDEXER_SNAPSHOT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "FUND_CREATED" => Some(ActivityKind::FundCreated),
            "DEPOSIT" => Some(ActivityKind::Deposit),
            "WITHDRAW" => Some(ActivityKind::Withdraw),
            "STAGE_CHANGE" => Some(ActivityKind::StageChange),
            "PERFORMANCE_FEE" => Some(ActivityKind::PerformanceFee),
            "WITHDRAWAL_REQUESTED" => Some(ActivityKind::WithdrawalRequested),
            "WITHDRAWAL_CANCELLED" => Some(ActivityKind::WithdrawalCancelled),
            "WITHDRAWAL_PROCESSED" => Some(ActivityKind::WithdrawalProcessed),
            "TRADE" => Some(ActivityKind::Trade),
            "MARK" => Some(ActivityKind::Mark),
            "INDEXER_SNAPSHOT" => Some(ActivityKind::IndexerSnapshot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub id: String,
    pub fund_id: u64,
    pub ts: i64,
    pub kind: ActivityKind,
    pub wallet: Option<String>,
    pub amount_usdc: Option<u64>,
    pub shares: Option<u64>,
    pub fee_usdc: Option<u64>,
    pub detail: Option<String>,
}

impl ActivityRecord {
    pub fn new(fund_id: u64, kind: ActivityKind, ts: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            fund_id,
            ts,
            kind,
            wallet: None,
            amount_usdc: None,
            shares: None,
            fee_usdc: None,
            detail: None,
        }
    }

    pub fn wallet(mut self, wallet: &str) -> Self {
        self.wallet = Some(wallet.to_string());
        self
    }

    pub fn amount(mut self, usdc: u64) -> Self {
        self.amount_usdc = Some(usdc);
        self
    }

    pub fn shares(mut self, shares: u64) -> Self {
        self.shares = Some(shares);
        self
    }

    pub fn fee(mut self, usdc: u64) -> Self {
        self.fee_usdc = Some(usdc);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// SQLite store for every fund. One connection, serialized behind an async
/// mutex; mutations go through [`FundDb::write`] so each commits atomically.
#[derive(Clone)]
pub struct FundDb {
    conn: Arc<Mutex<Connection>>,
}

impl FundDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open fund db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory fund db")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        create_schema(&conn).context("create fund schema")?;
        snapshot_ledger::create_schema(&conn).context("create snapshot schema")?;
        trade_ledger::create_schema(&conn).context("create trade schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside one transaction. Any error rolls the whole thing back.
    pub async fn write<T, F>(&self, f: F) -> FundResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> FundResult<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub async fn read<T, F>(&self, f: F) -> FundResult<T>
    where
        F: FnOnce(&Connection) -> FundResult<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS funds (
            fund_id INTEGER PRIMARY KEY,
            address TEXT NOT NULL UNIQUE,
            manager TEXT NOT NULL,
            name TEXT NOT NULL,
            symbol TEXT NOT NULL,
            description TEXT,
            deposit_fee_bps INTEGER NOT NULL,
            perf_fee_bps INTEGER NOT NULL,
            early_exit_fee_bps INTEGER NOT NULL,
            liquidity_buffer_bps INTEGER NOT NULL,
            stage TEXT NOT NULL,
            trading_start_ts INTEGER,
            trading_end_ts INTEGER,
            initial_aum_usdc INTEGER,
            final_balance_usdc INTEGER,
            perf_fee_due_usdc INTEGER,
            perf_fee_paid INTEGER NOT NULL DEFAULT 0,
            total_deposited_usdc INTEGER NOT NULL DEFAULT 0,
            total_withdrawn_usdc INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fund_depositors (
            fund_id INTEGER NOT NULL REFERENCES funds(fund_id),
            wallet TEXT NOT NULL,
            shares INTEGER NOT NULL,
            pending_withdrawal_shares INTEGER NOT NULL DEFAULT 0,
            total_deposited_usdc INTEGER NOT NULL DEFAULT 0,
            total_withdrawn_usdc INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (fund_id, wallet)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fund_withdrawal_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fund_id INTEGER NOT NULL REFERENCES funds(fund_id),
            wallet TEXT NOT NULL,
            shares_requested INTEGER NOT NULL,
            shares_filled INTEGER NOT NULL DEFAULT 0,
            usdc_paid INTEGER NOT NULL DEFAULT 0,
            locked_share_price INTEGER NOT NULL,
            status TEXT NOT NULL,
            requested_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fund_withdrawal_requests_fund ON fund_withdrawal_requests(fund_id, id ASC)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fund_activity (
            id TEXT PRIMARY KEY,
            fund_id INTEGER NOT NULL REFERENCES funds(fund_id),
            ts INTEGER NOT NULL,
            kind TEXT NOT NULL,
            wallet TEXT,
            amount_usdc INTEGER,
            shares INTEGER,
            fee_usdc INTEGER,
            detail TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fund_activity_fund_ts ON fund_activity(fund_id, ts DESC)",
        [],
    )?;
    Ok(())
}

const FUND_COLUMNS: &str = "fund_id, address, manager, name, symbol, description,
    deposit_fee_bps, perf_fee_bps, early_exit_fee_bps, liquidity_buffer_bps,
    stage, trading_start_ts, trading_end_ts, initial_aum_usdc, final_balance_usdc,
    perf_fee_due_usdc, perf_fee_paid, total_deposited_usdc, total_withdrawn_usdc,
    created_at, updated_at";

fn fund_from_row(row: &Row<'_>) -> rusqlite::Result<Fund> {
    Ok(Fund {
        fund_id: row.get(0)?,
        address: row.get(1)?,
        manager: row.get(2)?,
        name: row.get(3)?,
        symbol: row.get(4)?,
        description: row.get(5)?,
        fees: FeeSchedule {
            deposit_fee_bps: row.get(6)?,
            perf_fee_bps: row.get(7)?,
            early_exit_fee_bps: row.get(8)?,
            liquidity_buffer_bps: row.get(9)?,
        },
        stage: row.get(10)?,
        trading_start_ts: row.get(11)?,
        trading_end_ts: row.get(12)?,
        initial_aum_usdc: row.get(13)?,
        final_balance_usdc: row.get(14)?,
        perf_fee_due_usdc: row.get(15)?,
        perf_fee_paid: row.get(16)?,
        total_deposited_usdc: row.get(17)?,
        total_withdrawn_usdc: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

pub fn insert_fund(tx: &Transaction<'_>, new: &NewFund, now: i64) -> FundResult<Fund> {
    let taken: Option<u64> = tx
        .query_row(
            "SELECT fund_id FROM funds WHERE fund_id = ?1 OR address = ?2 LIMIT 1",
            params![new.fund_id, new.address],
            |row| row.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(FundError::validation(format!(
            "fund {} or address {} already exists",
            new.fund_id, new.address
        )));
    }

    tx.execute(
        "INSERT INTO funds (fund_id, address, manager, name, symbol, description,
            deposit_fee_bps, perf_fee_bps, early_exit_fee_bps, liquidity_buffer_bps,
            stage, trading_start_ts, trading_end_ts, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
        params![
            new.fund_id,
            new.address,
            new.manager,
            new.name,
            new.symbol,
            new.description,
            new.fees.deposit_fee_bps,
            new.fees.perf_fee_bps,
            new.fees.early_exit_fee_bps,
            new.fees.liquidity_buffer_bps,
            FundStage::Open,
            new.trading_start_ts,
            new.trading_end_ts,
            now,
        ],
    )?;
    load_fund(tx, new.fund_id)
}

pub fn load_fund(conn: &Connection, fund_id: u64) -> FundResult<Fund> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {FUND_COLUMNS} FROM funds WHERE fund_id = ?1"))?;
    stmt.query_row(params![fund_id], fund_from_row)
        .optional()?
        .ok_or_else(|| FundError::not_found(format!("fund {fund_id}")))
}

pub fn list_funds(
    conn: &Connection,
    stage: Option<FundStage>,
    manager: Option<&str>,
    limit: usize,
) -> FundResult<Vec<Fund>> {
    let limit = limit.clamp(1, 1_000) as i64;
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {FUND_COLUMNS} FROM funds
         WHERE (?1 IS NULL OR stage = ?1) AND (?2 IS NULL OR manager = ?2)
         ORDER BY fund_id ASC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(params![stage, manager, limit], fund_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Persist the mutable lifecycle columns. Identity and fee columns are
/// written once by [`insert_fund`] and never updated.
pub fn save_fund_state(tx: &Transaction<'_>, fund: &Fund, now: i64) -> FundResult<()> {
    let changed = tx.execute(
        "UPDATE funds SET
            stage = ?2,
            initial_aum_usdc = ?3,
            final_balance_usdc = ?4,
            perf_fee_due_usdc = ?5,
            perf_fee_paid = ?6,
            total_deposited_usdc = ?7,
            total_withdrawn_usdc = ?8,
            updated_at = ?9
         WHERE fund_id = ?1",
        params![
            fund.fund_id,
            fund.stage,
            fund.initial_aum_usdc,
            fund.final_balance_usdc,
            fund.perf_fee_due_usdc,
            fund.perf_fee_paid,
            fund.total_deposited_usdc,
            fund.total_withdrawn_usdc,
            now,
        ],
    )?;
    if changed == 0 {
        return Err(FundError::not_found(format!("fund {}", fund.fund_id)));
    }
    Ok(())
}

const DEPOSITOR_COLUMNS: &str = "fund_id, wallet, shares, pending_withdrawal_shares,
    total_deposited_usdc, total_withdrawn_usdc, created_at, updated_at";

fn depositor_from_row(row: &Row<'_>) -> rusqlite::Result<Depositor> {
    Ok(Depositor {
        fund_id: row.get(0)?,
        wallet: row.get(1)?,
        shares: row.get(2)?,
        pending_withdrawal_shares: row.get(3)?,
        total_deposited_usdc: row.get(4)?,
        total_withdrawn_usdc: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub fn load_depositor(
    conn: &Connection,
    fund_id: u64,
    wallet: &str,
) -> FundResult<Option<Depositor>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {DEPOSITOR_COLUMNS} FROM fund_depositors WHERE fund_id = ?1 AND wallet = ?2"
    ))?;
    Ok(stmt
        .query_row(params![fund_id, wallet], depositor_from_row)
        .optional()?)
}

pub fn save_depositor(tx: &Transaction<'_>, depositor: &Depositor) -> FundResult<()> {
    tx.execute(
        "INSERT INTO fund_depositors (fund_id, wallet, shares, pending_withdrawal_shares,
            total_deposited_usdc, total_withdrawn_usdc, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(fund_id, wallet) DO UPDATE SET
            shares = excluded.shares,
            pending_withdrawal_shares = excluded.pending_withdrawal_shares,
            total_deposited_usdc = excluded.total_deposited_usdc,
            total_withdrawn_usdc = excluded.total_withdrawn_usdc,
            updated_at = excluded.updated_at",
        params![
            depositor.fund_id,
            depositor.wallet,
            depositor.shares,
            depositor.pending_withdrawal_shares,
            depositor.total_deposited_usdc,
            depositor.total_withdrawn_usdc,
            depositor.created_at,
            depositor.updated_at,
        ],
    )?;
    Ok(())
}

pub fn list_depositors(conn: &Connection, fund_id: u64) -> FundResult<Vec<Depositor>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {DEPOSITOR_COLUMNS} FROM fund_depositors
         WHERE fund_id = ?1
         ORDER BY shares DESC, wallet ASC"
    ))?;
    let rows = stmt.query_map(params![fund_id], depositor_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Sum of depositor shares; equals the latest snapshot's `total_shares`.
#[cfg(test)]
pub(crate) fn sum_depositor_shares(conn: &Connection, fund_id: u64) -> FundResult<u64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(shares), 0) FROM fund_depositors WHERE fund_id = ?1",
        params![fund_id],
        |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
}

const REQUEST_COLUMNS: &str = "id, fund_id, wallet, shares_requested, shares_filled, usdc_paid,
    locked_share_price, status, requested_at, updated_at";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<WithdrawalRequest> {
    Ok(WithdrawalRequest {
        id: row.get(0)?,
        fund_id: row.get(1)?,
        wallet: row.get(2)?,
        shares_requested: row.get(3)?,
        shares_filled: row.get(4)?,
        usdc_paid: row.get(5)?,
        locked_share_price: row.get(6)?,
        status: row.get(7)?,
        requested_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

pub fn insert_withdrawal_request(
    tx: &Transaction<'_>,
    fund_id: u64,
    wallet: &str,
    shares: u64,
    locked_share_price: u64,
    now: i64,
) -> FundResult<WithdrawalRequest> {
    tx.execute(
        "INSERT INTO fund_withdrawal_requests (fund_id, wallet, shares_requested,
            locked_share_price, status, requested_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![fund_id, wallet, shares, locked_share_price, RequestStatus::Pending, now],
    )?;
    Ok(WithdrawalRequest {
        id: tx.last_insert_rowid(),
        fund_id,
        wallet: wallet.to_string(),
        shares_requested: shares,
        shares_filled: 0,
        usdc_paid: 0,
        locked_share_price,
        status: RequestStatus::Pending,
        requested_at: now,
        updated_at: now,
    })
}

pub fn load_withdrawal_request(
    conn: &Connection,
    fund_id: u64,
    request_id: i64,
) -> FundResult<WithdrawalRequest> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {REQUEST_COLUMNS} FROM fund_withdrawal_requests WHERE fund_id = ?1 AND id = ?2"
    ))?;
    stmt.query_row(params![fund_id, request_id], request_from_row)
        .optional()?
        .ok_or_else(|| FundError::not_found(format!("withdrawal request {request_id}")))
}

pub fn save_withdrawal_request(tx: &Transaction<'_>, request: &WithdrawalRequest) -> FundResult<()> {
    tx.execute(
        "UPDATE fund_withdrawal_requests SET
            shares_filled = ?2,
            usdc_paid = ?3,
            status = ?4,
            updated_at = ?5
         WHERE id = ?1",
        params![
            request.id,
            request.shares_filled,
            request.usdc_paid,
            request.status,
            request.updated_at,
        ],
    )?;
    Ok(())
}

/// Oldest first, so processing is first-come first-served.
pub fn list_withdrawal_requests(
    conn: &Connection,
    fund_id: u64,
    open_only: bool,
) -> FundResult<Vec<WithdrawalRequest>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {REQUEST_COLUMNS} FROM fund_withdrawal_requests
         WHERE fund_id = ?1 AND (?2 = 0 OR status IN ('pending', 'partially_filled'))
         ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map(params![fund_id, open_only], request_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert_activity(tx: &Transaction<'_>, record: &ActivityRecord) -> FundResult<()> {
    tx.execute(
        "INSERT INTO fund_activity (id, fund_id, ts, kind, wallet, amount_usdc, shares, fee_usdc, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id,
            record.fund_id,
            record.ts,
            record.kind,
            record.wallet,
            record.amount_usdc,
            record.shares,
            record.fee_usdc,
            record.detail,
        ],
    )?;
    Ok(())
}

pub fn list_activity(
    conn: &Connection,
    fund_id: u64,
    wallet: Option<&str>,
    limit: usize,
) -> FundResult<Vec<ActivityRecord>> {
    let limit = limit.clamp(1, 5_000) as i64;
    let mut stmt = conn.prepare_cached(
        "SELECT id, fund_id, ts, kind, wallet, amount_usdc, shares, fee_usdc, detail
         FROM fund_activity
         WHERE fund_id = ?1 AND (?2 IS NULL OR wallet = ?2)
         ORDER BY ts DESC, rowid DESC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![fund_id, wallet, limit], |row| {
        Ok(ActivityRecord {
            id: row.get(0)?,
            fund_id: row.get(1)?,
            ts: row.get(2)?,
            kind: row.get(3)?,
            wallet: row.get(4)?,
            amount_usdc: row.get(5)?,
            shares: row.get(6)?,
            fee_usdc: row.get(7)?,
            detail: row.get(8)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fund::testing::new_fund;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn funds_survive_reopen() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let db = FundDb::new(&path).unwrap();
        db.write(|tx| insert_fund(tx, &new_fund(9), 100)).await.unwrap();
        drop(db);

        let db = FundDb::new(&path).unwrap();
        let fund = db.read(|conn| load_fund(conn, 9)).await.unwrap();
        assert_eq!(fund.stage, FundStage::Open);
        assert_eq!(fund.fees, new_fund(9).fees);
        assert_eq!(fund.created_at, 100);
        assert!(!fund.perf_fee_paid);
    }

    #[tokio::test]
    async fn duplicate_fund_id_or_address_is_rejected() {
        let db = FundDb::in_memory().unwrap();
        db.write(|tx| insert_fund(tx, &new_fund(1), 0)).await.unwrap();

        let err = db.write(|tx| insert_fund(tx, &new_fund(1), 0)).await.unwrap_err();
        assert!(matches!(err, FundError::Validation(_)));

        let mut same_address = new_fund(2);
        same_address.address = new_fund(1).address;
        let err = db
            .write(|tx| insert_fund(tx, &same_address, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, FundError::Validation(_)));
    }

    #[tokio::test]
    async fn list_funds_filters_by_stage() {
        let db = FundDb::in_memory().unwrap();
        db.write(|tx| {
            insert_fund(tx, &new_fund(1), 0)?;
            let mut f = insert_fund(tx, &new_fund(2), 0)?;
            f.stage = FundStage::Trading;
            save_fund_state(tx, &f, 1)
        })
        .await
        .unwrap();

        let trading = db
            .read(|conn| list_funds(conn, Some(FundStage::Trading), None, 50))
            .await
            .unwrap();
        assert_eq!(trading.len(), 1);
        assert_eq!(trading[0].fund_id, 2);
        let all = db.read(|conn| list_funds(conn, None, None, 50)).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn depositor_upsert_and_share_sum() {
        let db = FundDb::in_memory().unwrap();
        db.write(|tx| {
            insert_fund(tx, &new_fund(1), 0)?;
            let mut a = Depositor::new(1, "0xaaa", 0);
            a.shares = 70;
            save_depositor(tx, &a)?;
            let mut b = Depositor::new(1, "0xbbb", 0);
            b.shares = 30;
            b.pending_withdrawal_shares = 10;
            save_depositor(tx, &b)?;
            a.shares = 75;
            save_depositor(tx, &a)
        })
        .await
        .unwrap();

        let (sum, b, all) = db
            .read(|conn| {
                Ok((
                    sum_depositor_shares(conn, 1)?,
                    load_depositor(conn, 1, "0xbbb")?,
                    list_depositors(conn, 1)?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(sum, 105);
        assert_eq!(b.unwrap().available_shares(), 20);
        assert_eq!(all[0].wallet, "0xaaa");
    }

    #[tokio::test]
    async fn withdrawal_requests_round_trip_status() {
        let db = FundDb::in_memory().unwrap();
        let req = db
            .write(|tx| {
                insert_fund(tx, &new_fund(1), 0)?;
                insert_withdrawal_request(tx, 1, "0xaaa", 500, 1_100_000, 10)
            })
            .await
            .unwrap();

        db.write(|tx| {
            let mut r = load_withdrawal_request(tx, 1, req.id)?;
            r.shares_filled = 500;
            r.usdc_paid = 550;
            r.status = RequestStatus::Completed;
            save_withdrawal_request(tx, &r)
        })
        .await
        .unwrap();

        let (open, all) = db
            .read(|conn| {
                Ok((
                    list_withdrawal_requests(conn, 1, true)?,
                    list_withdrawal_requests(conn, 1, false)?,
                ))
            })
            .await
            .unwrap();
        assert!(open.is_empty());
        assert_eq!(all[0].status, RequestStatus::Completed);
        assert_eq!(all[0].remaining_shares(), 0);
    }

    #[tokio::test]
    async fn activity_filters_by_wallet() {
        let db = FundDb::in_memory().unwrap();
        db.write(|tx| {
            insert_fund(tx, &new_fund(1), 0)?;
            insert_activity(tx, &ActivityRecord::new(1, ActivityKind::FundCreated, 1))?;
            insert_activity(
                tx,
                &ActivityRecord::new(1, ActivityKind::Deposit, 2)
                    .wallet("0xaaa")
                    .amount(10)
                    .shares(10)
                    .fee(0),
            )
        })
        .await
        .unwrap();

        let mine = db
            .read(|conn| list_activity(conn, 1, Some("0xaaa"), 10))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].kind, ActivityKind::Deposit);
        let all = db.read(|conn| list_activity(conn, 1, None, 10)).await.unwrap();
        assert_eq!(all[0].kind, ActivityKind::Deposit);
        assert_eq!(all.len(), 2);
    }
}
