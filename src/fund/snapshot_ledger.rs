//! Append-only snapshot ledger.
//!
//! Nothing updates or deletes rows in `fund_snapshots`. Appends take a
//! `Transaction` so they always commit together with the balance changes they
//! describe. `seq` gives the total order; `ts` is kept
//! non-decreasing per fund.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};

use super::accounting::Aggregates;
use super::error::{FundError, FundResult};
use super::stage::FundStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Genesis,
    Deposit,
    Withdraw,
    QueuedWithdraw,
    StageChange,
    Indexer,
    Close,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Genesis => "genesis",
            SnapshotSource::Deposit => "deposit",
            SnapshotSource::Withdraw => "withdraw",
            SnapshotSource::QueuedWithdraw => "queued_withdraw",
            SnapshotSource::StageChange => "stage_change",
            SnapshotSource::Indexer => "indexer",
            SnapshotSource::Close => "close",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "genesis" => Some(SnapshotSource::Genesis),
            "deposit" => Some(SnapshotSource::Deposit),
            "withdraw" => Some(SnapshotSource::Withdraw),
            "queued_withdraw" => Some(SnapshotSource::QueuedWithdraw),
            "stage_change" => Some(SnapshotSource::StageChange),
            "indexer" => Some(SnapshotSource::Indexer),
            "close" => Some(SnapshotSource::Close),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub seq: i64,
    pub fund_id: u64,
    /// Unix millis.
    pub ts: i64,
    pub nav: u64,
    pub share_price: u64,
    pub tvl: u64,
    pub total_shares: u64,
    pub stage: FundStage,
    pub source: SnapshotSource,
}

impl Snapshot {
    pub fn aggregates(&self) -> Aggregates {
        Aggregates {
            nav: self.nav,
            share_price: self.share_price,
            tvl: self.tvl,
            total_shares: self.total_shares,
        }
    }
}

pub(crate) fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fund_snapshots (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            fund_id INTEGER NOT NULL REFERENCES funds(fund_id),
            ts INTEGER NOT NULL,
            nav INTEGER NOT NULL,
            share_price INTEGER NOT NULL,
            tvl INTEGER NOT NULL,
            total_shares INTEGER NOT NULL,
            stage TEXT NOT NULL,
            source TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fund_snapshots_fund_seq ON fund_snapshots(fund_id, seq DESC)",
        [],
    )?;
    Ok(())
}

const COLUMNS: &str = "seq, fund_id, ts, nav, share_price, tvl, total_shares, stage, source";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        seq: row.get(0)?,
        fund_id: row.get(1)?,
        ts: row.get(2)?,
        nav: row.get(3)?,
        share_price: row.get(4)?,
        tvl: row.get(5)?,
        total_shares: row.get(6)?,
        stage: row.get(7)?,
        source: row.get(8)?,
    })
}

pub fn append(
    tx: &Transaction<'_>,
    fund_id: u64,
    aggregates: Aggregates,
    stage: FundStage,
    source: SnapshotSource,
    now_ms: i64,
) -> FundResult<Snapshot> {
    let last_ts: Option<i64> = tx
        .query_row(
            "SELECT MAX(ts) FROM fund_snapshots WHERE fund_id = ?1",
            params![fund_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    let ts = last_ts.map_or(now_ms, |last| last.max(now_ms));

    tx.execute(
        "INSERT INTO fund_snapshots (fund_id, ts, nav, share_price, tvl, total_shares, stage, source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            fund_id,
            ts,
            aggregates.nav,
            aggregates.share_price,
            aggregates.tvl,
            aggregates.total_shares,
            stage,
            source,
        ],
    )?;

    Ok(Snapshot {
        seq: tx.last_insert_rowid(),
        fund_id,
        ts,
        nav: aggregates.nav,
        share_price: aggregates.share_price,
        tvl: aggregates.tvl,
        total_shares: aggregates.total_shares,
        stage,
        source,
    })
}

/// The authoritative current figures of a fund.
pub fn latest(conn: &Connection, fund_id: u64) -> FundResult<Snapshot> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM fund_snapshots WHERE fund_id = ?1 ORDER BY seq DESC LIMIT 1"
    ))?;
    stmt.query_row(params![fund_id], from_row)
        .optional()?
        .ok_or_else(|| FundError::not_found(format!("snapshots for fund {fund_id}")))
}

/// Newest first.
pub fn history(conn: &Connection, fund_id: u64, limit: usize) -> FundResult<Vec<Snapshot>> {
    let limit = limit.clamp(1, 20_000) as i64;
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM fund_snapshots WHERE fund_id = ?1 ORDER BY seq DESC LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![fund_id, limit], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
pub(crate) fn count(conn: &Connection, fund_id: u64) -> FundResult<u64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM fund_snapshots WHERE fund_id = ?1",
        params![fund_id],
        |row| row.get(0),
    )?)
}
