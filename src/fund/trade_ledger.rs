//! Position & trade ledger.
//!
//! Fills come from the external execution path; this only folds them into
//! per-market positions. Prices are micro-USDC per outcome token of the side
//! held, so a YES and a NO position are both long their own token.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{FundError, FundResult};
use super::money::{self, MICROS};
use crate::markets::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeSide {
    Yes,
    No,
}

impl OutcomeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeSide::Yes => "YES",
            OutcomeSide::No => "NO",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "YES" => Some(OutcomeSide::Yes),
            "NO" => Some(OutcomeSide::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Buy => "BUY",
            TradeDirection::Sell => "SELL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(TradeDirection::Buy),
            "SELL" => Some(TradeDirection::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub fund_id: u64,
    pub venue: Venue,
    pub market_id: String,
    pub side: OutcomeSide,
    pub quantity: u64,
    pub avg_price: u64,
    pub current_price: u64,
    pub updated_at: i64,
}

impl Position {
    pub fn empty(fund_id: u64, venue: Venue, market_id: &str, side: OutcomeSide) -> Self {
        Self {
            fund_id,
            venue,
            market_id: market_id.to_string(),
            side,
            quantity: 0,
            avg_price: 0,
            current_price: 0,
            updated_at: 0,
        }
    }

    /// `(current - avg) * qty`, in micro-USDC.
    pub fn unrealized_pnl(&self) -> i128 {
        (self.current_price as i128 - self.avg_price as i128) * self.quantity as i128
            / MICROS as i128
    }

    pub fn market_value(&self) -> FundResult<u64> {
        money::shares_to_usdc(self.quantity, self.current_price)
    }

    pub fn is_open(&self) -> bool {
        self.quantity > 0
    }
}

/// An executed fill as reported by the execution path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeFill {
    pub venue: Venue,
    pub market_id: String,
    pub side: OutcomeSide,
    pub direction: TradeDirection,
    pub quantity: u64,
    pub price: u64,
    pub fee: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub id: String,
    pub fund_id: u64,
    pub venue: Venue,
    pub market_id: String,
    pub side: OutcomeSide,
    pub direction: TradeDirection,
    pub quantity: u64,
    pub price: u64,
    pub fee: u64,
    pub ts: i64,
}

pub fn validate_price(price: u64) -> FundResult<()> {
    if price == 0 || price > MICROS {
        return Err(FundError::validation(
            "price must be within (0, 1000000] micro-USDC",
        ));
    }
    Ok(())
}

impl TradeFill {
    pub fn validate(&self) -> FundResult<()> {
        if self.market_id.trim().is_empty() {
            return Err(FundError::validation("market_id required"));
        }
        if self.quantity == 0 {
            return Err(FundError::validation("trade quantity must be greater than zero"));
        }
        validate_price(self.price)
    }
}

/// Fold a fill into the matching position. Buys re-average the entry price,
/// sells leave it unchanged. Either way the mark moves to the fill price.
pub fn apply_fill(mut position: Position, fill: &TradeFill, now: i64) -> FundResult<Position> {
    fill.validate()?;
    match fill.direction {
        TradeDirection::Buy => {
            let new_qty = money::checked_add(position.quantity, fill.quantity)?;
            let cost = (position.avg_price as u128) * (position.quantity as u128)
                + (fill.price as u128) * (fill.quantity as u128);
            position.avg_price = (cost / new_qty as u128) as u64;
            position.quantity = new_qty;
        }
        TradeDirection::Sell => {
            if fill.quantity > position.quantity {
                return Err(FundError::InsufficientShares {
                    requested: fill.quantity,
                    available: position.quantity,
                });
            }
            position.quantity -= fill.quantity;
        }
    }
    position.current_price = fill.price;
    position.updated_at = now;
    Ok(position)
}

pub(crate) fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fund_positions (
            fund_id INTEGER NOT NULL REFERENCES funds(fund_id),
            venue TEXT NOT NULL,
            market_id TEXT NOT NULL,
            side TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            avg_price INTEGER NOT NULL,
            current_price INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (fund_id, venue, market_id, side)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fund_trades (
            id TEXT PRIMARY KEY,
            fund_id INTEGER NOT NULL REFERENCES funds(fund_id),
            venue TEXT NOT NULL,
            market_id TEXT NOT NULL,
            side TEXT NOT NULL,
            direction TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            price INTEGER NOT NULL,
            fee INTEGER NOT NULL,
            ts INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fund_trades_fund_ts ON fund_trades(fund_id, ts DESC)",
        [],
    )?;
    Ok(())
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        fund_id: row.get(0)?,
        venue: row.get(1)?,
        market_id: row.get(2)?,
        side: row.get(3)?,
        quantity: row.get(4)?,
        avg_price: row.get(5)?,
        current_price: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: row.get(0)?,
        fund_id: row.get(1)?,
        venue: row.get(2)?,
        market_id: row.get(3)?,
        side: row.get(4)?,
        direction: row.get(5)?,
        quantity: row.get(6)?,
        price: row.get(7)?,
        fee: row.get(8)?,
        ts: row.get(9)?,
    })
}

pub fn load_position(
    conn: &Connection,
    fund_id: u64,
    venue: Venue,
    market_id: &str,
    side: OutcomeSide,
) -> FundResult<Option<Position>> {
    let mut stmt = conn.prepare_cached(
        "SELECT fund_id, venue, market_id, side, quantity, avg_price, current_price, updated_at
         FROM fund_positions
         WHERE fund_id = ?1 AND venue = ?2 AND market_id = ?3 AND side = ?4",
    )?;
    Ok(stmt
        .query_row(params![fund_id, venue, market_id, side], position_from_row)
        .optional()?)
}

pub fn save_position(tx: &Transaction<'_>, position: &Position) -> FundResult<()> {
    tx.execute(
        "INSERT INTO fund_positions (fund_id, venue, market_id, side, quantity, avg_price, current_price, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(fund_id, venue, market_id, side) DO UPDATE SET
            quantity = excluded.quantity,
            avg_price = excluded.avg_price,
            current_price = excluded.current_price,
            updated_at = excluded.updated_at",
        params![
            position.fund_id,
            position.venue,
            position.market_id,
            position.side,
            position.quantity,
            position.avg_price,
            position.current_price,
            position.updated_at,
        ],
    )?;
    Ok(())
}

pub fn list_positions(
    conn: &Connection,
    fund_id: u64,
    open_only: bool,
) -> FundResult<Vec<Position>> {
    let mut stmt = conn.prepare_cached(
        "SELECT fund_id, venue, market_id, side, quantity, avg_price, current_price, updated_at
         FROM fund_positions
         WHERE fund_id = ?1 AND (?2 = 0 OR quantity > 0)
         ORDER BY updated_at DESC, market_id ASC",
    )?;
    let rows = stmt.query_map(params![fund_id, open_only], position_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn open_position_count(conn: &Connection, fund_id: u64) -> FundResult<u64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM fund_positions WHERE fund_id = ?1 AND quantity > 0",
        params![fund_id],
        |row| row.get(0),
    )?)
}

pub fn list_trades(conn: &Connection, fund_id: u64, limit: usize) -> FundResult<Vec<Trade>> {
    let limit = limit.clamp(1, 5_000) as i64;
    let mut stmt = conn.prepare_cached(
        "SELECT id, fund_id, venue, market_id, side, direction, quantity, price, fee, ts
         FROM fund_trades
         WHERE fund_id = ?1
         ORDER BY ts DESC, rowid DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![fund_id, limit], trade_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Fold a fill into its position and append the trade, inside `tx`.
pub fn record_fill(
    tx: &Transaction<'_>,
    fund_id: u64,
    fill: &TradeFill,
    now_ms: i64,
) -> FundResult<(Trade, Position)> {
    let market_id = fill.market_id.trim();
    let current = load_position(tx, fund_id, fill.venue, market_id, fill.side)?
        .unwrap_or_else(|| Position::empty(fund_id, fill.venue, market_id, fill.side));
    let position = apply_fill(current, fill, now_ms)?;
    save_position(tx, &position)?;

    let trade = Trade {
        id: Uuid::new_v4().to_string(),
        fund_id,
        venue: fill.venue,
        market_id: market_id.to_string(),
        side: fill.side,
        direction: fill.direction,
        quantity: fill.quantity,
        price: fill.price,
        fee: fill.fee,
        ts: now_ms,
    };
    tx.execute(
        "INSERT INTO fund_trades (id, fund_id, venue, market_id, side, direction, quantity, price, fee, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            trade.id,
            trade.fund_id,
            trade.venue,
            trade.market_id,
            trade.side,
            trade.direction,
            trade.quantity,
            trade.price,
            trade.fee,
            trade.ts,
        ],
    )?;
    Ok((trade, position))
}

/// Move the mark of an existing position without trading.
pub fn mark_position(
    tx: &Transaction<'_>,
    fund_id: u64,
    venue: Venue,
    market_id: &str,
    side: OutcomeSide,
    price: u64,
    now_ms: i64,
) -> FundResult<Position> {
    validate_price(price)?;
    let mut position = load_position(tx, fund_id, venue, market_id, side)?.ok_or_else(|| {
        FundError::not_found(format!("position {venue}/{market_id}/{}", side.as_str()))
    })?;
    position.current_price = price;
    position.updated_at = now_ms;
    save_position(tx, &position)?;
    Ok(position)
}
