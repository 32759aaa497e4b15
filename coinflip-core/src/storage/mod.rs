pub mod ledger_store;
pub mod round_store;
pub mod session_store;

pub use ledger_store::LedgerStore;
pub use round_store::RoundStore;
pub use session_store::SessionStore;

use crate::error::{CoinflipError, Result};
use crate::types::{Phase, Side, TransactionKind};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, Row};
use std::path::Path;
use tokio::sync::Mutex;

/// Single SQLite connection shared by every store. Holding the guard is what
/// serialises writers; multi-statement effects additionally run inside a
/// transaction so they are all-or-nothing.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CoinflipError::internal(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path)?;
        Self::from_connection(conn).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // Rounds table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS rounds (
                id TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL,
                betting_ends_at INTEGER NOT NULL,
                outcome TEXT,
                ended_at INTEGER
            )",
            [],
        )?;

        // Game session table, at most one active row
        conn.execute(
            "CREATE TABLE IF NOT EXISTS game_sessions (
                id TEXT PRIMARY KEY,
                is_active INTEGER NOT NULL,
                phase TEXT NOT NULL,
                phase_started_at INTEGER NOT NULL,
                phase_ends_at INTEGER NOT NULL,
                betting_ms INTEGER NOT NULL,
                flipping_ms INTEGER NOT NULL,
                result_ms INTEGER NOT NULL,
                waiting_ms INTEGER NOT NULL,
                current_round_id TEXT,
                FOREIGN KEY (current_round_id) REFERENCES rounds(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_game_sessions_active
             ON game_sessions(is_active) WHERE is_active = 1",
            [],
        )?;

        // Bets table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS bets (
                id TEXT PRIMARY KEY,
                round_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                side TEXT NOT NULL,
                stake INTEGER NOT NULL CHECK (stake > 0),
                is_winner INTEGER,
                payout INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (round_id) REFERENCES rounds(id),
                UNIQUE (round_id, user_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bets_user ON bets(user_id, created_at)",
            [],
        )?;

        // Coin accounts table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS coin_accounts (
                user_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL CHECK (balance >= 0),
                total_earned INTEGER NOT NULL,
                total_spent INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Coin ledger, append-only
        conn.execute(
            "CREATE TABLE IF NOT EXISTS coin_transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                kind TEXT NOT NULL,
                reference_type TEXT,
                reference_id TEXT,
                balance_after INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES coin_accounts(user_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_coin_transactions_user
             ON coin_transactions(user_id, created_at)",
            [],
        )?;

        Ok(())
    }

    pub async fn get_connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Read a millisecond timestamp column. Values outside chrono's range are a
/// conversion error, never a substitute time.
pub(crate) fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    decode_millis(ms, idx)
}

pub(crate) fn opt_millis_at(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| decode_millis(ms, idx)).transpose()
}

fn decode_millis(ms: i64, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            Box::new(FromSqlError::OutOfRange(ms)),
        )
    })
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|_| FromSqlError::InvalidType)
            }
        }
    };
}

sql_text_enum!(Side);
sql_text_enum!(Phase);
sql_text_enum!(TransactionKind);
