use crate::error::{CoinflipError, Result};
use crate::storage::{millis_at, to_millis, Storage};
use crate::types::{CoinAccount, CoinTransaction, TransactionKind, TxReference};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

/// A committed (or about to be committed) balance mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDelta {
    pub user_id: String,
    pub amount: i64,
    pub new_balance: i64,
    pub tx_id: String,
}

pub struct LedgerStore<'a> {
    storage: &'a Storage,
}

impl<'a> LedgerStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Fetch the account, creating it with the welcome bonus on first access.
    pub async fn get_or_create_account(
        &self,
        user_id: &str,
        starting_balance: i64,
        now: DateTime<Utc>,
    ) -> Result<(CoinAccount, Option<AppliedDelta>)> {
        let mut conn = self.storage.get_connection().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let bonus = Self::ensure_account_in(&tx, user_id, starting_balance, now)?;
        let account = Self::account_in(&tx, user_id)?
            .ok_or_else(|| CoinflipError::internal(format!("Account vanished: {}", user_id)))?;

        tx.commit()?;
        Ok((account, bonus))
    }

    /// Apply a signed delta as one atomic unit. Returns every balance change
    /// committed, which includes the welcome bonus if the account was new.
    pub async fn apply_delta(
        &self,
        user_id: &str,
        amount: i64,
        kind: TransactionKind,
        reference: Option<&TxReference>,
        starting_balance: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppliedDelta>> {
        let mut conn = self.storage.get_connection().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut applied = Vec::with_capacity(2);
        if let Some(bonus) = Self::ensure_account_in(&tx, user_id, starting_balance, now)? {
            applied.push(bonus);
        }
        applied.push(Self::apply_delta_in(
            &tx, user_id, amount, kind, reference, now,
        )?);

        tx.commit()?;
        Ok(applied)
    }

    pub async fn get_account(&self, user_id: &str) -> Result<Option<CoinAccount>> {
        let conn = self.storage.get_connection().await;
        Self::account_in(&conn, user_id)
    }

    pub async fn list_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CoinTransaction>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT id, user_id, amount, kind, reference_type, reference_id, balance_after, created_at
             FROM coin_transactions WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;

        let tx_iter = stmt.query_map(params![user_id, limit as i64], row_to_transaction)?;

        let mut transactions = Vec::new();
        for tx in tx_iter {
            transactions.push(tx?);
        }

        Ok(transactions)
    }

    /// Sum of every ledger entry for the user.
    pub async fn ledger_sum(&self, user_id: &str) -> Result<i64> {
        let conn = self.storage.get_connection().await;

        let sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM coin_transactions WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;

        Ok(sum)
    }

    /// Insert the account if absent. Creation happens at most once per user;
    /// only the inserting caller books the welcome bonus.
    pub(crate) fn ensure_account_in(
        conn: &Connection,
        user_id: &str,
        starting_balance: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<AppliedDelta>> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO coin_accounts
             (user_id, balance, total_earned, total_spent, created_at, updated_at)
             VALUES (?1, 0, 0, 0, ?2, ?2)",
            params![user_id, to_millis(now)],
        )?;

        if inserted == 0 || starting_balance == 0 {
            return Ok(None);
        }

        tracing::info!(
            "Created coin account for {} with welcome bonus of {}",
            user_id,
            starting_balance
        );
        let bonus = Self::apply_delta_in(
            conn,
            user_id,
            starting_balance,
            TransactionKind::Bonus,
            None,
            now,
        )?;
        Ok(Some(bonus))
    }

    /// Guarded in-place increment plus one ledger row. Must run inside a
    /// transaction together with whatever else the caller writes.
    pub(crate) fn apply_delta_in(
        conn: &Connection,
        user_id: &str,
        amount: i64,
        kind: TransactionKind,
        reference: Option<&TxReference>,
        now: DateTime<Utc>,
    ) -> Result<AppliedDelta> {
        if amount == 0 {
            return Err(CoinflipError::validation("Delta amount cannot be zero"));
        }

        let (earned, spent) = if amount > 0 { (amount, 0) } else { (0, -amount) };
        let now_ms = to_millis(now);

        let updated = conn.execute(
            "UPDATE coin_accounts
             SET balance = balance + ?1,
                 total_earned = total_earned + ?2,
                 total_spent = total_spent + ?3,
                 updated_at = ?4
             WHERE user_id = ?5 AND balance + ?1 >= 0",
            params![amount, earned, spent, now_ms, user_id],
        )?;

        if updated == 0 {
            let available: Option<i64> = conn
                .query_row(
                    "SELECT balance FROM coin_accounts WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;

            return match available {
                Some(available) => Err(CoinflipError::InsufficientFunds {
                    need: -amount,
                    available,
                }),
                None => Err(CoinflipError::internal(format!(
                    "No coin account for {}",
                    user_id
                ))),
            };
        }

        let new_balance: i64 = conn.query_row(
            "SELECT balance FROM coin_accounts WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;

        let tx_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO coin_transactions
             (id, user_id, amount, kind, reference_type, reference_id, balance_after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tx_id,
                user_id,
                amount,
                kind,
                reference.map(|r| r.kind_str()),
                reference.map(|r| r.id()),
                new_balance,
                now_ms,
            ],
        )?;

        Ok(AppliedDelta {
            user_id: user_id.to_string(),
            amount,
            new_balance,
            tx_id,
        })
    }

    pub(crate) fn account_in(conn: &Connection, user_id: &str) -> Result<Option<CoinAccount>> {
        let account = conn
            .query_row(
                "SELECT user_id, balance, total_earned, total_spent, created_at, updated_at
                 FROM coin_accounts WHERE user_id = ?1",
                params![user_id],
                row_to_account,
            )
            .optional()?;

        Ok(account)
    }
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<CoinAccount> {
    Ok(CoinAccount {
        user_id: row.get(0)?,
        balance: row.get(1)?,
        total_earned: row.get(2)?,
        total_spent: row.get(3)?,
        created_at: millis_at(row, 4)?,
        updated_at: millis_at(row, 5)?,
    })
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<CoinTransaction> {
    Ok(CoinTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        kind: row.get(3)?,
        reference: TxReference::from_parts(row.get(4)?, row.get(5)?),
        balance_after: row.get(6)?,
        created_at: millis_at(row, 7)?,
    })
}
