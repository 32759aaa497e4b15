use crate::error::{CoinflipError, Result};
use crate::storage::{is_unique_violation, millis_at, opt_millis_at, to_millis, Storage};
use crate::types::{Bet, Round, Side};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const BET_COLUMNS: &str =
    "id, round_id, user_id, side, stake, is_winner, payout, created_at";

pub struct RoundStore<'a> {
    storage: &'a Storage,
}

impl<'a> RoundStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn open_round(&self, betting_duration: Duration, now: DateTime<Utc>) -> Result<Round> {
        let conn = self.storage.get_connection().await;
        Self::open_round_in(&conn, betting_duration, now)
    }

    /// Set the outcome once. A second call fails with `AlreadySettled`.
    pub async fn record_outcome(
        &self,
        round_id: &str,
        outcome: Side,
        now: DateTime<Utc>,
    ) -> Result<Round> {
        let conn = self.storage.get_connection().await;
        Self::record_outcome_in(&conn, round_id, outcome, now)
    }

    pub async fn get_round(&self, round_id: &str) -> Result<Option<Round>> {
        let conn = self.storage.get_connection().await;
        Self::round_in(&conn, round_id)
    }

    pub async fn list_bets(&self, round_id: &str) -> Result<Vec<Bet>> {
        let conn = self.storage.get_connection().await;
        Self::bets_in(&conn, round_id, false)
    }

    /// Bets whose settlement has not been written yet.
    pub async fn unsettled_bets(&self, round_id: &str) -> Result<Vec<Bet>> {
        let conn = self.storage.get_connection().await;
        Self::bets_in(&conn, round_id, true)
    }

    pub async fn get_bet(&self, bet_id: &str) -> Result<Option<Bet>> {
        let conn = self.storage.get_connection().await;

        let bet = conn
            .query_row(
                &format!("SELECT {} FROM bets WHERE id = ?1", BET_COLUMNS),
                params![bet_id],
                row_to_bet,
            )
            .optional()?;

        Ok(bet)
    }

    pub async fn recent_rounds(&self, limit: usize) -> Result<Vec<Round>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT id, started_at, betting_ends_at, outcome, ended_at
             FROM rounds ORDER BY started_at DESC, rowid DESC LIMIT ?1",
        )?;

        let round_iter = stmt.query_map(params![limit as i64], row_to_round)?;

        let mut rounds = Vec::new();
        for round in round_iter {
            rounds.push(round?);
        }

        Ok(rounds)
    }

    pub async fn list_user_bets(&self, user_id: &str, limit: usize) -> Result<Vec<Bet>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM bets WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            BET_COLUMNS
        ))?;

        let bet_iter = stmt.query_map(params![user_id, limit as i64], row_to_bet)?;

        let mut bets = Vec::new();
        for bet in bet_iter {
            bets.push(bet?);
        }

        Ok(bets)
    }

    pub(crate) fn open_round_in(
        conn: &Connection,
        betting_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Round> {
        let round = Round {
            id: Uuid::new_v4().to_string(),
            started_at: now,
            betting_ends_at: now + betting_duration,
            outcome: None,
            ended_at: None,
        };

        conn.execute(
            "INSERT INTO rounds (id, started_at, betting_ends_at, outcome, ended_at)
             VALUES (?1, ?2, ?3, NULL, NULL)",
            params![
                round.id,
                to_millis(round.started_at),
                to_millis(round.betting_ends_at),
            ],
        )?;

        tracing::info!(
            "Opened round {} (betting until {})",
            round.id,
            round.betting_ends_at
        );
        Ok(round)
    }

    pub(crate) fn record_outcome_in(
        conn: &Connection,
        round_id: &str,
        outcome: Side,
        now: DateTime<Utc>,
    ) -> Result<Round> {
        let updated = conn.execute(
            "UPDATE rounds SET outcome = ?1, ended_at = ?2
             WHERE id = ?3 AND outcome IS NULL",
            params![outcome, to_millis(now), round_id],
        )?;

        if updated == 0 {
            return match Self::round_in(conn, round_id)? {
                Some(_) => Err(CoinflipError::AlreadySettled(round_id.to_string())),
                None => Err(CoinflipError::RoundNotFound(round_id.to_string())),
            };
        }

        Self::round_in(conn, round_id)?
            .ok_or_else(|| CoinflipError::RoundNotFound(round_id.to_string()))
    }

    pub(crate) fn round_in(conn: &Connection, round_id: &str) -> Result<Option<Round>> {
        let round = conn
            .query_row(
                "SELECT id, started_at, betting_ends_at, outcome, ended_at
                 FROM rounds WHERE id = ?1",
                params![round_id],
                row_to_round,
            )
            .optional()?;

        Ok(round)
    }

    pub(crate) fn bets_in(conn: &Connection, round_id: &str, unsettled_only: bool) -> Result<Vec<Bet>> {
        let filter = if unsettled_only {
            " AND is_winner IS NULL"
        } else {
            ""
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM bets WHERE round_id = ?1{} ORDER BY created_at ASC, rowid ASC",
            BET_COLUMNS, filter
        ))?;

        let bet_iter = stmt.query_map(params![round_id], row_to_bet)?;

        let mut bets = Vec::new();
        for bet in bet_iter {
            bets.push(bet?);
        }

        Ok(bets)
    }

    pub(crate) fn has_bet_in(conn: &Connection, round_id: &str, user_id: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bets WHERE round_id = ?1 AND user_id = ?2",
            params![round_id, user_id],
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }

    pub(crate) fn insert_bet_in(conn: &Connection, bet: &Bet) -> Result<()> {
        let result = conn.execute(
            "INSERT INTO bets (id, round_id, user_id, side, stake, is_winner, payout, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6)",
            params![
                bet.id,
                bet.round_id,
                bet.user_id,
                bet.side,
                bet.stake,
                to_millis(bet.created_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CoinflipError::DuplicateBet {
                round_id: bet.round_id.clone(),
                user_id: bet.user_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a bet's result. Returns false when the bet was already settled.
    pub(crate) fn settle_bet_in(
        conn: &Connection,
        bet_id: &str,
        is_winner: bool,
        payout: i64,
    ) -> Result<bool> {
        let updated = conn.execute(
            "UPDATE bets SET is_winner = ?1, payout = ?2 WHERE id = ?3 AND is_winner IS NULL",
            params![is_winner, payout, bet_id],
        )?;

        Ok(updated == 1)
    }
}

fn row_to_round(row: &Row<'_>) -> rusqlite::Result<Round> {
    Ok(Round {
        id: row.get(0)?,
        started_at: millis_at(row, 1)?,
        betting_ends_at: millis_at(row, 2)?,
        outcome: row.get(3)?,
        ended_at: opt_millis_at(row, 4)?,
    })
}

fn row_to_bet(row: &Row<'_>) -> rusqlite::Result<Bet> {
    Ok(Bet {
        id: row.get(0)?,
        round_id: row.get(1)?,
        user_id: row.get(2)?,
        side: row.get(3)?,
        stake: row.get(4)?,
        is_winner: row.get(5)?,
        payout: row.get(6)?,
        created_at: millis_at(row, 7)?,
    })
}
