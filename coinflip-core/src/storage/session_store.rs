use crate::error::{CoinflipError, Result};
use crate::storage::{millis_at, to_millis, Storage};
use crate::types::{GameSession, Phase, PhaseDurations};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SESSION_COLUMNS: &str = "id, is_active, phase, phase_started_at, phase_ends_at,
     betting_ms, flipping_ms, result_ms, waiting_ms, current_round_id";

/// Explicit reference to the session a scheduler drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    id: String,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// The state a transition moves the session into.
#[derive(Debug, Clone)]
pub(crate) struct PhaseChange<'r> {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub round_id: Option<&'r str>,
}

pub struct SessionStore<'a> {
    storage: &'a Storage,
}

impl<'a> SessionStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Return the active session, creating one in `Waiting` (already due) if
    /// none exists. Durations are refreshed from `durations`.
    pub async fn ensure_active(
        &self,
        durations: &PhaseDurations,
        now: DateTime<Utc>,
    ) -> Result<(SessionHandle, GameSession)> {
        let mut conn = self.storage.get_connection().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let session = match Self::active_in(&tx)? {
            Some(existing) => {
                tx.execute(
                    "UPDATE game_sessions
                     SET betting_ms = ?1, flipping_ms = ?2, result_ms = ?3, waiting_ms = ?4
                     WHERE id = ?5",
                    params![
                        durations.betting_ms as i64,
                        durations.flipping_ms as i64,
                        durations.result_ms as i64,
                        durations.waiting_ms as i64,
                        existing.id,
                    ],
                )?;
                tracing::info!(
                    "Resuming game session {} in phase {}",
                    existing.id,
                    existing.phase
                );
                GameSession {
                    durations: durations.clone(),
                    ..existing
                }
            }
            None => {
                let session = GameSession {
                    id: Uuid::new_v4().to_string(),
                    is_active: true,
                    phase: Phase::Waiting,
                    phase_started_at: now,
                    phase_ends_at: now,
                    durations: durations.clone(),
                    current_round_id: None,
                };
                tx.execute(
                    "INSERT INTO game_sessions
                     (id, is_active, phase, phase_started_at, phase_ends_at,
                      betting_ms, flipping_ms, result_ms, waiting_ms, current_round_id)
                     VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                    params![
                        session.id,
                        session.phase,
                        to_millis(session.phase_started_at),
                        to_millis(session.phase_ends_at),
                        durations.betting_ms as i64,
                        durations.flipping_ms as i64,
                        durations.result_ms as i64,
                        durations.waiting_ms as i64,
                    ],
                )?;
                tracing::info!("Created game session {}", session.id);
                session
            }
        };

        tx.commit()?;

        let handle = SessionHandle {
            id: session.id.clone(),
        };
        Ok((handle, session))
    }

    pub async fn load(&self, handle: &SessionHandle) -> Result<GameSession> {
        let conn = self.storage.get_connection().await;
        Self::session_in(&conn, handle)
    }

    pub(crate) fn session_in(conn: &Connection, handle: &SessionHandle) -> Result<GameSession> {
        conn.query_row(
            &format!(
                "SELECT {} FROM game_sessions WHERE id = ?1 AND is_active = 1",
                SESSION_COLUMNS
            ),
            params![handle.id],
            row_to_session,
        )
        .optional()?
        .ok_or(CoinflipError::NoActiveSession)
    }

    fn active_in(conn: &Connection) -> Result<Option<GameSession>> {
        let session = conn
            .query_row(
                &format!(
                    "SELECT {} FROM game_sessions WHERE is_active = 1",
                    SESSION_COLUMNS
                ),
                [],
                row_to_session,
            )
            .optional()?;

        Ok(session)
    }

    /// Compare-and-swap the phase. Succeeds only if the row still holds the
    /// phase and deadline `expected` was read with, and that deadline has
    /// passed at `now`.
    pub(crate) fn advance_in(
        conn: &Connection,
        expected: &GameSession,
        change: &PhaseChange<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = conn.execute(
            "UPDATE game_sessions
             SET phase = ?1, phase_started_at = ?2, phase_ends_at = ?3, current_round_id = ?4
             WHERE id = ?5 AND is_active = 1
               AND phase = ?6 AND phase_ends_at = ?7 AND phase_ends_at <= ?8",
            params![
                change.phase,
                to_millis(change.started_at),
                to_millis(change.ends_at),
                change.round_id,
                expected.id,
                expected.phase,
                to_millis(expected.phase_ends_at),
                to_millis(now),
            ],
        )?;

        Ok(updated == 1)
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<GameSession> {
    let betting_ms: i64 = row.get(5)?;
    let flipping_ms: i64 = row.get(6)?;
    let result_ms: i64 = row.get(7)?;
    let waiting_ms: i64 = row.get(8)?;

    Ok(GameSession {
        id: row.get(0)?,
        is_active: row.get(1)?,
        phase: row.get(2)?,
        phase_started_at: millis_at(row, 3)?,
        phase_ends_at: millis_at(row, 4)?,
        durations: PhaseDurations {
            betting_ms: betting_ms as u64,
            flipping_ms: flipping_ms as u64,
            result_ms: result_ms as u64,
            waiting_ms: waiting_ms as u64,
        },
        current_round_id: row.get(9)?,
    })
}
