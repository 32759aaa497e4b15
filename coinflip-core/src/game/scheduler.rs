use crate::clock::Clock;
use crate::error::Result;
use crate::game::settlement::{SettlementEngine, SettlementResult};
use crate::notifier::{EventBus, GameEvent};
use crate::storage::session_store::{PhaseChange, SessionHandle};
use crate::storage::{RoundStore, SessionStore, Storage};
use crate::types::{GameStateView, Phase};
use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// One applied phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub round_id: Option<String>,
    pub phase_ends_at: DateTime<Utc>,
    pub settlement: Option<SettlementResult>,
}

/// Drives the active session through Betting -> Flipping -> Result -> Waiting.
pub struct PhaseScheduler {
    storage: Arc<Storage>,
    session: SessionHandle,
    settlement: Arc<SettlementEngine>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
}

impl PhaseScheduler {
    pub fn new(
        storage: Arc<Storage>,
        session: SessionHandle,
        settlement: Arc<SettlementEngine>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
    ) -> Self {
        Self {
            storage,
            session,
            settlement,
            clock,
            bus,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Apply at most one due transition. Timer ticks and cooperative
    /// advancement both come through here; the guarded swap makes concurrent
    /// callers at the same boundary resolve to a single transition.
    pub async fn tick(&self) -> Result<Option<Transition>> {
        let now = self.clock.now();

        let (from, previous_round_id, to, phase_ends_at, round_id) = {
            let mut conn = self.storage.get_connection().await;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let session = SessionStore::session_in(&tx, &self.session)?;
            if now < session.phase_ends_at {
                return Ok(None);
            }

            let next = session.phase.next();
            let phase_ends_at = now + session.durations.for_phase(next);

            let round_id = if next == Phase::Betting {
                let round = RoundStore::open_round_in(
                    &tx,
                    session.durations.for_phase(Phase::Betting),
                    now,
                )?;
                Some(round.id)
            } else {
                session.current_round_id.clone()
            };

            let change = PhaseChange {
                phase: next,
                started_at: now,
                ends_at: phase_ends_at,
                round_id: round_id.as_deref(),
            };
            if !SessionStore::advance_in(&tx, &session, &change, now)? {
                // Lost the race; dropping `tx` also discards any round we opened
                return Ok(None);
            }

            tx.commit()?;
            (
                session.phase,
                session.current_round_id,
                next,
                phase_ends_at,
                round_id,
            )
        };

        tracing::info!(
            "Session {} phase {} -> {} (until {})",
            self.session.id(),
            from,
            to,
            phase_ends_at
        );
        self.bus.publish(GameEvent::PhaseChanged {
            from,
            to,
            round_id: round_id.clone(),
            phase_ends_at,
        });

        let settlement = match to {
            Phase::Result => match round_id.as_deref() {
                Some(id) => self.settle_logged(id).await,
                None => None,
            },
            // Retry path for rounds whose settlement did not finish
            Phase::Waiting | Phase::Betting => match previous_round_id.as_deref() {
                Some(id) => self.retry_settlement(id).await,
                None => None,
            },
            Phase::Flipping => None,
        };

        Ok(Some(Transition {
            from,
            to,
            round_id,
            phase_ends_at,
            settlement,
        }))
    }

    /// Read-only snapshot of the session.
    pub async fn state(&self) -> Result<GameStateView> {
        let now = self.clock.now();
        let conn = self.storage.get_connection().await;

        let session = SessionStore::session_in(&conn, &self.session)?;
        let outcome = match session.current_round_id.as_deref() {
            Some(round_id) => RoundStore::round_in(&conn, round_id)?.and_then(|r| r.outcome),
            None => None,
        };

        let time_remaining = (session.phase_ends_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO);

        Ok(GameStateView {
            phase: session.phase,
            time_remaining,
            phase_ends_at: session.phase_ends_at,
            current_round_id: session.current_round_id,
            outcome,
        })
    }

    /// Fixed-interval driver. Runs until `shutdown` flips to true or its
    /// sender is dropped.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Phase scheduler started for session {} (every {:?})",
            self.session.id(),
            interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!("Scheduler tick failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Phase scheduler stopped for session {}", self.session.id());
    }

    pub fn spawn(self: &Arc<Self>, interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(interval, shutdown))
    }

    async fn settle_logged(&self, round_id: &str) -> Option<SettlementResult> {
        match self.settlement.settle(round_id).await {
            Ok(result) => {
                if !result.is_complete() {
                    tracing::warn!(
                        "Round {} left {} bets unsettled; will retry",
                        round_id,
                        result.failed_bets.len()
                    );
                }
                Some(result)
            }
            Err(e) => {
                tracing::error!("Settlement of round {} failed: {}", round_id, e);
                None
            }
        }
    }

    async fn retry_settlement(&self, round_id: &str) -> Option<SettlementResult> {
        let store = RoundStore::new(&self.storage);
        let needs_retry = match store.get_round(round_id).await {
            Ok(Some(round)) if !round.is_settled() => true,
            Ok(Some(_)) => match store.unsettled_bets(round_id).await {
                Ok(pending) => !pending.is_empty(),
                Err(e) => {
                    tracing::warn!("Could not inspect bets of round {}: {}", round_id, e);
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Could not load round {}: {}", round_id, e);
                false
            }
        };

        if !needs_retry {
            return None;
        }

        tracing::warn!("Retrying settlement of round {}", round_id);
        self.settle_logged(round_id).await
    }
}
