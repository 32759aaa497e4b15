use crate::clock::Clock;
use crate::error::{CoinflipError, Result};
use crate::ledger::CoinLedger;
use crate::notifier::{EventBus, GameEvent};
use crate::storage::session_store::SessionHandle;
use crate::storage::{LedgerStore, RoundStore, SessionStore, Storage};
use crate::types::{Bet, Phase, Side, TransactionKind, TxReference};
use rand::Rng;
use rusqlite::TransactionBehavior;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Source of round outcomes.
pub trait OutcomeDrawer: Send + Sync {
    fn draw(&self) -> Side;
}

/// Bernoulli draw; `heads_probability = 0.5` is a fair coin.
#[derive(Debug, Clone)]
pub struct RandomDrawer {
    heads_probability: f64,
}

impl RandomDrawer {
    pub fn new(heads_probability: f64) -> Self {
        Self {
            heads_probability: heads_probability.clamp(0.0, 1.0),
        }
    }
}

impl Default for RandomDrawer {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl OutcomeDrawer for RandomDrawer {
    fn draw(&self) -> Side {
        if rand::thread_rng().gen_bool(self.heads_probability) {
            Side::Heads
        } else {
            Side::Tails
        }
    }
}

/// Always draws the same side.
#[derive(Debug, Clone, Copy)]
pub struct FixedDrawer(pub Side);

impl OutcomeDrawer for FixedDrawer {
    fn draw(&self) -> Side {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub round_id: String,
    pub outcome: Side,
    /// True when the outcome had been recorded before this call.
    pub already_recorded: bool,
    pub winners: usize,
    pub losers: usize,
    pub total_staked: i64,
    pub total_paid: i64,
    /// Bets settled by this particular call.
    pub newly_settled: usize,
    /// Bets left unsettled because their unit failed; a re-run retries them.
    pub failed_bets: Vec<String>,
}

impl SettlementResult {
    pub fn is_complete(&self) -> bool {
        self.failed_bets.is_empty()
    }
}

pub struct SettlementEngine {
    storage: Arc<Storage>,
    session: SessionHandle,
    ledger: Arc<CoinLedger>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    drawer: Arc<dyn OutcomeDrawer>,
    payout_multiplier: i64,
}

impl SettlementEngine {
    pub fn new(
        storage: Arc<Storage>,
        session: SessionHandle,
        ledger: Arc<CoinLedger>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
        drawer: Arc<dyn OutcomeDrawer>,
        payout_multiplier: i64,
    ) -> Self {
        Self {
            storage,
            session,
            ledger,
            clock,
            bus,
            drawer,
            payout_multiplier,
        }
    }

    /// Draw (once), then settle every bet that is still open. Safe to call
    /// repeatedly or concurrently for the same round. A round still taking
    /// bets or flipping fails with `RoundInProgress` and is left untouched.
    pub async fn settle(&self, round_id: &str) -> Result<SettlementResult> {
        let (outcome, already_recorded) = self.record_outcome(round_id).await?;

        if !already_recorded {
            tracing::info!("Round {} outcome: {}", round_id, outcome);
            self.bus.publish(GameEvent::RoundSettled {
                round_id: round_id.to_string(),
                outcome,
            });
        }

        let pending = RoundStore::new(&self.storage).unsettled_bets(round_id).await?;

        let mut newly_settled = 0;
        let mut failed_bets = Vec::new();
        for bet in &pending {
            match self.settle_bet(bet, outcome).await {
                Ok(true) => newly_settled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        "Failed to settle bet {} in round {}: {}",
                        bet.id,
                        round_id,
                        e
                    );
                    failed_bets.push(bet.id.clone());
                }
            }
        }

        let all_bets = RoundStore::new(&self.storage).list_bets(round_id).await?;
        let result = summarize(
            round_id,
            outcome,
            already_recorded,
            &all_bets,
            newly_settled,
            failed_bets,
        );

        if newly_settled > 0 || !already_recorded {
            tracing::info!(
                "Settled round {}: {} winners, {} losers, {} paid out",
                round_id,
                result.winners,
                result.losers,
                result.total_paid
            );
        }
        Ok(result)
    }

    async fn record_outcome(&self, round_id: &str) -> Result<(Side, bool)> {
        let now = self.clock.now();
        let conn = self.storage.get_connection().await;

        let round = RoundStore::round_in(&conn, round_id)?
            .ok_or_else(|| CoinflipError::RoundNotFound(round_id.to_string()))?;
        if let Some(outcome) = round.outcome {
            return Ok((outcome, true));
        }

        if now < round.betting_ends_at {
            return Err(CoinflipError::RoundInProgress(round_id.to_string()));
        }

        let session = SessionStore::session_in(&conn, &self.session)?;
        if session.current_round_id.as_deref() == Some(round_id)
            && matches!(session.phase, Phase::Betting | Phase::Flipping)
        {
            return Err(CoinflipError::RoundInProgress(round_id.to_string()));
        }

        let drawn = self.drawer.draw();
        match RoundStore::record_outcome_in(&conn, round_id, drawn, now) {
            Ok(round) => Ok((round.outcome.unwrap_or(drawn), false)),
            Err(CoinflipError::AlreadySettled(_)) => {
                let stored = RoundStore::round_in(&conn, round_id)?
                    .and_then(|r| r.outcome)
                    .ok_or_else(|| CoinflipError::RoundNotFound(round_id.to_string()))?;
                Ok((stored, true))
            }
            Err(e) => Err(e),
        }
    }

    /// One bet's result plus its payout credit, atomically. Returns false if
    /// someone else settled it first.
    async fn settle_bet(&self, bet: &Bet, outcome: Side) -> Result<bool> {
        let is_winner = bet.side == outcome;
        let payout = if is_winner {
            bet.stake.checked_mul(self.payout_multiplier).ok_or_else(|| {
                CoinflipError::internal(format!("Payout overflow for bet {}", bet.id))
            })?
        } else {
            0
        };

        let credited = {
            let mut conn = self.storage.get_connection().await;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if !RoundStore::settle_bet_in(&tx, &bet.id, is_winner, payout)? {
                return Ok(false);
            }

            let credited = if is_winner {
                Some(LedgerStore::apply_delta_in(
                    &tx,
                    &bet.user_id,
                    payout,
                    TransactionKind::Payout,
                    Some(&TxReference::Bet(bet.id.clone())),
                    self.clock.now(),
                )?)
            } else {
                None
            };

            tx.commit()?;
            credited
        };

        if let Some(delta) = credited {
            self.ledger.publish_balance(&delta);
        }

        Ok(true)
    }
}

fn summarize(
    round_id: &str,
    outcome: Side,
    already_recorded: bool,
    bets: &[Bet],
    newly_settled: usize,
    failed_bets: Vec<String>,
) -> SettlementResult {
    let winners = bets.iter().filter(|b| b.is_winner == Some(true)).count();
    let losers = bets.iter().filter(|b| b.is_winner == Some(false)).count();

    SettlementResult {
        round_id: round_id.to_string(),
        outcome,
        already_recorded,
        winners,
        losers,
        total_staked: bets.iter().map(|b| b.stake).sum(),
        total_paid: bets.iter().filter_map(|b| b.payout).sum(),
        newly_settled,
        failed_bets,
    }
}
