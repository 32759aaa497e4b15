use crate::clock::Clock;
use crate::error::{CoinflipError, Result};
use crate::ledger::CoinLedger;
use crate::storage::session_store::SessionHandle;
use crate::storage::{LedgerStore, RoundStore, SessionStore, Storage};
use crate::types::{Bet, Phase, Side, TransactionKind, TxReference};
use rusqlite::TransactionBehavior;
use std::sync::Arc;
use uuid::Uuid;

/// Validates and records a single wager against the open round.
pub struct BetAdmission {
    storage: Arc<Storage>,
    session: SessionHandle,
    ledger: Arc<CoinLedger>,
    clock: Arc<dyn Clock>,
    max_stake: Option<i64>,
    payout_multiplier: i64,
}

impl BetAdmission {
    pub fn new(
        storage: Arc<Storage>,
        session: SessionHandle,
        ledger: Arc<CoinLedger>,
        clock: Arc<dyn Clock>,
        max_stake: Option<i64>,
        payout_multiplier: i64,
    ) -> Self {
        Self {
            storage,
            session,
            ledger,
            clock,
            max_stake,
            payout_multiplier,
        }
    }

    /// Debit the stake and record the bet in one transaction.
    pub async fn place_bet(
        &self,
        user_id: &str,
        round_id: &str,
        side: Side,
        stake: i64,
    ) -> Result<Bet> {
        self.validate(user_id, round_id, stake)?;

        let (bet, applied) = {
            let mut conn = self.storage.get_connection().await;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = self.clock.now();

            let session = SessionStore::session_in(&tx, &self.session)?;
            if session.current_round_id.as_deref() != Some(round_id) {
                return Err(CoinflipError::RoundMismatch {
                    requested: round_id.to_string(),
                    current: session.current_round_id,
                });
            }

            let round = RoundStore::round_in(&tx, round_id)?
                .ok_or_else(|| CoinflipError::RoundNotFound(round_id.to_string()))?;

            if session.phase != Phase::Betting
                || now >= round.betting_ends_at
                || round.outcome.is_some()
            {
                return Err(CoinflipError::BettingClosed);
            }

            if RoundStore::has_bet_in(&tx, round_id, user_id)? {
                return Err(CoinflipError::DuplicateBet {
                    round_id: round_id.to_string(),
                    user_id: user_id.to_string(),
                });
            }

            let mut applied = Vec::with_capacity(2);
            if let Some(bonus) = LedgerStore::ensure_account_in(
                &tx,
                user_id,
                self.ledger.starting_balance(),
                now,
            )? {
                applied.push(bonus);
            }

            let bet = Bet {
                id: Uuid::new_v4().to_string(),
                round_id: round_id.to_string(),
                user_id: user_id.to_string(),
                side,
                stake,
                is_winner: None,
                payout: None,
                created_at: now,
            };

            applied.push(LedgerStore::apply_delta_in(
                &tx,
                user_id,
                -stake,
                TransactionKind::Stake,
                Some(&TxReference::Bet(bet.id.clone())),
                now,
            )?);
            RoundStore::insert_bet_in(&tx, &bet)?;

            tx.commit()?;
            (bet, applied)
        };

        for delta in &applied {
            self.ledger.publish_balance(delta);
        }

        tracing::debug!(
            "Admitted bet {} from {}: {} on {} in round {}",
            bet.id,
            user_id,
            stake,
            side,
            round_id
        );
        Ok(bet)
    }

    /// Input checks only; never touches storage.
    pub fn validate(&self, user_id: &str, round_id: &str, stake: i64) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(CoinflipError::validation("User id cannot be empty"));
        }

        if round_id.trim().is_empty() {
            return Err(CoinflipError::validation("Round id cannot be empty"));
        }

        if stake <= 0 {
            return Err(CoinflipError::validation("Stake must be greater than 0"));
        }

        if stake.checked_mul(self.payout_multiplier).is_none() {
            return Err(CoinflipError::validation(format!(
                "Stake {} is too large to pay out",
                stake
            )));
        }

        if let Some(max) = self.max_stake {
            if stake > max {
                return Err(CoinflipError::validation(format!(
                    "Stake {} exceeds the maximum of {}",
                    stake, max
                )));
            }
        }

        Ok(())
    }
}
