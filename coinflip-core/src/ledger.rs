use crate::clock::Clock;
use crate::error::{CoinflipError, Result};
use crate::notifier::{EventBus, GameEvent};
use crate::storage::ledger_store::AppliedDelta;
use crate::storage::{LedgerStore, Storage};
use crate::types::{CoinAccount, CoinTransaction, TransactionKind, TxReference};
use std::sync::Arc;

/// System of record for coin balances and their audit trail.
pub struct CoinLedger {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    starting_balance: i64,
}

impl CoinLedger {
    pub fn new(
        storage: Arc<Storage>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
        starting_balance: i64,
    ) -> Self {
        Self {
            storage,
            clock,
            bus,
            starting_balance,
        }
    }

    pub fn starting_balance(&self) -> i64 {
        self.starting_balance
    }

    /// Current snapshot, creating the account on first access.
    pub async fn get_account(&self, user_id: &str) -> Result<CoinAccount> {
        let store = LedgerStore::new(&self.storage);
        let (account, bonus) = store
            .get_or_create_account(user_id, self.starting_balance, self.clock.now())
            .await?;

        if let Some(bonus) = bonus {
            self.publish_balance(&bonus);
        }

        Ok(account)
    }

    /// Apply a signed delta and book one ledger entry for it.
    pub async fn apply_delta(
        &self,
        user_id: &str,
        amount: i64,
        kind: TransactionKind,
        reference: Option<TxReference>,
    ) -> Result<(i64, String)> {
        let store = LedgerStore::new(&self.storage);
        let applied = store
            .apply_delta(
                user_id,
                amount,
                kind,
                reference.as_ref(),
                self.starting_balance,
                self.clock.now(),
            )
            .await?;

        for delta in &applied {
            self.publish_balance(delta);
        }

        let last = applied
            .last()
            .ok_or_else(|| CoinflipError::internal("Delta produced no ledger entry"))?;

        tracing::debug!(
            "Applied {} of {} to {} (balance {})",
            kind,
            amount,
            user_id,
            last.new_balance
        );
        Ok((last.new_balance, last.tx_id.clone()))
    }

    pub async fn list_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CoinTransaction>> {
        LedgerStore::new(&self.storage)
            .list_transactions(user_id, limit)
            .await
    }

    pub(crate) fn publish_balance(&self, delta: &AppliedDelta) {
        self.bus.publish(GameEvent::BalanceChanged {
            user_id: delta.user_id.clone(),
            new_balance: delta.new_balance,
        });
    }
}
