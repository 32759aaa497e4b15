use crate::clock::{Clock, SystemClock};
use crate::error::{CoinflipError, Result};
use crate::game::{
    BetAdmission, GameConfig, OutcomeDrawer, PhaseScheduler, RandomDrawer, SettlementEngine,
    SettlementResult, Transition,
};
use crate::ledger::CoinLedger;
use crate::notifier::{EventBus, EventSink, GameEvent, StateNotifier};
use crate::storage::session_store::SessionHandle;
use crate::storage::{RoundStore, SessionStore, Storage};
use crate::types::{
    Bet, CoinAccount, CoinTransaction, GameStateView, Round, RoundDetails, Side, TransactionKind,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Everything a frontend needs: state polling, wagering, balances and the
/// event feed, wired around one persistent game session.
pub struct CoinflipGame {
    config: GameConfig,
    storage: Arc<Storage>,
    session: SessionHandle,
    notifier: StateNotifier,
    ledger: Arc<CoinLedger>,
    admission: BetAdmission,
    settlement: Arc<SettlementEngine>,
    scheduler: Arc<PhaseScheduler>,
}

impl CoinflipGame {
    /// Open (or create) the game database under `data_dir` with the system
    /// clock and a random coin.
    pub async fn open(data_dir: &Path, config: GameConfig) -> Result<Self> {
        let db_path = data_dir.join("coinflip.db");
        let storage = Arc::new(Storage::new(&db_path).await?);
        let drawer = Arc::new(RandomDrawer::new(config.heads_probability));

        Self::with_parts(storage, config, Arc::new(SystemClock), drawer).await
    }

    pub async fn with_parts(
        storage: Arc<Storage>,
        config: GameConfig,
        clock: Arc<dyn Clock>,
        drawer: Arc<dyn OutcomeDrawer>,
    ) -> Result<Self> {
        config.validate()?;

        let (session, _) = SessionStore::new(&storage)
            .ensure_active(&config.durations(), clock.now())
            .await?;

        let bus = EventBus::new(config.event_capacity);
        let notifier = StateNotifier::new(bus.clone());

        let ledger = Arc::new(CoinLedger::new(
            storage.clone(),
            clock.clone(),
            bus.clone(),
            config.starting_balance,
        ));

        let admission = BetAdmission::new(
            storage.clone(),
            session.clone(),
            ledger.clone(),
            clock.clone(),
            config.max_stake,
            config.payout_multiplier,
        );

        let settlement = Arc::new(SettlementEngine::new(
            storage.clone(),
            session.clone(),
            ledger.clone(),
            clock.clone(),
            bus.clone(),
            drawer,
            config.payout_multiplier,
        ));

        let scheduler = Arc::new(PhaseScheduler::new(
            storage.clone(),
            session.clone(),
            settlement.clone(),
            clock,
            bus,
        ));

        Ok(Self {
            config,
            storage,
            session,
            notifier,
            ledger,
            admission,
            settlement,
            scheduler,
        })
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn ledger(&self) -> &Arc<CoinLedger> {
        &self.ledger
    }

    pub fn admission(&self) -> &BetAdmission {
        &self.admission
    }

    pub fn settlement(&self) -> &Arc<SettlementEngine> {
        &self.settlement
    }

    pub fn scheduler(&self) -> &Arc<PhaseScheduler> {
        &self.scheduler
    }

    /// Current phase and countdown. Applies a due transition first, so
    /// polling keeps the game moving even without the background loop.
    pub async fn get_state(&self) -> Result<GameStateView> {
        self.advance_if_due().await;
        self.scheduler.state().await
    }

    pub async fn place_bet(
        &self,
        user_id: &str,
        round_id: &str,
        side: Side,
        stake: i64,
    ) -> Result<Bet> {
        self.admission.validate(user_id, round_id, stake)?;
        self.advance_if_due().await;
        self.admission.place_bet(user_id, round_id, side, stake).await
    }

    /// Bet on whatever round is currently open.
    pub async fn place_bet_current(&self, user_id: &str, side: Side, stake: i64) -> Result<Bet> {
        let state = self.get_state().await?;
        let round_id = state.current_round_id.ok_or(CoinflipError::BettingClosed)?;
        self.admission.place_bet(user_id, &round_id, side, stake).await
    }

    pub async fn get_account(&self, user_id: &str) -> Result<CoinAccount> {
        if user_id.trim().is_empty() {
            return Err(CoinflipError::validation("User id cannot be empty"));
        }
        self.ledger.get_account(user_id).await
    }

    pub async fn list_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CoinTransaction>> {
        self.ledger.list_transactions(user_id, limit).await
    }

    /// Operator credit, booked as an `AdminGrant` entry.
    pub async fn grant(&self, user_id: &str, amount: i64) -> Result<i64> {
        if user_id.trim().is_empty() {
            return Err(CoinflipError::validation("User id cannot be empty"));
        }

        if amount <= 0 {
            return Err(CoinflipError::validation("Grant must be greater than 0"));
        }

        let (balance, _) = self
            .ledger
            .apply_delta(user_id, amount, TransactionKind::AdminGrant, None)
            .await?;

        tracing::info!("Granted {} coins to {}", amount, user_id);
        Ok(balance)
    }

    pub async fn round_details(&self, round_id: &str) -> Result<RoundDetails> {
        let store = RoundStore::new(&self.storage);
        let round = store
            .get_round(round_id)
            .await?
            .ok_or_else(|| CoinflipError::RoundNotFound(round_id.to_string()))?;
        let bets = store.list_bets(round_id).await?;

        Ok(RoundDetails { round, bets })
    }

    pub async fn recent_rounds(&self, limit: usize) -> Result<Vec<Round>> {
        RoundStore::new(&self.storage).recent_rounds(limit).await
    }

    pub async fn user_bets(&self, user_id: &str, limit: usize) -> Result<Vec<Bet>> {
        RoundStore::new(&self.storage)
            .list_user_bets(user_id, limit)
            .await
    }

    /// Manual settlement; a no-op re-run for rounds already paid out.
    pub async fn settle(&self, round_id: &str) -> Result<SettlementResult> {
        self.settlement.settle(round_id).await
    }

    /// Apply at most one due phase transition.
    pub async fn tick(&self) -> Result<Option<Transition>> {
        self.scheduler.tick().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.notifier.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.notifier.add_sink(sink);
    }

    pub fn spawn_notifier(&self) -> JoinHandle<()> {
        self.notifier.spawn()
    }

    /// Start the background phase loop at the configured tick interval.
    pub fn run_scheduler(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.scheduler.spawn(self.config.tick_interval(), shutdown)
    }

    async fn advance_if_due(&self) {
        if let Err(e) = self.scheduler.tick().await {
            tracing::warn!("Cooperative phase advance failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::game::FixedDrawer;
    use crate::storage::session_store::PhaseChange;
    use crate::storage::LedgerStore;
    use crate::types::Phase;
    use chrono::{DateTime, Duration};
    use futures::future::join_all;
    use tempfile::{tempdir, TempDir};

    const BETTING: i64 = 10_000;
    const FLIPPING: i64 = 2_000;
    const RESULT: i64 = 3_000;
    const WAITING: i64 = 4_000;

    fn test_config() -> GameConfig {
        GameConfig {
            betting_ms: BETTING as u64,
            flipping_ms: FLIPPING as u64,
            result_ms: RESULT as u64,
            waiting_ms: WAITING as u64,
            tick_ms: 10,
            ..GameConfig::default()
        }
    }

    struct Harness {
        _dir: TempDir,
        game: Arc<CoinflipGame>,
        clock: Arc<ManualClock>,
    }

    async fn harness_with(config: GameConfig, drawer: Arc<dyn OutcomeDrawer>) -> Harness {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::new(&dir.path().join("coinflip.db")).await.unwrap());
        let start = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let clock = Arc::new(ManualClock::new(start));

        let game = CoinflipGame::with_parts(storage, config, clock.clone(), drawer)
            .await
            .unwrap();

        Harness {
            _dir: dir,
            game: Arc::new(game),
            clock,
        }
    }

    async fn harness(outcome: Side) -> Harness {
        harness_with(test_config(), Arc::new(FixedDrawer(outcome))).await
    }

    /// Move from the initial Waiting phase into Betting and return the round.
    async fn open_betting(h: &Harness) -> String {
        let transition = h.game.tick().await.unwrap().unwrap();
        assert_eq!(transition.to, Phase::Betting);
        transition.round_id.unwrap()
    }

    /// Betting -> Flipping -> Result, settling the round.
    async fn play_out(h: &Harness) -> SettlementResult {
        h.clock.advance(Duration::milliseconds(BETTING));
        let flipping = h.game.tick().await.unwrap().unwrap();
        assert_eq!(flipping.to, Phase::Flipping);

        h.clock.advance(Duration::milliseconds(FLIPPING));
        let result = h.game.tick().await.unwrap().unwrap();
        assert_eq!(result.to, Phase::Result);
        result.settlement.unwrap()
    }

    /// Result -> Waiting -> Betting.
    async fn next_round(h: &Harness) -> String {
        h.clock.advance(Duration::milliseconds(RESULT));
        assert_eq!(h.game.tick().await.unwrap().unwrap().to, Phase::Waiting);
        h.clock.advance(Duration::milliseconds(WAITING));
        open_betting(h).await
    }

    /// Betting -> Flipping, then switch the session to Result without
    /// running settlement.
    async fn enter_result_unsettled(h: &Harness, round_id: &str) {
        h.clock.advance(Duration::milliseconds(BETTING));
        assert_eq!(h.game.tick().await.unwrap().unwrap().to, Phase::Flipping);
        h.clock.advance(Duration::milliseconds(FLIPPING));

        let now = h.clock.now();
        let conn = h.game.storage.get_connection().await;
        let session = SessionStore::session_in(&conn, &h.game.session).unwrap();
        let change = PhaseChange {
            phase: Phase::Result,
            started_at: now,
            ends_at: now + Duration::milliseconds(RESULT),
            round_id: Some(round_id),
        };
        assert!(SessionStore::advance_in(&conn, &session, &change, now).unwrap());
    }

    async fn assert_ledger_consistent(h: &Harness, user_id: &str) {
        let account = h.game.get_account(user_id).await.unwrap();
        let sum = LedgerStore::new(&h.game.storage)
            .ledger_sum(user_id)
            .await
            .unwrap();
        assert!(account.balance >= 0);
        assert_eq!(account.balance, sum, "ledger drifted for {}", user_id);
    }

    #[tokio::test]
    async fn test_winning_bet_pays_double() {
        let h = harness(Side::Heads).await;
        let round_id = open_betting(&h).await;

        let bet = h
            .game
            .place_bet("alice", &round_id, Side::Heads, 100)
            .await
            .unwrap();
        assert_eq!(h.game.get_account("alice").await.unwrap().balance, 900);

        let settled = play_out(&h).await;
        assert_eq!(settled.outcome, Side::Heads);
        assert_eq!(settled.winners, 1);
        assert_eq!(settled.total_paid, 200);

        assert_eq!(h.game.get_account("alice").await.unwrap().balance, 1100);

        let history = h.game.list_transactions("alice", 10).await.unwrap();
        let kinds: Vec<(TransactionKind, i64)> =
            history.iter().map(|tx| (tx.kind, tx.amount)).collect();
        assert_eq!(
            kinds,
            vec![
                (TransactionKind::Payout, 200),
                (TransactionKind::Stake, -100),
                (TransactionKind::Bonus, 1000),
            ]
        );
        assert_eq!(history[0].balance_after, 1100);

        let details = h.game.round_details(&round_id).await.unwrap();
        assert_eq!(details.round.outcome, Some(Side::Heads));
        assert_eq!(details.bets.len(), 1);
        assert_eq!(details.bets[0].id, bet.id);
        assert_eq!(details.bets[0].is_winner, Some(true));
        assert_eq!(details.bets[0].payout, Some(200));
    }

    #[tokio::test]
    async fn test_losing_bet_gets_nothing() {
        let h = harness(Side::Tails).await;
        let round_id = open_betting(&h).await;

        h.game
            .place_bet("bob", &round_id, Side::Heads, 250)
            .await
            .unwrap();
        let settled = play_out(&h).await;
        assert_eq!(settled.losers, 1);
        assert_eq!(settled.total_paid, 0);

        assert_eq!(h.game.get_account("bob").await.unwrap().balance, 750);
        let bets = h.game.user_bets("bob", 10).await.unwrap();
        assert_eq!(bets[0].is_winner, Some(false));
        assert_eq!(bets[0].payout, Some(0));
        assert_ledger_consistent(&h, "bob").await;
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace() {
        let config = GameConfig {
            starting_balance: 50,
            ..test_config()
        };
        let h = harness_with(config, Arc::new(FixedDrawer(Side::Heads))).await;
        let round_id = open_betting(&h).await;

        let err = h
            .game
            .place_bet("carol", &round_id, Side::Tails, 100)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoinflipError::InsufficientFunds {
                need: 100,
                available: 50
            }
        ));

        assert_eq!(h.game.get_account("carol").await.unwrap().balance, 50);
        assert!(h.game.user_bets("carol", 10).await.unwrap().is_empty());
        assert_eq!(h.game.list_transactions("carol", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_bet_debits_once() {
        let h = harness(Side::Heads).await;
        let round_id = open_betting(&h).await;

        h.game
            .place_bet("dave", &round_id, Side::Heads, 100)
            .await
            .unwrap();
        let err = h
            .game
            .place_bet("dave", &round_id, Side::Tails, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinflipError::DuplicateBet { .. }));

        assert_eq!(h.game.get_account("dave").await.unwrap().balance, 900);
        let stakes = h
            .game
            .list_transactions("dave", 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|tx| tx.kind == TransactionKind::Stake)
            .count();
        assert_eq!(stakes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_bets_admit_one() {
        let h = harness(Side::Heads).await;
        let round_id = open_betting(&h).await;

        let attempts = (0..16).map(|_| {
            let game = h.game.clone();
            let round_id = round_id.clone();
            tokio::spawn(async move { game.place_bet("erin", &round_id, Side::Heads, 10).await })
        });

        let results = join_all(attempts).await;
        let admitted = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(CoinflipError::DuplicateBet { .. }))))
            .count();

        assert_eq!(admitted, 1);
        assert_eq!(duplicates, 15);
        assert_eq!(h.game.get_account("erin").await.unwrap().balance, 990);
        assert_ledger_consistent(&h, "erin").await;
    }

    #[tokio::test]
    async fn test_rejections_before_storage() {
        let h = harness(Side::Heads).await;
        let round_id = open_betting(&h).await;

        for stake in [0, -5] {
            let err = h
                .game
                .place_bet("frank", &round_id, Side::Heads, stake)
                .await
                .unwrap_err();
            assert!(matches!(err, CoinflipError::Validation(_)));
        }

        let err = h
            .game
            .place_bet("", &round_id, Side::Heads, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinflipError::Validation(_)));

        // Rejected input never created an account
        assert!(LedgerStore::new(&h.game.storage)
            .get_account("frank")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_max_stake_enforced() {
        let config = GameConfig {
            max_stake: Some(50),
            ..test_config()
        };
        let h = harness_with(config, Arc::new(FixedDrawer(Side::Heads))).await;
        let round_id = open_betting(&h).await;

        let err = h
            .game
            .place_bet("gina", &round_id, Side::Heads, 51)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinflipError::Validation(_)));
        h.game
            .place_bet("gina", &round_id, Side::Heads, 50)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_betting_closed_at_deadline() {
        let h = harness(Side::Heads).await;
        let round_id = open_betting(&h).await;

        h.clock.advance(Duration::milliseconds(BETTING));

        // Admission itself refuses even before any tick moves the phase
        let err = h
            .game
            .admission()
            .place_bet("hank", &round_id, Side::Heads, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinflipError::BettingClosed));

        let err = h
            .game
            .place_bet("hank", &round_id, Side::Heads, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinflipError::BettingClosed));
        assert_eq!(h.game.get_state().await.unwrap().phase, Phase::Flipping);
    }

    #[tokio::test]
    async fn test_bet_on_stale_round_rejected() {
        let h = harness(Side::Heads).await;
        let first = open_betting(&h).await;
        play_out(&h).await;
        let second = next_round(&h).await;
        assert_ne!(first, second);

        let err = h
            .game
            .place_bet("ivan", &first, Side::Heads, 10)
            .await
            .unwrap_err();
        match err {
            CoinflipError::RoundMismatch { requested, current } => {
                assert_eq!(requested, first);
                assert_eq!(current, Some(second));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_waiting_phase_refuses_bets() {
        let h = harness(Side::Heads).await;
        let round_id = open_betting(&h).await;
        play_out(&h).await;

        let err = h
            .game
            .place_bet("jane", &round_id, Side::Heads, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinflipError::BettingClosed));
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let h = harness(Side::Heads).await;
        let round_id = open_betting(&h).await;
        h.game
            .place_bet("kim", &round_id, Side::Heads, 100)
            .await
            .unwrap();
        let first = play_out(&h).await;
        assert!(!first.already_recorded);
        assert_eq!(first.newly_settled, 1);

        let again = h.game.settle(&round_id).await.unwrap();
        assert!(again.already_recorded);
        assert_eq!(again.outcome, first.outcome);
        assert_eq!(again.newly_settled, 0);
        assert_eq!(again.total_paid, first.total_paid);

        assert_eq!(h.game.get_account("kim").await.unwrap().balance, 1100);
        assert_eq!(h.game.list_transactions("kim", 10).await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_settlement_pays_once() {
        let h = harness_with(test_config(), Arc::new(RandomDrawer::default())).await;
        let round_id = open_betting(&h).await;

        let users = ["u1", "u2", "u3", "u4", "u5", "u6"];
        for (i, user) in users.iter().enumerate() {
            let side = if i % 2 == 0 { Side::Heads } else { Side::Tails };
            h.game
                .place_bet(user, &round_id, side, 10 * (i as i64 + 1))
                .await
                .unwrap();
        }
        enter_result_unsettled(&h, &round_id).await;

        let runs = (0..4).map(|_| {
            let game = h.game.clone();
            let round_id = round_id.clone();
            tokio::spawn(async move { game.settle(&round_id).await })
        });
        let results: Vec<SettlementResult> = join_all(runs)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let outcome = results[0].outcome;
        assert!(results.iter().all(|r| r.outcome == outcome));
        assert_eq!(results.iter().filter(|r| !r.already_recorded).count(), 1);
        assert_eq!(
            results.iter().map(|r| r.newly_settled).sum::<usize>(),
            users.len()
        );

        let details = h.game.round_details(&round_id).await.unwrap();
        let winning_stakes: i64 = details
            .bets
            .iter()
            .filter(|b| b.side == outcome)
            .map(|b| b.stake)
            .sum();
        let paid: i64 = details.bets.iter().filter_map(|b| b.payout).sum();
        assert_eq!(paid, 2 * winning_stakes);

        for user in users {
            assert_ledger_consistent(&h, user).await;
        }
    }

    #[tokio::test]
    async fn test_settle_refused_while_round_in_play() {
        let h = harness(Side::Tails).await;
        let round_id = open_betting(&h).await;

        let err = h.game.settle(&round_id).await.unwrap_err();
        assert!(matches!(err, CoinflipError::RoundInProgress(_)));
        let state = h.game.get_state().await.unwrap();
        assert_eq!(state.phase, Phase::Betting);
        assert!(state.outcome.is_none());

        // Nothing was revealed, so a late bet is an ordinary wager
        h.game
            .place_bet("mallory", &round_id, Side::Heads, 500)
            .await
            .unwrap();

        h.clock.advance(Duration::milliseconds(BETTING));
        assert_eq!(h.game.tick().await.unwrap().unwrap().to, Phase::Flipping);
        let err = h.game.settle(&round_id).await.unwrap_err();
        assert!(matches!(err, CoinflipError::RoundInProgress(_)));
        assert!(h.game.round_details(&round_id).await.unwrap().round.outcome.is_none());

        h.clock.advance(Duration::milliseconds(FLIPPING));
        let settled = h.game.tick().await.unwrap().unwrap().settlement.unwrap();
        assert!(!settled.already_recorded);
        assert_eq!(settled.outcome, Side::Tails);
        assert_eq!(settled.losers, 1);
        assert_eq!(h.game.get_account("mallory").await.unwrap().balance, 500);
        assert_ledger_consistent(&h, "mallory").await;
    }

    #[tokio::test]
    async fn test_bet_rejected_once_outcome_recorded() {
        let h = harness(Side::Heads).await;
        let round_id = open_betting(&h).await;

        RoundStore::new(&h.game.storage)
            .record_outcome(&round_id, Side::Heads, h.clock.now())
            .await
            .unwrap();

        let err = h
            .game
            .place_bet("mallory", &round_id, Side::Heads, 500)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinflipError::BettingClosed));

        // The whole admission rolled back, account creation included
        assert!(LedgerStore::new(&h.game.storage)
            .get_account("mallory")
            .await
            .unwrap()
            .is_none());
        assert!(h.game.round_details(&round_id).await.unwrap().bets.is_empty());
    }

    #[tokio::test]
    async fn test_unpayable_stake_rejected() {
        let h = harness(Side::Heads).await;
        let round_id = open_betting(&h).await;

        let err = h
            .game
            .place_bet("pat", &round_id, Side::Heads, i64::MAX / 2 + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinflipError::Validation(_)));
        assert!(LedgerStore::new(&h.game.storage)
            .get_account("pat")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_payout_is_isolated_and_retried() {
        let h = harness(Side::Heads).await;
        let round_id = open_betting(&h).await;

        h.game
            .place_bet("alice", &round_id, Side::Heads, 100)
            .await
            .unwrap();
        h.game
            .place_bet("bob", &round_id, Side::Tails, 100)
            .await
            .unwrap();

        // A winning bet whose owner has no coin account, so its credit fails
        let ghost = Bet {
            id: uuid::Uuid::new_v4().to_string(),
            round_id: round_id.clone(),
            user_id: "ghost".to_string(),
            side: Side::Heads,
            stake: 30,
            is_winner: None,
            payout: None,
            created_at: h.clock.now(),
        };
        {
            let conn = h.game.storage.get_connection().await;
            RoundStore::insert_bet_in(&conn, &ghost).unwrap();
        }

        let settled = play_out(&h).await;
        assert_eq!(settled.failed_bets, vec![ghost.id.clone()]);
        assert!(!settled.is_complete());
        assert_eq!(settled.newly_settled, 2);
        assert_eq!(settled.winners, 1);
        assert_eq!(settled.losers, 1);
        assert_eq!(h.game.get_account("alice").await.unwrap().balance, 1100);
        assert_eq!(h.game.get_account("bob").await.unwrap().balance, 900);

        let pending = RoundStore::new(&h.game.storage)
            .unsettled_bets(&round_id)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ghost.id);

        // Once the account exists the next transition picks the bet up
        assert_eq!(h.game.get_account("ghost").await.unwrap().balance, 1000);
        h.clock.advance(Duration::milliseconds(RESULT));
        let waiting = h.game.tick().await.unwrap().unwrap();
        assert_eq!(waiting.to, Phase::Waiting);
        let retried = waiting.settlement.unwrap();
        assert!(retried.already_recorded);
        assert!(retried.is_complete());
        assert_eq!(retried.newly_settled, 1);
        assert_eq!(h.game.get_account("ghost").await.unwrap().balance, 1060);

        let again = h.game.settle(&round_id).await.unwrap();
        assert_eq!(again.newly_settled, 0);
        assert_eq!(again.total_paid, 260);
        assert_eq!(h.game.get_account("ghost").await.unwrap().balance, 1060);
        for user in ["alice", "bob", "ghost"] {
            assert_ledger_consistent(&h, user).await;
        }
    }

    #[tokio::test]
    async fn test_settlement_resumes_after_outcome_recorded() {
        let h = harness(Side::Tails).await;
        let round_id = open_betting(&h).await;
        h.game
            .place_bet("leo", &round_id, Side::Tails, 40)
            .await
            .unwrap();

        // Outcome written but no payouts, as if interrupted mid-settlement
        RoundStore::new(&h.game.storage)
            .record_outcome(&round_id, Side::Tails, h.clock.now())
            .await
            .unwrap();

        let settled = play_out(&h).await;
        assert!(settled.already_recorded);
        assert_eq!(settled.newly_settled, 1);
        assert_eq!(h.game.get_account("leo").await.unwrap().balance, 1040);
    }

    #[tokio::test]
    async fn test_no_fast_forward_after_idle() {
        let h = harness(Side::Heads).await;
        open_betting(&h).await;

        let cycle = test_config().durations().cycle();
        h.clock.advance(cycle * 10);

        let transition = h.game.tick().await.unwrap().unwrap();
        assert_eq!(transition.from, Phase::Betting);
        assert_eq!(transition.to, Phase::Flipping);
        assert_eq!(
            transition.phase_ends_at,
            h.clock.now() + Duration::milliseconds(FLIPPING)
        );

        // New deadline is measured from now, so nothing else is due yet
        assert!(h.game.tick().await.unwrap().is_none());
        let state = h.game.get_state().await.unwrap();
        assert_eq!(state.phase, Phase::Flipping);
        assert_eq!(state.time_remaining, std::time::Duration::from_millis(FLIPPING as u64));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ticks_apply_one_transition() {
        let h = harness(Side::Heads).await;

        let ticks = (0..8).map(|_| {
            let game = h.game.clone();
            tokio::spawn(async move { game.tick().await })
        });
        let applied = join_all(ticks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(Some(_)))))
            .count();
        assert_eq!(applied, 1);

        // Exactly one round was opened
        assert_eq!(h.game.recent_rounds(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_cycle_and_events() {
        let h = harness(Side::Heads).await;
        let mut events = h.game.subscribe();

        let first = open_betting(&h).await;
        h.game
            .place_bet("mia", &first, Side::Heads, 10)
            .await
            .unwrap();
        play_out(&h).await;
        let second = next_round(&h).await;

        let mut phases = Vec::new();
        let mut settled = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                GameEvent::PhaseChanged { to, .. } => phases.push(to),
                GameEvent::RoundSettled { round_id, outcome } => settled.push((round_id, outcome)),
                GameEvent::BalanceChanged { .. } => {}
            }
        }

        assert_eq!(
            phases,
            vec![
                Phase::Betting,
                Phase::Flipping,
                Phase::Result,
                Phase::Waiting,
                Phase::Betting
            ]
        );
        assert_eq!(settled, vec![(first.clone(), Side::Heads)]);

        let rounds = h.game.recent_rounds(10).await.unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].id, second);
        assert!(rounds[1].is_settled());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let round_id = {
            let game = CoinflipGame::open(dir.path(), test_config()).await.unwrap();
            let state = game.get_state().await.unwrap();
            assert_eq!(state.phase, Phase::Betting);
            let round_id = state.current_round_id.unwrap();
            game.place_bet("nina", &round_id, Side::Heads, 25)
                .await
                .unwrap();
            round_id
        };

        let game = CoinflipGame::open(dir.path(), test_config()).await.unwrap();
        let state = game.get_state().await.unwrap();
        assert_eq!(state.current_round_id, Some(round_id));
        assert_eq!(game.get_account("nina").await.unwrap().balance, 975);
    }

    #[tokio::test]
    async fn test_grant_validates_and_books() {
        let h = harness(Side::Heads).await;

        assert!(matches!(
            h.game.grant("olga", 0).await,
            Err(CoinflipError::Validation(_))
        ));
        assert_eq!(h.game.grant("olga", 250).await.unwrap(), 1250);

        let history = h.game.list_transactions("olga", 10).await.unwrap();
        assert_eq!(history[0].kind, TransactionKind::AdminGrant);
        assert_ledger_consistent(&h, "olga").await;
    }

    #[tokio::test]
    async fn test_background_scheduler_advances_and_stops() {
        let h = harness(Side::Heads).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = h.game.run_scheduler(shutdown_rx);

        let mut phase = Phase::Waiting;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            phase = h.game.scheduler().state().await.unwrap().phase;
            if phase == Phase::Betting {
                break;
            }
        }
        assert_eq!(phase, Phase::Betting);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
