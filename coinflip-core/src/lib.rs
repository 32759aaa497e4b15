//! Coinflip core - timed coin-flip wagering rounds over a persistent coin ledger
//!
//! A single game session cycles through betting, flipping, result and waiting
//! phases. Players stake coins on heads or tails while betting is open; every
//! round is drawn once and paid out atomically, and all state lives in SQLite.

pub mod clock;
pub mod error;
pub mod game;
pub mod ledger;
pub mod notifier;
pub mod storage;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoinflipError, Result};
pub use game::{CoinflipGame, FixedDrawer, GameConfig, OutcomeDrawer, RandomDrawer};
pub use notifier::{EventSink, GameEvent, TracingSink};
pub use types::{Bet, CoinAccount, CoinTransaction, GameStateView, Phase, Round, Side};
