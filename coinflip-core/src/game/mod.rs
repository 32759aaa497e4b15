pub mod admission;
pub mod config;
pub mod manager;
pub mod scheduler;
pub mod settlement;

pub use admission::BetAdmission;
pub use config::GameConfig;
pub use manager::CoinflipGame;
pub use scheduler::{PhaseScheduler, Transition};
pub use settlement::{FixedDrawer, OutcomeDrawer, RandomDrawer, SettlementEngine, SettlementResult};
