use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoinflipError>;

#[derive(Error, Debug)]
pub enum CoinflipError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient funds: need {need} coins, have {available} coins")]
    InsufficientFunds { need: i64, available: i64 },

    #[error("User {user_id} already placed a bet in round {round_id}")]
    DuplicateBet { round_id: String, user_id: String },

    #[error("Betting is closed for this round")]
    BettingClosed,

    #[error("Round {requested} is not the current round")]
    RoundMismatch {
        requested: String,
        current: Option<String>,
    },

    #[error("Round {0} is still in play and cannot be settled yet")]
    RoundInProgress(String),

    #[error("Round {0} is already settled")]
    AlreadySettled(String),

    #[error("Round not found: {0}")]
    RoundNotFound(String),

    #[error("No active game session")]
    NoActiveSession,

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoinflipError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Transient failures where re-running the whole logical operation is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }

    /// Business-rule rejections that are surfaced to the caller as-is.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InsufficientFunds { .. }
                | Self::DuplicateBet { .. }
                | Self::BettingClosed
                | Self::RoundMismatch { .. }
                | Self::RoundInProgress(_)
        )
    }
}
