use crate::error::CoinflipError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Heads,
    Tails,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Heads => "heads",
            Side::Tails => "tails",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = CoinflipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heads" | "h" => Ok(Side::Heads),
            "tails" | "t" => Ok(Side::Tails),
            other => Err(CoinflipError::validation(format!("Unknown side: {}", other))),
        }
    }
}

/// Recurring stages of the game cycle, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Betting,
    Flipping,
    Result,
    Waiting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Betting => "betting",
            Phase::Flipping => "flipping",
            Phase::Result => "result",
            Phase::Waiting => "waiting",
        }
    }

    pub fn next(&self) -> Phase {
        match self {
            Phase::Betting => Phase::Flipping,
            Phase::Flipping => Phase::Result,
            Phase::Result => Phase::Waiting,
            Phase::Waiting => Phase::Betting,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = CoinflipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "betting" => Ok(Phase::Betting),
            "flipping" => Ok(Phase::Flipping),
            "result" => Ok(Phase::Result),
            "waiting" => Ok(Phase::Waiting),
            other => Err(CoinflipError::internal(format!("Unknown phase: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Stake,
    Payout,
    Bonus,
    AdminGrant,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Stake => "stake",
            TransactionKind::Payout => "payout",
            TransactionKind::Bonus => "bonus",
            TransactionKind::AdminGrant => "admin_grant",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = CoinflipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stake" => Ok(TransactionKind::Stake),
            "payout" => Ok(TransactionKind::Payout),
            "bonus" => Ok(TransactionKind::Bonus),
            "admin_grant" => Ok(TransactionKind::AdminGrant),
            other => Err(CoinflipError::internal(format!(
                "Unknown transaction kind: {}",
                other
            ))),
        }
    }
}

/// What a ledger entry was booked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxReference {
    Bet(String),
    Round(String),
}

impl TxReference {
    pub fn kind_str(&self) -> &'static str {
        match self {
            TxReference::Bet(_) => "bet",
            TxReference::Round(_) => "round",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            TxReference::Bet(id) | TxReference::Round(id) => id,
        }
    }

    pub fn from_parts(kind: Option<String>, id: Option<String>) -> Option<Self> {
        match (kind.as_deref(), id) {
            (Some("bet"), Some(id)) => Some(TxReference::Bet(id)),
            (Some("round"), Some(id)) => Some(TxReference::Round(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDurations {
    pub betting_ms: u64,
    pub flipping_ms: u64,
    pub result_ms: u64,
    pub waiting_ms: u64,
}

impl PhaseDurations {
    pub fn for_phase(&self, phase: Phase) -> chrono::Duration {
        let ms = match phase {
            Phase::Betting => self.betting_ms,
            Phase::Flipping => self.flipping_ms,
            Phase::Result => self.result_ms,
            Phase::Waiting => self.waiting_ms,
        };
        chrono::Duration::milliseconds(ms as i64)
    }

    pub fn cycle(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(
            (self.betting_ms + self.flipping_ms + self.result_ms + self.waiting_ms) as i64,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSession {
    pub id: String,
    pub is_active: bool,
    pub phase: Phase,
    pub phase_started_at: DateTime<Utc>,
    pub phase_ends_at: DateTime<Utc>,
    pub durations: PhaseDurations,
    pub current_round_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub betting_ends_at: DateTime<Utc>,
    pub outcome: Option<Side>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Round {
    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub round_id: String,
    pub user_id: String,
    pub side: Side,
    pub stake: i64,
    pub is_winner: Option<bool>,
    pub payout: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinAccount {
    pub user_id: String,
    pub balance: i64,
    pub total_earned: i64,
    pub total_spent: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinTransaction {
    pub id: String,
    pub user_id: String,
    pub amount: i64, // +ve credit, -ve debit
    pub kind: TransactionKind,
    pub reference: Option<TxReference>,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

/// Read-only snapshot for polling callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameStateView {
    pub phase: Phase,
    pub time_remaining: Duration,
    pub phase_ends_at: DateTime<Utc>,
    pub current_round_id: Option<String>,
    pub outcome: Option<Side>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundDetails {
    pub round: Round,
    pub bets: Vec<Bet>,
}
