use crate::error::{CoinflipError, Result};
use crate::types::PhaseDurations;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound for any single phase or tick interval (one day).
pub const MAX_PHASE_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub betting_ms: u64,
    pub flipping_ms: u64,
    pub result_ms: u64,
    pub waiting_ms: u64,
    /// Interval of the background scheduler loop.
    pub tick_ms: u64,
    /// Coins granted as a welcome bonus when an account is first touched.
    pub starting_balance: i64,
    pub payout_multiplier: i64,
    pub heads_probability: f64,
    pub max_stake: Option<i64>,
    pub event_capacity: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            betting_ms: 20_000,
            flipping_ms: 3_000,
            result_ms: 5_000,
            waiting_ms: 5_000,
            tick_ms: 500,
            starting_balance: 1_000,
            payout_multiplier: 2,
            heads_probability: 0.5,
            max_stake: None,
            event_capacity: 1024,
        }
    }
}

impl GameConfig {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GameConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Apply `COINFLIP_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        self.betting_ms = read_env("COINFLIP_BETTING_MS", self.betting_ms);
        self.flipping_ms = read_env("COINFLIP_FLIPPING_MS", self.flipping_ms);
        self.result_ms = read_env("COINFLIP_RESULT_MS", self.result_ms);
        self.waiting_ms = read_env("COINFLIP_WAITING_MS", self.waiting_ms);
        self.tick_ms = read_env("COINFLIP_TICK_MS", self.tick_ms);
        self.starting_balance = read_env("COINFLIP_STARTING_BALANCE", self.starting_balance);
        self.payout_multiplier = read_env("COINFLIP_PAYOUT_MULTIPLIER", self.payout_multiplier);
        self.heads_probability = read_env("COINFLIP_HEADS_PROBABILITY", self.heads_probability);
        self
    }

    pub fn durations(&self) -> PhaseDurations {
        PhaseDurations {
            betting_ms: self.betting_ms,
            flipping_ms: self.flipping_ms,
            result_ms: self.result_ms,
            waiting_ms: self.waiting_ms,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let phases = [
            ("betting", self.betting_ms),
            ("flipping", self.flipping_ms),
            ("result", self.result_ms),
            ("waiting", self.waiting_ms),
        ];
        for (name, ms) in phases {
            if ms == 0 {
                return Err(CoinflipError::config(format!(
                    "{} duration must be greater than 0",
                    name
                )));
            }
            if ms > MAX_PHASE_MS {
                return Err(CoinflipError::config(format!(
                    "{} duration must be at most {}ms",
                    name, MAX_PHASE_MS
                )));
            }
        }

        if self.tick_ms == 0 || self.tick_ms > MAX_PHASE_MS {
            return Err(CoinflipError::config(format!(
                "Tick interval must be between 1 and {}ms",
                MAX_PHASE_MS
            )));
        }

        if self.starting_balance < 0 {
            return Err(CoinflipError::config("Starting balance cannot be negative"));
        }

        if self.payout_multiplier < 1 {
            return Err(CoinflipError::config("Payout multiplier must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.heads_probability) {
            return Err(CoinflipError::config(
                "Heads probability must be within [0, 1]",
            ));
        }

        if matches!(self.max_stake, Some(max) if max <= 0) {
            return Err(CoinflipError::config("Max stake must be greater than 0"));
        }

        if self.event_capacity == 0 {
            return Err(CoinflipError::config("Event capacity must be greater than 0"));
        }

        Ok(())
    }
}

fn read_env<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(fallback)
}
