pub mod account;
pub mod game;

pub use account::{grant, show_balance, show_bets, show_history};
pub use game::{list_rounds, place_bet, run_game, show_round, show_state};

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn format_outcome(is_winner: Option<bool>) -> &'static str {
    match is_winner {
        Some(true) => "won",
        Some(false) => "lost",
        None => "pending",
    }
}
