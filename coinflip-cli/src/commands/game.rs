use super::{format_outcome, short_id};
use coinflip_core::{CoinflipError, CoinflipGame, Phase, Result, Side, TracingSink};
use comfy_table::{presets::UTF8_FULL, Table};
use std::sync::Arc;
use tokio::sync::watch;

pub async fn run_game(game: &CoinflipGame) -> Result<()> {
    game.add_sink(Arc::new(TracingSink));
    let notifier = game.spawn_notifier();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = game.run_scheduler(shutdown_rx);

    let config = game.config();
    println!("Game session {} running", game.session().id());
    println!(
        "Phases: betting {}ms, flipping {}ms, result {}ms, waiting {}ms",
        config.betting_ms, config.flipping_ms, config.result_ms, config.waiting_ms
    );
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    println!();
    println!("Shutting down...");

    signal_shutdown(&shutdown_tx);
    scheduler
        .await
        .map_err(|e| CoinflipError::internal(format!("Scheduler task failed: {}", e)))?;
    notifier.abort();

    Ok(())
}

/// Ask the scheduler loop to stop. Returns false when it had already exited.
fn signal_shutdown(shutdown_tx: &watch::Sender<bool>) -> bool {
    if shutdown_tx.send(true).is_err() {
        tracing::debug!("Scheduler stopped before shutdown signal");
        return false;
    }
    true
}

pub async fn show_state(game: &CoinflipGame, json: bool) -> Result<()> {
    let state = game.get_state().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("Phase: {}", state.phase);
    println!(
        "Time remaining: {:.1}s (until {})",
        state.time_remaining.as_secs_f64(),
        state.phase_ends_at.format("%H:%M:%S")
    );

    match &state.current_round_id {
        Some(round_id) => println!("Round: {}", round_id),
        None => println!("Round: none yet"),
    }

    if let Some(outcome) = state.outcome {
        println!("Outcome: {}", outcome);
    } else if state.phase == Phase::Betting {
        println!("Betting is open");
    }

    Ok(())
}

pub async fn place_bet(
    game: &CoinflipGame,
    user: &str,
    side: Side,
    stake: i64,
    round: Option<&str>,
) -> Result<()> {
    let bet = match round {
        Some(round_id) => game.place_bet(user, round_id, side, stake).await?,
        None => game.place_bet_current(user, side, stake).await?,
    };

    let account = game.get_account(user).await?;

    println!("Bet placed!");
    println!("Bet ID: {}", bet.id);
    println!("Round: {}", bet.round_id);
    println!("Side: {}", bet.side);
    println!("Stake: {} coins", bet.stake);
    println!("Balance: {} coins", account.balance);

    Ok(())
}

pub async fn list_rounds(game: &CoinflipGame, limit: usize) -> Result<()> {
    let rounds = game.recent_rounds(limit).await?;

    if rounds.is_empty() {
        println!("No rounds played yet");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Round", "Started", "Betting Ends", "Outcome"]);

    for round in rounds {
        table.add_row(vec![
            round.id.clone(),
            round.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            round.betting_ends_at.format("%H:%M:%S").to_string(),
            round
                .outcome
                .map(|o| o.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }

    println!("{}", table);
    Ok(())
}

pub async fn show_round(game: &CoinflipGame, round_id: &str) -> Result<()> {
    let details = game.round_details(round_id).await?;
    let round = &details.round;

    println!("Round: {}", round.id);
    println!("Started: {}", round.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Betting ends: {}", round.betting_ends_at.format("%H:%M:%S"));
    match round.outcome {
        Some(outcome) => println!("Outcome: {}", outcome),
        None => println!("Outcome: not drawn yet"),
    }

    if details.bets.is_empty() {
        println!("No bets");
        return Ok(());
    }

    println!();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Bet", "Player", "Side", "Stake", "Result", "Payout"]);

    for bet in &details.bets {
        table.add_row(vec![
            short_id(&bet.id).to_string(),
            bet.user_id.clone(),
            bet.side.to_string(),
            bet.stake.to_string(),
            format_outcome(bet.is_winner).to_string(),
            bet.payout.map(|p| p.to_string()).unwrap_or_default(),
        ]);
    }

    println!("{}", table);

    let staked: i64 = details.bets.iter().map(|b| b.stake).sum();
    let paid: i64 = details.bets.iter().filter_map(|b| b.payout).sum();
    println!("Total staked: {} coins, paid out: {} coins", staked, paid);

    Ok(())
}
