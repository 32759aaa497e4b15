mod commands;
mod config;

use coinflip_core::{CoinflipError, CoinflipGame, Side};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "coinflip")]
#[command(about = "Timed coin-flip wagering rounds")]
#[command(version)]
struct Cli {
    /// Data directory for the game database
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Game configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the phase scheduler and log events until Ctrl-C
    Run,
    /// Show the current phase and countdown
    State {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Place a bet on the open round
    Bet {
        /// Player id
        user: String,
        /// heads or tails
        side: Side,
        /// Coins to stake
        stake: i64,
        /// Round id (defaults to the current round)
        #[arg(short, long)]
        round: Option<String>,
    },
    /// Show a player's coin balance
    Balance {
        /// Player id
        user: String,
    },
    /// Show a player's ledger entries
    History {
        /// Player id
        user: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a player's bets
    Bets {
        /// Player id
        user: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List recent rounds
    Rounds {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Show one round with its bets
    Round {
        /// Round id
        round_id: String,
    },
    /// Credit coins to a player
    Grant {
        /// Player id
        user: String,
        /// Coins to credit
        amount: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "coinflip={},coinflip_core={}",
            log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Get data directory
    let data_dir = cli.data_dir.unwrap_or_else(config::default_data_dir);

    // Ensure data directory exists
    tokio::fs::create_dir_all(&data_dir).await?;

    let game_config = config::load_game_config(&data_dir, cli.config.as_deref())?;
    tracing::debug!("Using data directory {}", data_dir.display());
    let game = CoinflipGame::open(&data_dir, game_config).await?;

    // Execute command
    let result = match cli.command {
        Commands::Run => commands::run_game(&game).await,
        Commands::State { json } => commands::show_state(&game, json).await,
        Commands::Bet {
            user,
            side,
            stake,
            round,
        } => commands::place_bet(&game, &user, side, stake, round.as_deref()).await,
        Commands::Balance { user } => commands::show_balance(&game, &user).await,
        Commands::History { user, limit } => commands::show_history(&game, &user, limit).await,
        Commands::Bets { user, limit } => commands::show_bets(&game, &user, limit).await,
        Commands::Rounds { limit } => commands::list_rounds(&game, limit).await,
        Commands::Round { round_id } => commands::show_round(&game, &round_id).await,
        Commands::Grant { user, amount } => commands::grant(&game, &user, amount).await,
    };

    if let Err(e) = result {
        match e {
            CoinflipError::InsufficientFunds { need, available } => {
                eprintln!("Error: Insufficient funds");
                eprintln!("Need: {} coins, Available: {} coins", need, available);
            }
            CoinflipError::BettingClosed => {
                eprintln!("Error: Betting is closed for this round");
                eprintln!("Use 'coinflip state' to see when the next round opens");
            }
            CoinflipError::RoundMismatch { requested, current } => {
                eprintln!("Error: Round {} is not open", requested);
                if let Some(current) = current {
                    eprintln!("Current round: {}", current);
                }
            }
            CoinflipError::DuplicateBet { round_id, user_id } => {
                eprintln!(
                    "Error: '{}' already has a bet in round {}",
                    user_id, round_id
                );
            }
            _ => {
                eprintln!("Error: {}", e);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
