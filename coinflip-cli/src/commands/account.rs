use super::{format_outcome, short_id};
use coinflip_core::{CoinflipGame, Result};
use comfy_table::{presets::UTF8_FULL, Table};

pub async fn show_balance(game: &CoinflipGame, user: &str) -> Result<()> {
    let account = game.get_account(user).await?;

    println!("Balance for '{}':", account.user_id);
    println!("  Balance: {} coins", account.balance);
    println!("  Total earned: {} coins", account.total_earned);
    println!("  Total spent: {} coins", account.total_spent);
    println!(
        "  Member since: {}",
        account.created_at.format("%Y-%m-%d %H:%M")
    );

    Ok(())
}

pub async fn show_history(game: &CoinflipGame, user: &str, limit: usize) -> Result<()> {
    let transactions = game.list_transactions(user, limit).await?;

    if transactions.is_empty() {
        println!("No transactions for '{}'", user);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Time", "Kind", "Amount", "Balance", "Reference"]);

    for tx in transactions {
        let reference = tx
            .reference
            .as_ref()
            .map(|r| format!("{} {}", r.kind_str(), short_id(r.id())))
            .unwrap_or_default();

        table.add_row(vec![
            tx.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            tx.kind.to_string(),
            format!("{:+}", tx.amount),
            tx.balance_after.to_string(),
            reference,
        ]);
    }

    println!("{}", table);
    Ok(())
}

pub async fn show_bets(game: &CoinflipGame, user: &str, limit: usize) -> Result<()> {
    let bets = game.user_bets(user, limit).await?;

    if bets.is_empty() {
        println!("No bets for '{}'", user);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Placed", "Round", "Side", "Stake", "Result", "Payout"]);

    for bet in bets {
        table.add_row(vec![
            bet.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            short_id(&bet.round_id).to_string(),
            bet.side.to_string(),
            bet.stake.to_string(),
            format_outcome(bet.is_winner).to_string(),
            bet.payout.map(|p| p.to_string()).unwrap_or_default(),
        ]);
    }

    println!("{}", table);
    Ok(())
}

pub async fn grant(game: &CoinflipGame, user: &str, amount: i64) -> Result<()> {
    let balance = game.grant(user, amount).await?;

    println!("Granted {} coins to '{}'", amount, user);
    println!("New balance: {} coins", balance);

    Ok(())
}
