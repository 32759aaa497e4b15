use anyhow::{Context, Result};
use coinflip_core::GameConfig;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("coinflip")
}

/// Resolve the game configuration: explicit file, else `config.json` in the
/// data directory if present, else defaults. `COINFLIP_*` variables win.
pub fn load_game_config(data_dir: &Path, explicit: Option<&Path>) -> Result<GameConfig> {
    let base = match explicit {
        Some(path) => GameConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let fallback = data_dir.join(CONFIG_FILE);
            if fallback.exists() {
                GameConfig::from_file(&fallback)
                    .with_context(|| format!("Failed to load config from {}", fallback.display()))?
            } else {
                GameConfig::default()
            }
        }
    };

    let config = base.with_env_overrides();
    config.validate().context("Invalid game configuration")?;
    Ok(config)
}
