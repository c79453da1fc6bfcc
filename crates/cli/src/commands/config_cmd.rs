//! `stepwise config` — show the effective configuration.

use anyhow::Context;
use stepwise_config::AppConfig;

pub fn show() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    let path = AppConfig::config_dir().join("config.toml");

    println!("# {}", path.display());
    if !config.has_api_key() {
        println!("# No API key set (STEPWISE_API_KEY or OPENAI_API_KEY)");
    }
    println!();
    print!("{}", config.to_redacted_toml()?);
    Ok(())
}
