//! Presets command: print the built-in strategy parameter sets

use anyhow::{Context, Result};
use ladder_rotation::StrategyConfig;

pub fn run(name: Option<String>) -> Result<()> {
    let names: Vec<&str> = match &name {
        Some(n) => vec![n.as_str()],
        None => StrategyConfig::PRESETS.to_vec(),
    };

    for name in names {
        let preset = StrategyConfig::preset(name)?;
        let json = serde_json::to_string_pretty(&preset).context("Failed to serialize preset")?;
        println!("// {}\n{}\n", name, json);
    }

    Ok(())
}
