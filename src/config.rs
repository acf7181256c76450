//! Configuration management
//!
//! Loads the JSON run configuration, applies environment overrides for the
//! data and results directories, and validates the ladder before any
//! backtest starts.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::{Money, Symbol};

pub const ENV_DATA_DIR: &str = "LADDER_DATA_DIR";
pub const ENV_RESULTS_DIR: &str = "LADDER_RESULTS_DIR";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
}

impl Config {
    /// Load configuration from JSON file, then apply env overrides and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env_overrides();
        config
            .strategy
            .validate()
            .context("Invalid strategy section")?;

        Ok(config)
    }

    /// Build a configuration from a named preset with default backtest settings.
    pub fn from_preset(name: &str) -> Result<Self> {
        let strategy = StrategyConfig::preset(name)?;
        let mut config = Config {
            strategy,
            backtest: BacktestConfig::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            self.backtest.data_dir = dir;
        }
        if let Ok(dir) = std::env::var(ENV_RESULTS_DIR) {
            self.backtest.results_dir = dir;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("ladder_down must contain at least one tier")]
    EmptyLadder,
    #[error("tier {index}: price ratio {ratio} must be positive")]
    InvalidRatio { index: usize, ratio: f64 },
    #[error("tier {index}: price ratio {ratio} is not below the previous tier's {previous}")]
    NotDecreasing {
        index: usize,
        ratio: f64,
        previous: f64,
    },
    #[error("tier {index}: fund fraction {fraction} must be in (0, 1]")]
    InvalidFraction { index: usize, fraction: f64 },
    #[error("fund fractions sum to {0}, which exceeds 1.0")]
    FractionsExceedCapital(f64),
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("unknown preset '{0}' (expected conservative, aggressive or balanced)")]
    UnknownPreset(String),
}

/// One ladder tier: open when close is at or below `reference * price_ratio`,
/// committing `fund_fraction` of the stock's capital.
///
/// Serialized as a `[price_ratio, fund_fraction]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct LadderTier {
    pub price_ratio: f64,
    pub fund_fraction: f64,
}

impl LadderTier {
    pub const fn new(price_ratio: f64, fund_fraction: f64) -> Self {
        Self {
            price_ratio,
            fund_fraction,
        }
    }
}

impl From<(f64, f64)> for LadderTier {
    fn from((price_ratio, fund_fraction): (f64, f64)) -> Self {
        Self::new(price_ratio, fund_fraction)
    }
}

impl From<LadderTier> for (f64, f64) {
    fn from(tier: LadderTier) -> Self {
        (tier.price_ratio, tier.fund_fraction)
    }
}

/// Which MA120 value tiers 1.. are measured against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LadderReference {
    /// Today's MA120.
    #[default]
    Today,
    /// MA120 on the day the current cycle's tier 0 was opened.
    Entry,
}

/// Parameters of one backtest run. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub entry_threshold: f64,
    pub ladder_down: Vec<LadderTier>,
    pub single_layer_profit: f64,
    #[serde(default = "default_true")]
    pub enable_full_clear: bool,
    pub full_clear_threshold: f64,
    /// Capital allocated to each stock independently.
    pub initial_capital: f64,
    /// Informational; passed through to the summary report.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default)]
    pub ladder_reference: LadderReference,
}

fn default_true() -> bool {
    true
}

fn default_max_positions() -> usize {
    5
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

impl StrategyConfig {
    pub const PRESETS: [&'static str; 3] = ["conservative", "aggressive", "balanced"];

    pub fn balanced() -> Self {
        StrategyConfig {
            entry_threshold: 0.88,
            ladder_down: vec![
                LadderTier::new(0.88, 0.1),
                LadderTier::new(0.80, 0.2),
                LadderTier::new(0.70, 0.3),
                LadderTier::new(0.60, 0.4),
            ],
            single_layer_profit: 0.12,
            enable_full_clear: true,
            full_clear_threshold: 1.12,
            initial_capital: 100_000.0,
            max_positions: 5,
            ladder_reference: LadderReference::Today,
        }
    }

    /// Deeper entry, denser ladder, earlier exits.
    pub fn conservative() -> Self {
        StrategyConfig {
            entry_threshold: 0.85,
            ladder_down: vec![
                LadderTier::new(0.85, 0.05),
                LadderTier::new(0.80, 0.10),
                LadderTier::new(0.75, 0.15),
                LadderTier::new(0.70, 0.20),
                LadderTier::new(0.65, 0.25),
                LadderTier::new(0.60, 0.25),
            ],
            single_layer_profit: 0.08,
            full_clear_threshold: 1.08,
            ..Self::balanced()
        }
    }

    /// Earlier entry, wider spacing, higher targets.
    pub fn aggressive() -> Self {
        StrategyConfig {
            entry_threshold: 0.90,
            ladder_down: vec![
                LadderTier::new(0.90, 0.15),
                LadderTier::new(0.80, 0.25),
                LadderTier::new(0.70, 0.30),
                LadderTier::new(0.60, 0.30),
            ],
            single_layer_profit: 0.15,
            full_clear_threshold: 1.15,
            ..Self::balanced()
        }
    }

    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::conservative()),
            "aggressive" => Ok(Self::aggressive()),
            "balanced" | "default" => Ok(Self::balanced()),
            other => Err(ConfigError::UnknownPreset(other.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ladder_down.is_empty() {
            return Err(ConfigError::EmptyLadder);
        }

        let mut total = 0.0;
        for (index, tier) in self.ladder_down.iter().enumerate() {
            if !(tier.price_ratio > 0.0 && tier.price_ratio.is_finite()) {
                return Err(ConfigError::InvalidRatio {
                    index,
                    ratio: tier.price_ratio,
                });
            }
            if index > 0 {
                let previous = self.ladder_down[index - 1].price_ratio;
                if tier.price_ratio >= previous {
                    return Err(ConfigError::NotDecreasing {
                        index,
                        ratio: tier.price_ratio,
                        previous,
                    });
                }
            }
            if !(tier.fund_fraction > 0.0 && tier.fund_fraction <= 1.0) {
                return Err(ConfigError::InvalidFraction {
                    index,
                    fraction: tier.fund_fraction,
                });
            }
            total += tier.fund_fraction;
        }
        // Tolerate float noise such as 0.1 + 0.2 + 0.3 + 0.4.
        if total > 1.0 + 1e-9 {
            return Err(ConfigError::FractionsExceedCapital(total));
        }

        for (field, value) in [
            ("entry_threshold", self.entry_threshold),
            ("single_layer_profit", self.single_layer_profit),
            ("full_clear_threshold", self.full_clear_threshold),
            ("initial_capital", self.initial_capital),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigError::NotPositive { field, value });
            }
        }

        Ok(())
    }

    pub fn tiers(&self) -> usize {
        self.ladder_down.len()
    }

    pub fn capital(&self) -> Money {
        Money::from_f64(self.initial_capital)
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub data_dir: String,
    pub results_dir: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    /// `date,close` CSV inside `data_dir` used for the index annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_file: Option<String>,
    #[serde(default = "default_ma_period")]
    pub ma_period: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_volume_window")]
    pub volume_window: usize,
    /// Run stocks one after another instead of on the rayon pool.
    #[serde(default)]
    pub sequential: bool,
}

fn default_ma_period() -> usize {
    120
}

fn default_atr_period() -> usize {
    14
}

fn default_volume_window() -> usize {
    20
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_dir: "data".to_string(),
            results_dir: "results".to_string(),
            symbols: Vec::new(),
            start_date: None,
            end_date: None,
            index_file: None,
            ma_period: default_ma_period(),
            atr_period: default_atr_period(),
            volume_window: default_volume_window(),
            sequential: false,
        }
    }
}

impl BacktestConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_presets_validate() {
        for name in StrategyConfig::PRESETS {
            let config = StrategyConfig::preset(name).unwrap();
            assert!(config.validate().is_ok(), "preset {name} should be valid");
        }
        assert!(matches!(
            StrategyConfig::preset("yolo"),
            Err(ConfigError::UnknownPreset(_))
        ));
    }

    #[test]
    fn test_rejects_non_decreasing_ladder() {
        let mut config = StrategyConfig::balanced();
        config.ladder_down[2].price_ratio = 0.85;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotDecreasing { index: 2, .. })
        ));
    }

    #[test]
    fn test_rejects_overcommitted_ladder() {
        let mut config = StrategyConfig::balanced();
        config.ladder_down[3].fund_fraction = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FractionsExceedCapital(_))
        ));
    }

    #[test]
    fn test_rejects_bad_fraction_and_empty_ladder() {
        let mut config = StrategyConfig::balanced();
        config.ladder_down[0].fund_fraction = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFraction { index: 0, .. })
        ));

        config.ladder_down.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyLadder));
    }

    #[test]
    fn test_rejects_non_positive_capital() {
        let config = StrategyConfig {
            initial_capital: 0.0,
            ..StrategyConfig::balanced()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "initial_capital",
                ..
            })
        ));
    }

    #[test]
    fn test_ladder_tier_pair_format() {
        let json = r#"{
            "strategy": {
                "entry_threshold": 0.88,
                "ladder_down": [[0.88, 0.1], [0.8, 0.2]],
                "single_layer_profit": 0.12,
                "full_clear_threshold": 1.12,
                "initial_capital": 50000
            },
            "backtest": {
                "data_dir": "prices",
                "results_dir": "out",
                "symbols": ["600036"],
                "start_date": "2020-01-01"
            }
        }"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.strategy.ladder_down[1], LadderTier::new(0.8, 0.2));
        assert!(config.strategy.enable_full_clear);
        assert_eq!(config.strategy.ladder_reference, LadderReference::Today);
        assert_eq!(config.backtest.ma_period, 120);
        assert_eq!(
            config.backtest.start_date,
            NaiveDate::from_ymd_opt(2020, 1, 1)
        );

        let round = serde_json::to_value(&config.strategy).unwrap();
        assert_eq!(round["ladder_down"][0], serde_json::json!([0.88, 0.1]));
    }
}
