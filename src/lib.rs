//! MA120 Ladder Rotation
//!
//! Backtester for a layered mean-reversion strategy on daily equity data:
//! positions are built in tiers as the close falls below its 120-day moving
//! average, trimmed per layer on a fixed gain and liquidated in full when the
//! close recovers above the average. Stocks are simulated independently and
//! summarized together.

pub mod aggregate;
pub mod backtest;
pub mod config;
pub mod data;
pub mod indicators;
pub mod ladder;
pub mod report;
pub mod runner;
pub mod strategy;
pub mod types;

pub use aggregate::{aggregate, SummaryReport};
pub use backtest::{run_backtest, BacktestResult};
pub use config::{Config, StrategyConfig};
pub use types::*;
