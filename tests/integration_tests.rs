//! Integration tests for the ladder rotation backtester
//!
//! These tests verify that all components work together correctly.

use approx::assert_relative_eq;
use chrono::NaiveDate;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use tempfile::TempDir;

use ladder_rotation::aggregate::{aggregate, StockStatus};
use ladder_rotation::config::LadderTier;
use ladder_rotation::data::{CsvIndicatorProvider, SeriesSpec};
use ladder_rotation::indicators::sma_money;
use ladder_rotation::report;
use ladder_rotation::runner::{run_all, RunOptions};
use ladder_rotation::{
    run_backtest, Config, DailyBar, Money, SellReason, StockSeries, StrategyConfig, Symbol,
    TradeAction,
};

// =============================================================================
// Test Utilities
// =============================================================================

fn day(n: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + chrono::Days::new(n)
}

/// Series with a fixed MA120 of 100.
fn flat_ma_series(closes: &[Money]) -> StockSeries {
    let bars = closes
        .iter()
        .enumerate()
        .map(|(i, c)| DailyBar::new(day(i as u64), *c, Some(Money::from_i64(100))))
        .collect();
    StockSeries::new(Symbol::new("600036"), bars).unwrap()
}

/// Deterministic random walk with a trailing moving average.
fn random_walk_series(seed: u64, days: usize, ma_period: usize) -> StockSeries {
    let mut state = seed;
    let mut price = 100.0_f64;
    let mut closes = Vec::with_capacity(days);
    for _ in 0..days {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let step = ((state >> 33) as f64 / (1u64 << 31) as f64 - 0.5) * 0.08;
        price = (price * (1.0 + step)).max(1.0);
        closes.push(Money::from_f64(price).round_dp(2));
    }
    let gapless: Vec<Option<Money>> = closes.iter().copied().map(Some).collect();
    let ma = sma_money(&gapless, ma_period);
    let bars = closes
        .iter()
        .zip(ma)
        .enumerate()
        .map(|(i, (c, m))| DailyBar::new(day(i as u64), *c, m))
        .collect();
    StockSeries::new(Symbol::new(format!("RW{seed}")), bars).unwrap()
}

fn scenario_config() -> StrategyConfig {
    StrategyConfig {
        entry_threshold: 0.88,
        ladder_down: vec![LadderTier::new(0.88, 0.1), LadderTier::new(0.80, 0.2)],
        single_layer_profit: 0.12,
        full_clear_threshold: 1.12,
        initial_capital: 100_000.0,
        ..StrategyConfig::balanced()
    }
}

fn write_csv(dir: &std::path::Path, symbol: &str, closes: &[f64]) {
    let mut body = String::from("date,open,high,low,close,volume\n");
    for (i, c) in closes.iter().enumerate() {
        body.push_str(&format!(
            "{},{c},{},{},{c},{}\n",
            day(i as u64),
            c * 1.01,
            c * 0.99,
            1000 + i
        ));
    }
    fs::write(dir.join(format!("{symbol}.csv")), body).unwrap();
}

// =============================================================================
// Scenario Tests
// =============================================================================

#[test]
fn test_reference_scenario() {
    let closes = [dec!(87), dec!(79), dec!(97.5), dec!(113)].map(Money::from);
    let result = run_backtest(&flat_ma_series(&closes), &scenario_config()).unwrap();
    let t = &result.trades;

    assert_eq!(t[0].action, TradeAction::Buy);
    assert_eq!(t[0].ladder_index, 0);
    assert_eq!(t[0].amount, Money::from(dec!(10000)));
    assert_relative_eq!(t[0].shares.to_f64(), 114.94, epsilon = 0.01);

    assert_eq!(t[1].action, TradeAction::Buy);
    assert_eq!(t[1].ladder_index, 1);
    assert_eq!(t[1].amount, Money::from(dec!(20000)));
    assert_relative_eq!(t[1].shares.to_f64(), 253.16, epsilon = 0.01);

    // 97.5 >= 87 * 1.12 closes tier 0. Tier 1's own target (79 * 1.12 = 88.48)
    // is also met that day, so it closes alongside, ascending by tier.
    assert_eq!(t[2].date, day(2));
    assert_eq!(t[2].action, TradeAction::SellLayer);
    assert_eq!(t[2].ladder_index, 0);
    assert_eq!(t[2].reason, Some(SellReason::LayerTakeProfit));
    assert_relative_eq!(t[2].profit_rate.unwrap(), 97.5 / 87.0 - 1.0, epsilon = 1e-9);
    assert_eq!(t[2].holding_days, Some(2));
    assert_eq!(t[3].date, day(2));
    assert_eq!(t[3].ladder_index, 1);

    // Day 4 is flat and 113 is far above the entry threshold.
    assert_eq!(t.len(), 4);
    assert!(result.is_flat());
    assert!(result.final_position.conservation_holds());
}

#[test]
fn test_full_clear_liquidates_all_layers_at_once() {
    // MA120 falls with the price; 70 >= 60 * 1.12 triggers the clear even
    // though both layers are under water.
    let bars = vec![
        DailyBar::new(day(0), Money::from_i64(87), Some(Money::from_i64(100))),
        DailyBar::new(day(1), Money::from_i64(79), Some(Money::from_i64(100))),
        DailyBar::new(day(2), Money::from_i64(70), Some(Money::from_i64(60))),
    ];
    let series = StockSeries::new(Symbol::new("601318"), bars).unwrap();
    let result = run_backtest(&series, &scenario_config()).unwrap();

    let sells: Vec<_> = result.sells().collect();
    assert_eq!(sells.len(), 2);
    assert!(sells.iter().all(|s| s.action == TradeAction::SellAll));
    assert!(sells.iter().all(|s| s.reason == Some(SellReason::FullClear)));
    assert_eq!(sells[0].ladder_index, 0);
    assert_eq!(sells[1].ladder_index, 1);
    assert!(sells.iter().all(|s| !s.is_profitable()));

    // Losses flow into recycled cash; the identity still balances.
    let position = &result.final_position;
    assert!(position.is_flat());
    assert!(position.realized_pnl().is_negative());
    assert_eq!(
        position.available_cash(),
        Money::from_i64(100_000) + position.realized_pnl()
    );
}

#[test]
fn test_no_threshold_crossing_means_no_trades() {
    let closes: Vec<Money> = (0..50).map(|i| Money::from_i64(95 + i % 10)).collect();
    let result = run_backtest(&flat_ma_series(&closes), &scenario_config()).unwrap();

    assert!(result.trades.is_empty());
    assert!(result.is_flat());
    assert_eq!(
        result.final_position.undeployed_cash(),
        Money::from_i64(100_000)
    );
    assert_eq!(result.metrics.total_return, 0.0);
    assert_eq!(result.metrics.max_drawdown, 0.0);
}

#[test]
fn test_empty_series_gives_empty_result() {
    let result = run_backtest(
        &StockSeries::empty(Symbol::new("EMPTY")),
        &scenario_config(),
    )
    .unwrap();
    assert!(result.trades.is_empty());
    assert_eq!(result.metrics.total_return, 0.0);
}

// =============================================================================
// Property Tests
// =============================================================================

#[test]
fn test_invariants_hold_on_random_walks() {
    for preset in StrategyConfig::PRESETS {
        let config = StrategyConfig::preset(preset).unwrap();
        for seed in 1..=8 {
            let series = random_walk_series(seed, 600, 60);
            let result = run_backtest(&series, &config).unwrap();
            let capital = Money::from_f64(config.initial_capital);

            // Trades are chronological and each sell closes a layer that was open.
            let mut open: BTreeSet<usize> = BTreeSet::new();
            let mut realized = Money::ZERO;
            let mut last_date = None;
            let mut trades = result.trades.iter().peekable();

            for snapshot in &result.snapshots {
                while let Some(trade) = trades.next_if(|t| t.date == snapshot.date) {
                    assert!(last_date.map_or(true, |d| d <= trade.date));
                    last_date = Some(trade.date);
                    match trade.action {
                        TradeAction::Buy => {
                            assert!(
                                open.insert(trade.ladder_index),
                                "tier {} opened twice",
                                trade.ladder_index
                            );
                            if let Some(&deepest) = open.iter().next_back() {
                                assert_eq!(deepest, trade.ladder_index);
                            }
                        }
                        _ => {
                            assert!(open.remove(&trade.ladder_index));
                            realized += trade.profit_amount.unwrap();
                        }
                    }
                }

                // Capital conservation after every simulated day.
                assert_eq!(snapshot.cash + snapshot.committed, capital + realized);
                assert_eq!(snapshot.open_layers, open.len());
            }
            assert!(trades.next().is_none());
            assert_eq!(open.len(), result.uncompleted.len());
            assert!(result.metrics.max_drawdown >= 0.0);
        }
    }
}

#[test]
fn test_full_clear_never_mixes_with_layer_sells() {
    let config = StrategyConfig::balanced();
    for seed in 20..30 {
        let result = run_backtest(&random_walk_series(seed, 500, 40), &config).unwrap();
        let mut by_day: BTreeMap<NaiveDate, HashSet<TradeAction>> = BTreeMap::new();
        for t in result.sells() {
            by_day.entry(t.date).or_default().insert(t.action);
        }
        for actions in by_day.values() {
            assert_eq!(actions.len(), 1, "mixed sell kinds on one day");
        }
    }
}

// =============================================================================
// End-to-End Tests
// =============================================================================

#[test]
fn test_csv_to_report_pipeline() {
    let data = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    // Rises to warm the MA, dips through the ladder, then recovers.
    let mut closes: Vec<f64> = vec![100.0; 10];
    closes.extend([85.0, 78.0, 80.0, 95.0, 120.0]);
    write_csv(data.path(), "600036", &closes);
    write_csv(data.path(), "601318", &[100.0; 15]);

    let provider = CsvIndicatorProvider::new(
        data.path(),
        SeriesSpec {
            ma_period: 10,
            atr_period: 3,
            volume_window: 5,
            start_date: None,
            end_date: None,
        },
    );
    let config = StrategyConfig::balanced();
    let symbols = vec![
        Symbol::new("600036"),
        Symbol::new("601318"),
        Symbol::new("000002"),
    ];

    let outcomes = run_all(&provider, &symbols, &config, &RunOptions::default());
    assert_eq!(outcomes[0].status, StockStatus::Completed);
    assert_eq!(outcomes[1].status, StockStatus::Completed);
    assert!(matches!(outcomes[2].status, StockStatus::Failed(_)));

    let first = outcomes[0].result.as_ref().unwrap();
    assert!(first.trades.len() >= 2);
    assert!(first.trades[0].annotations.atr_pct.is_some());
    assert!(first.trades[0].annotations.volume_ratio.is_some());
    assert!(outcomes[1].result.as_ref().unwrap().trades.is_empty());

    let summary = aggregate(&outcomes, &config);
    assert_eq!(summary.completed_stocks, 2);
    assert_eq!(summary.failed_stocks, 1);
    assert_eq!(aggregate(&outcomes, &config), summary);

    let paths = report::export(&summary, &outcomes, out.path(), "it").unwrap();
    assert!(paths.trades.exists());
    assert!(paths.summary.exists());
}

#[test]
fn test_config_file_drives_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    let mut config = Config::default();
    config.strategy = StrategyConfig::aggressive();
    config.backtest.symbols = vec!["600036".into()];
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = Config::from_file(&path).unwrap();
    assert_eq!(loaded.strategy, StrategyConfig::aggressive());
    assert_eq!(loaded.backtest.symbols(), vec![Symbol::new("600036")]);
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.json");
    let mut config = Config::default();
    config.strategy.ladder_down = vec![LadderTier::new(0.8, 0.5), LadderTier::new(0.9, 0.5)];
    fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

    let err = Config::from_file(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("not below the previous tier"));
}
