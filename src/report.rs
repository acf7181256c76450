//! Console summary and file export of a run

use anyhow::{Context, Result};
use chrono::NaiveDate;
use itertools::Itertools;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::aggregate::{StockOutcome, SummaryReport};
use crate::config::StrategyConfig;
use crate::{Money, Trade};

fn pct(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

/// Print overall statistics and the per-stock table.
pub fn print_summary(report: &SummaryReport, config: &StrategyConfig) {
    let ladder = config
        .ladder_down
        .iter()
        .map(|t| format!("{:.0}%→{:.0}%", t.price_ratio * 100.0, t.fund_fraction * 100.0))
        .join(", ");

    println!("\n{}", "=".repeat(72));
    println!("MA120 LADDER ROTATION BACKTEST");
    println!("{}", "=".repeat(72));
    println!("Capital per stock:     {:.2}", config.initial_capital);
    println!("Entry threshold:       {}", pct(config.entry_threshold));
    println!("Ladder:                {}", ladder);
    println!("Layer take-profit:     {}", pct(config.single_layer_profit));
    if config.enable_full_clear {
        println!("Full clear:            {} of MA120", pct(config.full_clear_threshold));
    } else {
        println!("Full clear:            disabled");
    }
    println!("Max positions:         {}", report.max_positions);
    println!("{}", "-".repeat(72));
    println!(
        "Stocks:                {} ({} ok, {} failed, {} cancelled)",
        report.total_stocks, report.completed_stocks, report.failed_stocks, report.cancelled_stocks
    );
    println!(
        "Completion rate:       {} ({} flat, {} holding, {} never entered)",
        pct(report.completion_rate),
        report.flat_stocks,
        report.holding_stocks,
        report.idle_stocks
    );
    println!(
        "Trade completion:      {} ({} sold, {} open)",
        pct(report.trade_completion_rate),
        report.completed_trades,
        report.open_layers
    );
    println!("Average return:        {}", pct(report.average_return));
    println!("Average drawdown:      {}", pct(report.average_drawdown));
    println!("Average holding:       {:.1} days", report.average_holding_days);
    println!("Realized P&L:          {:.2}", report.total_realized_pnl.to_f64());
    println!("Unrealized P&L:        {:.2}", report.total_unrealized_pnl.to_f64());
    println!(
        "Capital utilization:   peak {} / avg {}",
        pct(report.peak_utilization),
        pct(report.average_utilization)
    );
    println!("{}", "-".repeat(72));
    println!(
        "{:<10} {:>10} {:>9} {:>9} {:>6} {:>6} {:>6}  {}",
        "Symbol", "Status", "Return", "MaxDD", "Win%", "Sold", "Open", "Note"
    );
    for row in &report.rows {
        println!(
            "{:<10} {:>10} {:>9} {:>9} {:>6.1} {:>6} {:>6}  {}",
            row.symbol.as_str(),
            row.status,
            pct(row.total_return),
            pct(row.max_drawdown),
            row.win_rate * 100.0,
            row.completed_trades,
            row.uncompleted_trades,
            row.error.as_deref().unwrap_or("")
        );
    }
    println!("{}", "=".repeat(72));
}

#[derive(Debug, Serialize)]
struct TradeRecord<'a> {
    symbol: &'a str,
    date: NaiveDate,
    action: &'static str,
    ladder_index: usize,
    price: Money,
    shares: Money,
    amount: Money,
    profit_amount: Option<Money>,
    profit_rate: Option<f64>,
    holding_days: Option<i64>,
    entry_date: Option<NaiveDate>,
    entry_price: Option<Money>,
    target_price: Option<Money>,
    reason: Option<String>,
    ma120: Option<Money>,
    price_ma120_pct: Option<f64>,
    atr_pct: Option<f64>,
    volume_ratio: Option<f64>,
    index_price: Option<f64>,
    cumulative_pnl: Money,
}

impl<'a> TradeRecord<'a> {
    fn new(symbol: &'a str, t: &Trade) -> Self {
        let round = |m: Money| m.round_dp(4);
        TradeRecord {
            symbol,
            date: t.date,
            action: t.action.as_str(),
            ladder_index: t.ladder_index,
            price: t.price,
            shares: round(t.shares),
            amount: round(t.amount),
            profit_amount: t.profit_amount.map(round),
            profit_rate: t.profit_rate,
            holding_days: t.holding_days,
            entry_date: t.entry_date,
            entry_price: t.entry_price,
            target_price: t.target_price.map(round),
            reason: t.reason.map(|r| r.to_string()),
            ma120: t.annotations.ma120.map(round),
            price_ma120_pct: t.annotations.price_ma120_pct,
            atr_pct: t.annotations.atr_pct,
            volume_ratio: t.annotations.volume_ratio,
            index_price: t.annotations.index_price,
            cumulative_pnl: round(t.annotations.cumulative_pnl),
        }
    }
}

#[derive(Debug, Serialize)]
struct SnapshotRecord<'a> {
    symbol: &'a str,
    date: NaiveDate,
    open_layers: usize,
    committed: Money,
    market_value: Money,
    cash: Money,
    equity: Money,
}

/// Files written by [`export`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExportPaths {
    pub trades: PathBuf,
    pub stocks: PathBuf,
    pub daily: PathBuf,
    pub summary: PathBuf,
}

/// Write trades, per-stock rows, daily snapshots and the summary under `dir`.
pub fn export(
    report: &SummaryReport,
    outcomes: &[StockOutcome],
    dir: impl AsRef<Path>,
    stamp: &str,
) -> Result<ExportPaths> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create results dir {}", dir.display()))?;

    let paths = ExportPaths {
        trades: dir.join(format!("trades_{stamp}.csv")),
        stocks: dir.join(format!("stock_results_{stamp}.csv")),
        daily: dir.join(format!("daily_{stamp}.csv")),
        summary: dir.join(format!("summary_{stamp}.json")),
    };

    let results = || outcomes.iter().filter_map(|o| o.result.as_ref());

    let mut writer = csv::Writer::from_path(&paths.trades).context("Failed to create trades CSV")?;
    for result in results() {
        for trade in &result.trades {
            writer.serialize(TradeRecord::new(result.symbol.as_str(), trade))?;
        }
    }
    writer.flush()?;

    let mut writer = csv::Writer::from_path(&paths.stocks).context("Failed to create stock CSV")?;
    for row in &report.rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    let mut writer = csv::Writer::from_path(&paths.daily).context("Failed to create daily CSV")?;
    for result in results() {
        for s in &result.snapshots {
            writer.serialize(SnapshotRecord {
                symbol: result.symbol.as_str(),
                date: s.date,
                open_layers: s.open_layers,
                committed: s.committed.round_dp(2),
                market_value: s.market_value.round_dp(2),
                cash: s.cash.round_dp(2),
                equity: s.equity.round_dp(2),
            })?;
        }
    }
    writer.flush()?;

    let json = serde_json::to_string_pretty(report).context("Failed to serialize summary")?;
    fs::write(&paths.summary, json).context("Failed to write summary JSON")?;

    info!("Results saved to {}", dir.display());
    Ok(paths)
}
