//! Portfolio-level summary over independent per-stock runs
//!
//! Every successful stock counts once, regardless of its capital. Failed and
//! cancelled stocks appear in the detail table but not in any average.

use serde::{Deserialize, Serialize};

use crate::backtest::BacktestResult;
use crate::config::StrategyConfig;
use crate::{Money, Symbol};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum StockStatus {
    Completed,
    Failed(String),
    Cancelled,
}

impl StockStatus {
    pub fn label(&self) -> &'static str {
        match self {
            StockStatus::Completed => "completed",
            StockStatus::Failed(_) => "failed",
            StockStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of one stock's task, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockOutcome {
    pub symbol: Symbol,
    pub status: StockStatus,
    pub result: Option<BacktestResult>,
}

impl StockOutcome {
    pub fn completed(result: BacktestResult) -> Self {
        Self {
            symbol: result.symbol.clone(),
            status: StockStatus::Completed,
            result: Some(result),
        }
    }

    pub fn failed(symbol: Symbol, message: impl Into<String>) -> Self {
        Self {
            symbol,
            status: StockStatus::Failed(message.into()),
            result: None,
        }
    }

    pub fn cancelled(symbol: Symbol) -> Self {
        Self {
            symbol,
            status: StockStatus::Cancelled,
            result: None,
        }
    }
}

/// One line of the per-stock detail table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockRow {
    pub symbol: Symbol,
    pub name: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub buy_count: usize,
    pub completed_trades: usize,
    pub uncompleted_trades: usize,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    pub profit_loss_ratio: Option<f64>,
    pub avg_holding_days: f64,
    pub is_flat: bool,
    pub peak_committed: Money,
    pub avg_committed: Money,
}

impl StockRow {
    fn from_outcome(outcome: &StockOutcome) -> Self {
        let error = match &outcome.status {
            StockStatus::Failed(msg) => Some(msg.clone()),
            _ => None,
        };
        let mut row = StockRow {
            symbol: outcome.symbol.clone(),
            name: None,
            status: outcome.status.label().to_string(),
            error,
            total_return: 0.0,
            max_drawdown: 0.0,
            win_rate: 0.0,
            buy_count: 0,
            completed_trades: 0,
            uncompleted_trades: 0,
            realized_pnl: Money::ZERO,
            unrealized_pnl: Money::ZERO,
            profit_loss_ratio: None,
            avg_holding_days: 0.0,
            is_flat: true,
            peak_committed: Money::ZERO,
            avg_committed: Money::ZERO,
        };
        if let Some(result) = &outcome.result {
            let m = &result.metrics;
            row.name = result.name.clone();
            row.total_return = m.total_return;
            row.max_drawdown = m.max_drawdown;
            row.win_rate = m.win_rate;
            row.buy_count = m.buy_count;
            row.completed_trades = m.completed_trade_count;
            row.uncompleted_trades = m.uncompleted_trade_count;
            row.realized_pnl = m.realized_pnl;
            row.unrealized_pnl = m.unrealized_pnl;
            row.profit_loss_ratio = m.profit_loss_ratio;
            row.avg_holding_days = m.avg_holding_days;
            row.is_flat = result.is_flat();
            row.peak_committed = m.peak_committed;
            row.avg_committed = m.avg_committed;
        }
        row
    }
}

/// Aggregate statistics across all stocks of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub total_stocks: usize,
    pub completed_stocks: usize,
    pub failed_stocks: usize,
    pub cancelled_stocks: usize,
    /// Successful stocks that ended flat after at least one sell.
    pub flat_stocks: usize,
    /// Successful stocks still holding layers at the end.
    pub holding_stocks: usize,
    /// Successful stocks that never entered.
    pub idle_stocks: usize,
    /// `flat_stocks / (flat_stocks + holding_stocks)`; idle stocks are left out.
    pub completion_rate: f64,
    /// Sell trades across all stocks.
    pub completed_trades: usize,
    /// Layers still open across all stocks.
    pub open_layers: usize,
    /// `completed_trades / (completed_trades + open_layers)`.
    pub trade_completion_rate: f64,
    pub average_return: f64,
    pub average_drawdown: f64,
    /// Mean holding days over every completed trade, pooled across stocks.
    pub average_holding_days: f64,
    pub total_realized_pnl: Money,
    pub total_unrealized_pnl: Money,
    pub average_peak_committed: Money,
    pub average_committed: Money,
    pub peak_utilization: f64,
    pub average_utilization: f64,
    pub max_positions: usize,
    pub rows: Vec<StockRow>,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Combine per-stock outcomes into a summary. Pure; same input, same report.
pub fn aggregate(outcomes: &[StockOutcome], config: &StrategyConfig) -> SummaryReport {
    let results: Vec<&BacktestResult> = outcomes.iter().filter_map(|o| o.result.as_ref()).collect();
    let count_status = |f: fn(&StockStatus) -> bool| outcomes.iter().filter(|o| f(&o.status)).count();

    let completed_stocks = results.len();
    let flat_stocks = results.iter().filter(|r| r.has_cycled()).count();
    let holding_stocks = results.iter().filter(|r| !r.is_flat()).count();
    let completed_trades: usize = results.iter().map(|r| r.metrics.completed_trade_count).sum();
    let open_layers: usize = results.iter().map(|r| r.metrics.uncompleted_trade_count).sum();

    let holding_days: Vec<f64> = results
        .iter()
        .flat_map(|r| r.sells())
        .filter_map(|t| t.holding_days)
        .map(|d| d as f64)
        .collect();

    let returns: Vec<f64> = results.iter().map(|r| r.metrics.total_return).collect();
    let drawdowns: Vec<f64> = results.iter().map(|r| r.metrics.max_drawdown).collect();
    let peak_util: Vec<f64> = results
        .iter()
        .map(|r| (r.metrics.peak_committed / r.initial_capital).to_f64())
        .collect();
    let avg_util: Vec<f64> = results
        .iter()
        .map(|r| (r.metrics.avg_committed / r.initial_capital).to_f64())
        .collect();

    let per_stock_mean = |f: fn(&BacktestResult) -> Money| -> Money {
        if results.is_empty() {
            Money::ZERO
        } else {
            results.iter().map(|r| f(r)).sum::<Money>() / Money::from_i64(results.len() as i64)
        }
    };

    SummaryReport {
        total_stocks: outcomes.len(),
        completed_stocks,
        failed_stocks: count_status(|s| matches!(s, StockStatus::Failed(_))),
        cancelled_stocks: count_status(|s| matches!(s, StockStatus::Cancelled)),
        flat_stocks,
        holding_stocks,
        idle_stocks: completed_stocks - flat_stocks - holding_stocks,
        completion_rate: ratio(flat_stocks, flat_stocks + holding_stocks),
        completed_trades,
        open_layers,
        trade_completion_rate: ratio(completed_trades, completed_trades + open_layers),
        average_return: mean(&returns),
        average_drawdown: mean(&drawdowns),
        average_holding_days: mean(&holding_days),
        total_realized_pnl: results.iter().map(|r| r.metrics.realized_pnl).sum(),
        total_unrealized_pnl: results.iter().map(|r| r.metrics.unrealized_pnl).sum(),
        average_peak_committed: per_stock_mean(|r| r.metrics.peak_committed),
        average_committed: per_stock_mean(|r| r.metrics.avg_committed),
        peak_utilization: mean(&peak_util),
        average_utilization: mean(&avg_util),
        max_positions: config.max_positions,
        rows: outcomes.iter().map(StockRow::from_outcome).collect(),
    }
}

/// Convenience wrapper when every stock succeeded.
pub fn aggregate_results(results: &[BacktestResult], config: &StrategyConfig) -> SummaryReport {
    let outcomes: Vec<StockOutcome> = results.iter().cloned().map(StockOutcome::completed).collect();
    aggregate(&outcomes, config)
}
