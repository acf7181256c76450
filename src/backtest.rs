//! Backtesting engine
//!
//! Walks one stock's daily series in date order, feeding each tradable day to
//! the decision engine and applying its actions to the position tracker.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::ladder::{ClosedLayer, LadderError, Layer, Position};
use crate::strategy::{Action, LadderStrategy};
use crate::{
    DailyBar, Money, SellReason, StockSeries, Symbol, Trade, TradeAction, TradeAnnotations,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BacktestError {
    /// The engine asked for something the tracker refused.
    #[error("{symbol} on {date}: decision engine and tracker out of sync: {source}")]
    Desync {
        symbol: Symbol,
        date: NaiveDate,
        #[source]
        source: LadderError,
    },
    #[error("{symbol} on {date}: cash buckets no longer balance")]
    Conservation { symbol: Symbol, date: NaiveDate },
}

/// End-of-day state used for charting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub date: NaiveDate,
    pub open_layers: usize,
    pub committed: Money,
    pub market_value: Money,
    pub cash: Money,
    pub equity: Money,
}

/// An eligible tier skipped for lack of cash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissedOpportunity {
    pub date: NaiveDate,
    pub ladder_index: usize,
    pub price: Money,
    pub required: Money,
    pub available: Money,
}

/// A layer still held on the last day, valued at the final close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncompletedLayer {
    pub ladder_index: usize,
    pub entry_date: NaiveDate,
    pub entry_price: Money,
    pub shares: Money,
    pub committed_fund: Money,
    pub last_price: Money,
    pub market_value: Money,
    pub profit_amount: Money,
    pub profit_rate: f64,
    pub holding_days: i64,
}

impl UncompletedLayer {
    fn mark(layer: &Layer, date: NaiveDate, price: Money) -> Self {
        Self {
            ladder_index: layer.ladder_index,
            entry_date: layer.entry_date,
            entry_price: layer.entry_price,
            shares: layer.shares,
            committed_fund: layer.committed_fund,
            last_price: price,
            market_value: layer.market_value(price),
            profit_amount: layer.unrealized_profit(price),
            profit_rate: price.rate_over(layer.entry_price),
            holding_days: (date - layer.entry_date).num_days(),
        }
    }
}

/// Per-stock summary statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StockMetrics {
    /// Realized profit over total buy cost.
    pub total_return: f64,
    /// Largest close-price decline from a running peak over the holding
    /// window, as a non-negative fraction.
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub completed_trade_count: usize,
    pub uncompleted_trade_count: usize,
    pub buy_count: usize,
    pub total_buy_cost: Money,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    /// Mean win over mean loss; `None` without both wins and losses.
    pub profit_loss_ratio: Option<f64>,
    pub avg_profit_per_trade: Money,
    pub avg_holding_days: f64,
    pub avg_profit_holding_days: f64,
    pub peak_committed: Money,
    pub avg_committed: Money,
    pub mean_atr_pct: Option<f64>,
    pub skipped_days: usize,
}

/// Everything one stock's run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: Symbol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub initial_capital: Money,
    pub trades: Vec<Trade>,
    pub snapshots: Vec<DailySnapshot>,
    pub missed: Vec<MissedOpportunity>,
    pub uncompleted: Vec<UncompletedLayer>,
    pub final_position: Position,
    pub metrics: StockMetrics,
}

impl BacktestResult {
    pub fn is_flat(&self) -> bool {
        self.final_position.is_flat()
    }

    /// Flat at the end after selling at least once.
    pub fn has_cycled(&self) -> bool {
        self.is_flat() && self.metrics.completed_trade_count > 0
    }

    pub fn sells(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter().filter(|t| t.action.is_sell())
    }
}

/// Run one stock through the ladder strategy.
pub fn run_backtest(
    series: &StockSeries,
    config: &StrategyConfig,
) -> Result<BacktestResult, BacktestError> {
    Backtester::new(config.clone()).run(series)
}

/// Backtest engine for a single stock
pub struct Backtester {
    strategy: LadderStrategy,
    capital: Money,
}

impl Backtester {
    pub fn new(config: StrategyConfig) -> Self {
        Backtester {
            capital: config.capital(),
            strategy: LadderStrategy::new(config),
        }
    }

    pub fn run(&self, series: &StockSeries) -> Result<BacktestResult, BacktestError> {
        let symbol = series.symbol().clone();
        let mut position = Position::new(self.capital);
        let mut trades: Vec<Trade> = Vec::new();
        let mut snapshots = Vec::with_capacity(series.len());
        let mut missed = Vec::new();
        let mut skipped_days = 0;
        let mut mark_price: Option<Money> = None;

        for bar in series.bars() {
            if bar.close.is_positive() {
                mark_price = Some(bar.close);
            }

            match bar.tradable() {
                Some((price, ma120)) => {
                    for action in self.strategy.decide(price, ma120, &position) {
                        self.apply(
                            action,
                            bar,
                            price,
                            ma120,
                            &mut position,
                            &mut trades,
                            &mut missed,
                        )
                        .map_err(|source| BacktestError::Desync {
                            symbol: symbol.clone(),
                            date: bar.date,
                            source,
                        })?;
                    }
                }
                None => skipped_days += 1,
            }

            if !position.conservation_holds() {
                return Err(BacktestError::Conservation {
                    symbol,
                    date: bar.date,
                });
            }

            let price = mark_price.unwrap_or(Money::ZERO);
            snapshots.push(DailySnapshot {
                date: bar.date,
                open_layers: position.layers().len(),
                committed: position.committed(),
                market_value: position.market_value(price),
                cash: position.available_cash(),
                equity: position.equity(price),
            });
        }

        let uncompleted: Vec<UncompletedLayer> = match (series.last(), mark_price) {
            (Some(last), Some(price)) => position
                .layers()
                .iter()
                .map(|layer| UncompletedLayer::mark(layer, last.date, price))
                .collect(),
            _ => Vec::new(),
        };

        let metrics = compute_metrics(
            series,
            &trades,
            &snapshots,
            &uncompleted,
            &position,
            skipped_days,
        );

        info!(
            "{}: {} trades, {} open layers, return {:.2}%, max drawdown {:.2}%",
            symbol,
            trades.len(),
            uncompleted.len(),
            metrics.total_return * 100.0,
            metrics.max_drawdown * 100.0
        );

        Ok(BacktestResult {
            symbol,
            name: series.name().map(str::to_string),
            initial_capital: self.capital,
            trades,
            snapshots,
            missed,
            uncompleted,
            final_position: position,
            metrics,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        action: Action,
        bar: &DailyBar,
        price: Money,
        ma120: Money,
        position: &mut Position,
        trades: &mut Vec<Trade>,
        missed: &mut Vec<MissedOpportunity>,
    ) -> Result<(), LadderError> {
        match action {
            Action::OpenLayer {
                ladder_index,
                fund_fraction,
            } => {
                match position.open_layer(ladder_index, bar.date, price, fund_fraction, self.capital)
                {
                    Ok(layer) => {
                        position.start_cycle(ma120);
                        debug!(
                            "{} BUY tier {} @ {} ({} shares, {} committed)",
                            bar.date, ladder_index, price, layer.shares.round_dp(4), layer.committed_fund
                        );
                        trades.push(Trade {
                            date: bar.date,
                            action: TradeAction::Buy,
                            ladder_index,
                            price,
                            shares: layer.shares,
                            amount: layer.committed_fund,
                            profit_amount: None,
                            profit_rate: None,
                            holding_days: None,
                            entry_date: Some(bar.date),
                            entry_price: None,
                            target_price: Some(
                                layer.target_price(self.strategy.single_layer_profit()),
                            ),
                            reason: None,
                            annotations: annotate(bar, price, ma120, position),
                        });
                    }
                    Err(LadderError::InsufficientCapital {
                        required,
                        available,
                        ..
                    }) => {
                        debug!(
                            "{} tier {} skipped: need {}, have {}",
                            bar.date, ladder_index, required, available
                        );
                        missed.push(MissedOpportunity {
                            date: bar.date,
                            ladder_index,
                            price,
                            required,
                            available,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
            Action::CloseLayer { ladder_index } => {
                let closed = position.close_layer(ladder_index, bar.date, price)?;
                trades.push(sell_trade(
                    &closed,
                    TradeAction::SellLayer,
                    SellReason::LayerTakeProfit,
                    annotate(bar, price, ma120, position),
                ));
            }
            Action::CloseAll => {
                let closed = position.close_all(bar.date, price);
                let mut running = position.realized_pnl()
                    - closed.iter().map(|c| c.profit_amount).sum::<Money>();
                for c in &closed {
                    running += c.profit_amount;
                    let mut annotations = annotate(bar, price, ma120, position);
                    annotations.cumulative_pnl = running;
                    trades.push(sell_trade(
                        c,
                        TradeAction::SellAll,
                        SellReason::FullClear,
                        annotations,
                    ));
                }
            }
        }
        Ok(())
    }
}

fn annotate(bar: &DailyBar, price: Money, ma120: Money, position: &Position) -> TradeAnnotations {
    TradeAnnotations {
        ma120: Some(ma120),
        price_ma120_pct: Some((price / ma120).to_f64() * 100.0),
        atr_pct: bar.reference.atr_pct,
        volume_ratio: bar.reference.volume_ratio,
        index_price: bar.reference.index_price,
        cumulative_pnl: position.realized_pnl(),
    }
}

fn sell_trade(
    closed: &ClosedLayer,
    action: TradeAction,
    reason: SellReason,
    annotations: TradeAnnotations,
) -> Trade {
    debug!(
        "{} {} tier {} @ {} profit {} ({:.2}%) after {} days",
        closed.exit_date,
        action,
        closed.layer.ladder_index,
        closed.exit_price,
        closed.profit_amount.round_dp(2),
        closed.profit_rate * 100.0,
        closed.holding_days
    );
    Trade {
        date: closed.exit_date,
        action,
        ladder_index: closed.layer.ladder_index,
        price: closed.exit_price,
        shares: closed.layer.shares,
        amount: closed.proceeds,
        profit_amount: Some(closed.profit_amount),
        profit_rate: Some(closed.profit_rate),
        holding_days: Some(closed.holding_days),
        entry_date: Some(closed.layer.entry_date),
        entry_price: Some(closed.layer.entry_price),
        target_price: None,
        reason: Some(reason),
        annotations,
    }
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Peak-to-trough decline of the close over the holding window.
///
/// The window runs from the first trade to the last trade, or to the end of
/// the series while layers are still open.
fn holding_window_drawdown(series: &StockSeries, trades: &[Trade], still_open: bool) -> f64 {
    let (Some(first), Some(last_trade)) = (trades.first(), trades.last()) else {
        return 0.0;
    };
    let end = if still_open {
        series.last().map_or(last_trade.date, |b| b.date)
    } else {
        last_trade.date
    };

    let mut peak = Money::ZERO;
    let mut max_dd = 0.0_f64;
    for bar in series
        .bars()
        .iter()
        .filter(|b| b.date >= first.date && b.date <= end && b.close.is_positive())
    {
        peak = peak.max(bar.close);
        let dd = (peak - bar.close) / peak;
        max_dd = max_dd.max(dd.to_f64());
    }
    max_dd
}

fn compute_metrics(
    series: &StockSeries,
    trades: &[Trade],
    snapshots: &[DailySnapshot],
    uncompleted: &[UncompletedLayer],
    position: &Position,
    skipped_days: usize,
) -> StockMetrics {
    let buys: Vec<&Trade> = trades
        .iter()
        .filter(|t| t.action == TradeAction::Buy)
        .collect();
    let sells: Vec<&Trade> = trades.iter().filter(|t| t.action.is_sell()).collect();

    let total_buy_cost: Money = buys.iter().map(|t| t.amount).sum();
    let realized_pnl = position.realized_pnl();
    let unrealized_pnl: Money = uncompleted.iter().map(|u| u.profit_amount).sum();

    let wins: Vec<Money> = sells
        .iter()
        .filter_map(|t| t.profit_amount)
        .filter(|p| p.is_positive())
        .collect();
    let losses: Vec<Money> = sells
        .iter()
        .filter_map(|t| t.profit_amount)
        .filter(|p| p.is_negative())
        .collect();

    let win_rate = if sells.is_empty() {
        0.0
    } else {
        wins.len() as f64 / sells.len() as f64
    };

    let profit_loss_ratio = match (
        mean(wins.iter().map(|w| w.to_f64())),
        mean(losses.iter().map(|l| l.abs().to_f64())),
    ) {
        (Some(avg_win), Some(avg_loss)) if avg_loss > 0.0 => Some(avg_win / avg_loss),
        _ => None,
    };

    let avg_profit_per_trade = if sells.is_empty() {
        Money::ZERO
    } else {
        realized_pnl / Money::from_i64(sells.len() as i64)
    };

    let avg_holding_days =
        mean(sells.iter().filter_map(|t| t.holding_days).map(|d| d as f64)).unwrap_or(0.0);
    let avg_profit_holding_days = mean(
        sells
            .iter()
            .filter(|t| t.is_profitable())
            .filter_map(|t| t.holding_days)
            .map(|d| d as f64),
    )
    .unwrap_or(0.0);

    let peak_committed = snapshots
        .iter()
        .map(|s| s.committed)
        .max()
        .unwrap_or(Money::ZERO);
    let avg_committed = if snapshots.is_empty() {
        Money::ZERO
    } else {
        snapshots.iter().map(|s| s.committed).sum::<Money>()
            / Money::from_i64(snapshots.len() as i64)
    };

    StockMetrics {
        total_return: (realized_pnl / total_buy_cost).to_f64(),
        max_drawdown: holding_window_drawdown(series, trades, !position.is_flat()),
        win_rate,
        completed_trade_count: sells.len(),
        uncompleted_trade_count: uncompleted.len(),
        buy_count: buys.len(),
        total_buy_cost,
        realized_pnl,
        unrealized_pnl,
        profit_loss_ratio,
        avg_profit_per_trade,
        avg_holding_days,
        avg_profit_holding_days,
        peak_committed,
        avg_committed,
        mean_atr_pct: mean(trades.iter().filter_map(|t| t.annotations.atr_pct)),
        skipped_days,
    }
}
