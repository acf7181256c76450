//! Multi-stock orchestration
//!
//! One task per stock on the rayon pool (or in order, for debugging). Stocks
//! share nothing but the cancellation flag and the progress bar; a failure
//! in one stock is reported in its outcome and never stops the others.

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::aggregate::StockOutcome;
use crate::backtest::{run_backtest, BacktestError, BacktestResult};
use crate::config::StrategyConfig;
use crate::data::IndicatorProvider;
use crate::{StockSeries, Symbol};

/// Cooperative cancellation, checked before each stock starts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub sequential: bool,
    pub cancel: CancelFlag,
    pub progress: Option<ProgressBar>,
}

/// Progress bar over stocks.
pub fn stock_progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("📈 {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█░ "),
    );
    pb
}

/// Load and backtest one stock.
pub fn run_one(
    provider: &dyn IndicatorProvider,
    symbol: &Symbol,
    config: &StrategyConfig,
    cancel: &CancelFlag,
) -> StockOutcome {
    run_one_with(provider, symbol, cancel, |series| run_backtest(series, config))
}

fn run_one_with<F>(
    provider: &dyn IndicatorProvider,
    symbol: &Symbol,
    cancel: &CancelFlag,
    backtest: F,
) -> StockOutcome
where
    F: Fn(&StockSeries) -> Result<BacktestResult, BacktestError>,
{
    if cancel.is_cancelled() {
        return StockOutcome::cancelled(symbol.clone());
    }

    let series = match provider.load(symbol) {
        Ok(series) => series,
        Err(e) => {
            warn!("{}: skipped, {:#}", symbol, e);
            return StockOutcome::failed(symbol.clone(), format!("{:#}", e));
        }
    };

    match backtest(&series) {
        Ok(result) => StockOutcome::completed(result),
        Err(e) => {
            warn!("{}: backtest failed, {}", symbol, e);
            StockOutcome::failed(symbol.clone(), e.to_string())
        }
    }
}

/// Run every symbol, returning outcomes in input order.
pub fn run_all(
    provider: &dyn IndicatorProvider,
    symbols: &[Symbol],
    config: &StrategyConfig,
    options: &RunOptions,
) -> Vec<StockOutcome> {
    run_all_with(provider, symbols, options, |series| run_backtest(series, config))
}

/// [`run_all`] with a caller-supplied per-stock engine.
pub fn run_all_with<F>(
    provider: &dyn IndicatorProvider,
    symbols: &[Symbol],
    options: &RunOptions,
    backtest: F,
) -> Vec<StockOutcome>
where
    F: Fn(&StockSeries) -> Result<BacktestResult, BacktestError> + Sync,
{
    info!(
        "Backtesting {} stocks ({})",
        symbols.len(),
        if options.sequential { "sequential" } else { "parallel" }
    );
    let started = Instant::now();

    let task = |symbol: &Symbol| {
        let outcome = run_one_with(provider, symbol, &options.cancel, &backtest);
        if let Some(pb) = &options.progress {
            pb.set_message(symbol.to_string());
            pb.inc(1);
        }
        outcome
    };

    let outcomes: Vec<StockOutcome> = if options.sequential {
        symbols.iter().map(task).collect()
    } else {
        symbols.par_iter().map(task).collect()
    };

    if let Some(pb) = &options.progress {
        pb.finish_with_message("done");
    }
    if options.cancel.is_cancelled() {
        warn!("Run cancelled; unstarted stocks are reported as cancelled");
    }
    info!(
        "Finished {} stocks in {:.2}s",
        outcomes.len(),
        started.elapsed().as_secs_f64()
    );

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::StockStatus;
    use crate::ladder::LadderError;
    use crate::{DailyBar, Money};
    use anyhow::Result;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct MapProvider {
        series: HashMap<String, StockSeries>,
        loads: AtomicUsize,
        cancel_after: Option<(usize, CancelFlag)>,
    }

    impl MapProvider {
        fn new(symbols: &[&str]) -> Self {
            let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
            let series = symbols
                .iter()
                .map(|s| {
                    let bar = DailyBar::new(date, Money::from_i64(80), Some(Money::from_i64(100)));
                    (s.to_string(), StockSeries::new(Symbol::new(s), vec![bar]).unwrap())
                })
                .collect();
            Self {
                series,
                loads: AtomicUsize::new(0),
                cancel_after: None,
            }
        }
    }

    impl IndicatorProvider for MapProvider {
        fn load(&self, symbol: &Symbol) -> Result<StockSeries> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, flag)) = &self.cancel_after {
                if n >= *limit {
                    flag.cancel();
                }
            }
            self.series
                .get(symbol.as_str())
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no data for {}", symbol))
        }
    }

    fn symbols(names: &[&str]) -> Vec<Symbol> {
        names.iter().map(Symbol::new).collect()
    }

    #[test]
    fn test_parallel_preserves_order_and_isolates_failures() {
        let provider = MapProvider::new(&["A", "B", "D"]);
        let syms = symbols(&["A", "B", "C", "D"]);
        let outcomes = run_all(
            &provider,
            &syms,
            &StrategyConfig::balanced(),
            &RunOptions::default(),
        );

        let order: Vec<&str> = outcomes.iter().map(|o| o.symbol.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C", "D"]);
        assert!(matches!(outcomes[2].status, StockStatus::Failed(_)));
        assert_eq!(outcomes[0].status, StockStatus::Completed);
        assert_eq!(outcomes[3].result.as_ref().unwrap().trades.len(), 1);
    }

    #[test]
    fn test_engine_desync_fails_only_that_stock() {
        let provider = MapProvider::new(&["A", "B", "C"]);
        let config = StrategyConfig::balanced();
        let outcomes = run_all_with(
            &provider,
            &symbols(&["A", "B", "C"]),
            &RunOptions::default(),
            |series| {
                if series.symbol().as_str() == "B" {
                    return Err(BacktestError::Desync {
                        symbol: series.symbol().clone(),
                        date: series.bars()[0].date,
                        source: LadderError::LayerNotFound(1),
                    });
                }
                run_backtest(series, &config)
            },
        );

        assert_eq!(outcomes[0].status, StockStatus::Completed);
        assert_eq!(outcomes[2].status, StockStatus::Completed);
        match &outcomes[1].status {
            StockStatus::Failed(msg) => assert!(msg.contains("out of sync")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(outcomes[1].result.is_none());
    }

    #[test]
    fn test_sequential_cancellation_between_stocks() {
        let cancel = CancelFlag::new();
        let mut provider = MapProvider::new(&["A", "B", "C"]);
        provider.cancel_after = Some((1, cancel.clone()));
        let options = RunOptions {
            sequential: true,
            cancel,
            progress: None,
        };

        let outcomes = run_all(
            &provider,
            &symbols(&["A", "B", "C"]),
            &StrategyConfig::balanced(),
            &options,
        );

        // The stock already in flight finishes; the rest never start.
        assert_eq!(outcomes[0].status, StockStatus::Completed);
        assert_eq!(outcomes[1].status, StockStatus::Cancelled);
        assert_eq!(outcomes[2].status, StockStatus::Cancelled);
        assert_eq!(provider.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let provider = MapProvider::new(&["A"]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = run_one(
            &provider,
            &Symbol::new("A"),
            &StrategyConfig::balanced(),
            &cancel,
        );
        assert_eq!(outcome.status, StockStatus::Cancelled);
    }
}
