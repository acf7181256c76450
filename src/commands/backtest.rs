//! Backtest command implementation

use anyhow::{Context, Result};
use chrono::NaiveDate;
use ladder_rotation::aggregate::aggregate;
use ladder_rotation::data::CsvIndicatorProvider;
use ladder_rotation::report;
use ladder_rotation::runner::{run_all, stock_progress_bar, CancelFlag, RunOptions};
use ladder_rotation::{Config, StrategyConfig};
use tracing::{debug, error, info, warn};

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub preset: Option<String>,
    pub symbols: Option<String>,
    pub capital: Option<f64>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub output: Option<String>,
    pub sequential: bool,
    pub no_export: bool,
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("Invalid date: {}", s))
}

fn load_config(config_path: Option<&str>, overrides: &Overrides) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => {
            let config = Config::from_file(path)?;
            info!("Loaded configuration from: {}", path);
            config
        }
        None => Config::from_preset(overrides.preset.as_deref().unwrap_or("balanced"))?,
    };

    if let (Some(preset), Some(_)) = (&overrides.preset, config_path) {
        info!("Overriding strategy with preset: {}", preset);
        config.strategy = StrategyConfig::preset(preset)?;
    }

    if let Some(symbols) = &overrides.symbols {
        config.backtest.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        info!("Overriding symbols to: {:?}", config.backtest.symbols);
    }

    if let Some(capital) = overrides.capital {
        info!("Overriding capital per stock to: {:.2}", capital);
        config.strategy.initial_capital = capital;
    }

    if let Some(start) = &overrides.start {
        info!("Overriding start date to: {}", start);
        config.backtest.start_date = Some(parse_date(start)?);
    }

    if let Some(end) = &overrides.end {
        info!("Overriding end date to: {}", end);
        config.backtest.end_date = Some(parse_date(end)?);
    }

    if let Some(output) = &overrides.output {
        config.backtest.results_dir = output.clone();
    }

    if overrides.sequential {
        config.backtest.sequential = true;
    }

    config
        .strategy
        .validate()
        .context("Invalid strategy parameters")?;
    Ok(config)
}

/// Bind Ctrl+C to the cancel flag on a helper thread with its own runtime.
fn install_ctrl_c(cancel: CancelFlag) {
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Error setting up signal handler: {}", e);
                    return;
                }
            };
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("Received Ctrl+C, finishing running stocks and skipping the rest...");
                        cancel.cancel();
                    }
                    Err(e) => error!("Error setting up signal handler: {}", e),
                }
            });
        });
    if let Err(e) = spawned {
        warn!("Could not start Ctrl+C handler: {}", e);
    }
}

pub fn run(config_path: Option<String>, overrides: Overrides) -> Result<()> {
    info!("Starting backtest");

    let config = load_config(config_path.as_deref(), &overrides)?;
    let symbols = config.backtest.symbols();
    if symbols.is_empty() {
        anyhow::bail!("No symbols to backtest; set backtest.symbols or pass --symbols");
    }
    debug!("Symbols: {:?}", symbols);
    info!("Loading data from: {}", config.backtest.data_dir);

    let provider = CsvIndicatorProvider::from_config(&config.backtest);

    let cancel = CancelFlag::new();
    install_ctrl_c(cancel.clone());

    let options = RunOptions {
        sequential: config.backtest.sequential,
        cancel,
        progress: Some(stock_progress_bar(symbols.len())),
    };

    info!("Running backtest...");
    let outcomes = run_all(&provider, &symbols, &config.strategy, &options);
    let summary = aggregate(&outcomes, &config.strategy);

    report::print_summary(&summary, &config.strategy);

    if !overrides.no_export {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let paths = report::export(&summary, &outcomes, &config.backtest.results_dir, &stamp)?;
        println!("Trades:   {}", paths.trades.display());
        println!("Stocks:   {}", paths.stocks.display());
        println!("Daily:    {}", paths.daily.display());
        println!("Summary:  {}", paths.summary.display());
    }

    if summary.completed_stocks == 0 {
        warn!("No stock completed successfully");
    }
    info!("Backtest completed");

    Ok(())
}
