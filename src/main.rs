//! MA120 ladder rotation - main entry point
//!
//! This binary provides two subcommands:
//! - backtest: Run the ladder rotation backtest over a set of stocks
//! - presets: Print the built-in strategy parameter sets

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "ladder-rotation")]
#[command(about = "Backtest the MA120 ladder rotation strategy on daily stock data", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ladder rotation backtest
    Backtest {
        /// Path to configuration file (defaults to the balanced preset)
        #[arg(short, long)]
        config: Option<String>,

        /// Strategy preset: conservative, aggressive or balanced
        #[arg(short, long)]
        preset: Option<String>,

        /// Stock codes (comma-separated). E.g., "600036,601318"
        #[arg(short, long)]
        symbols: Option<String>,

        /// Capital allocated to each stock
        #[arg(long)]
        capital: Option<f64>,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Results directory
        #[arg(short, long)]
        output: Option<String>,

        /// Run stocks one at a time instead of in parallel
        #[arg(long)]
        sequential: bool,

        /// Skip writing result files
        #[arg(long)]
        no_export: bool,
    },

    /// Show built-in strategy presets
    Presets {
        /// Preset name (all when omitted)
        name: Option<String>,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{timestamp}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_line_number(verbose)
        .with_file(verbose)
        .with_ansi(true)
        .with_writer(std::io::stderr);

    // Same format without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Backtest { .. } => "backtest",
        Commands::Presets { .. } => "presets",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Backtest {
            config,
            preset,
            symbols,
            capital,
            start,
            end,
            output,
            sequential,
            no_export,
        } => commands::backtest::run(
            config,
            commands::backtest::Overrides {
                preset,
                symbols,
                capital,
                start,
                end,
                output,
                sequential,
                no_export,
            },
        ),
        Commands::Presets { name } => commands::presets::run(name),
    }
}
