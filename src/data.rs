//! Data loading
//!
//! The indicator provider turns `<data_dir>/<symbol>.csv` daily bars into a
//! `StockSeries` with MA120 and display-only reference fields, once per stock
//! before its backtest starts.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BacktestConfig;
use crate::indicators::{atr_pct, sma_money, volume_ratio};
use crate::{DailyBar, Money, ReferenceFields, StockSeries, Symbol};

/// One row of a daily price file. Blank cells are gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRow {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<Money>,
    pub volume: f64,
}

#[derive(Debug, Deserialize)]
struct RawPriceRow {
    date: String,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    close: Option<String>,
    #[serde(default)]
    volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawIndexRow {
    date: String,
    close: f64,
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time part.
fn parse_date(s: &str) -> Result<NaiveDate> {
    let day = s.trim().get(..10).unwrap_or(s.trim());
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(day, "%Y/%m/%d"))
        .with_context(|| format!("Failed to parse date: {}", s))
}

/// Load daily bars from a `date,open,high,low,close,volume` CSV, sorted by date.
///
/// Duplicate dates keep the last row. Rows with blank price cells are kept as
/// gaps and skipped by the backtest.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<PriceRow>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let mut rows = Vec::new();
    for (row_idx, result) in reader.deserialize::<RawPriceRow>().enumerate() {
        let raw = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;
        rows.push(PriceRow {
            date: parse_date(&raw.date)?,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: match raw.close.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(text) => Some(
                    text.parse()
                        .with_context(|| format!("Failed to parse close: {}", text))?,
                ),
            },
            volume: raw.volume.unwrap_or(0.0),
        });
    }

    rows.sort_by_key(|r| r.date);
    let before = rows.len();
    // dedup_by keeps the first of a run; reverse so the last row wins.
    rows.reverse();
    rows.dedup_by_key(|r| r.date);
    rows.reverse();
    if rows.len() != before {
        warn!(
            "{}: dropped {} duplicate dates",
            path.display(),
            before - rows.len()
        );
    }

    Ok(rows)
}

/// Load an index `date,close` CSV into a date lookup.
pub fn load_index_csv(path: impl AsRef<Path>) -> Result<BTreeMap<NaiveDate, f64>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open index file {}", path.display()))?;

    let mut index = BTreeMap::new();
    for (row_idx, result) in reader.deserialize::<RawIndexRow>().enumerate() {
        let raw = result.with_context(|| format!("Failed to read index row {}", row_idx + 1))?;
        index.insert(parse_date(&raw.date)?, raw.close);
    }
    Ok(index)
}

/// Source of fully materialized series, one call per stock.
pub trait IndicatorProvider: Send + Sync {
    fn load(&self, symbol: &Symbol) -> Result<StockSeries>;
}

/// Indicator parameters and the backtest date window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesSpec {
    pub ma_period: usize,
    pub atr_period: usize,
    pub volume_window: usize,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl SeriesSpec {
    pub fn from_config(config: &BacktestConfig) -> Self {
        Self {
            ma_period: config.ma_period,
            atr_period: config.atr_period,
            volume_window: config.volume_window,
            start_date: config.start_date,
            end_date: config.end_date,
        }
    }

    fn in_window(&self, date: NaiveDate) -> bool {
        self.start_date.map_or(true, |s| date >= s) && self.end_date.map_or(true, |e| date <= e)
    }
}

/// Compute indicators over the full history, then cut to the date window so
/// the first in-window days already have a warm MA.
pub fn build_series(
    symbol: Symbol,
    rows: &[PriceRow],
    spec: &SeriesSpec,
    index: Option<&BTreeMap<NaiveDate, f64>>,
) -> Result<StockSeries> {
    let closes: Vec<Option<Money>> = rows.iter().map(|r| r.close).collect();
    // Gaps become NaN, which the ATR turns into `None`.
    let close_f: Vec<f64> = closes
        .iter()
        .map(|c| c.map_or(f64::NAN, Money::to_f64))
        .collect();
    let high: Vec<f64> = rows
        .iter()
        .zip(&close_f)
        .map(|(r, &c)| r.high.unwrap_or(c))
        .collect();
    let low: Vec<f64> = rows
        .iter()
        .zip(&close_f)
        .map(|(r, &c)| r.low.unwrap_or(c))
        .collect();
    let volume: Vec<f64> = rows.iter().map(|r| r.volume).collect();

    let ma = sma_money(&closes, spec.ma_period);
    let atr = atr_pct(&high, &low, &close_f, spec.atr_period);
    let vol = volume_ratio(&volume, spec.volume_window);

    let bars: Vec<DailyBar> = rows
        .iter()
        .enumerate()
        .filter(|(_, r)| spec.in_window(r.date))
        .map(|(i, r)| {
            let close = r.close.unwrap_or(Money::ZERO);
            DailyBar::new(r.date, close, ma[i]).with_reference(ReferenceFields {
                atr_pct: atr[i],
                volume_ratio: vol[i],
                index_price: index.and_then(|idx| idx.get(&r.date).copied()),
            })
        })
        .collect();

    StockSeries::new(symbol.clone(), bars)
        .with_context(|| format!("Invalid price series for {}", symbol))
}

/// CSV-backed provider reading `<data_dir>/<symbol>.csv`.
#[derive(Debug, Clone)]
pub struct CsvIndicatorProvider {
    data_dir: PathBuf,
    spec: SeriesSpec,
    index: Option<Arc<BTreeMap<NaiveDate, f64>>>,
}

impl CsvIndicatorProvider {
    pub fn new(data_dir: impl Into<PathBuf>, spec: SeriesSpec) -> Self {
        Self {
            data_dir: data_dir.into(),
            spec,
            index: None,
        }
    }

    /// Provider for a run config. A missing index file only disables the
    /// index annotation.
    pub fn from_config(config: &BacktestConfig) -> Self {
        let mut provider = Self::new(&config.data_dir, SeriesSpec::from_config(config));
        if let Some(file) = &config.index_file {
            let path = provider.data_dir.join(file);
            match load_index_csv(&path) {
                Ok(index) => {
                    info!("Loaded {} index rows from {}", index.len(), path.display());
                    provider.index = Some(Arc::new(index));
                }
                Err(e) => warn!("Index file unavailable, continuing without it: {:#}", e),
            }
        }
        provider
    }

    pub fn with_index(mut self, index: BTreeMap<NaiveDate, f64>) -> Self {
        self.index = Some(Arc::new(index));
        self
    }

    pub fn path_for(&self, symbol: &Symbol) -> PathBuf {
        self.data_dir.join(format!("{}.csv", symbol.as_str()))
    }
}

impl IndicatorProvider for CsvIndicatorProvider {
    fn load(&self, symbol: &Symbol) -> Result<StockSeries> {
        let path = self.path_for(symbol);
        if !path.exists() {
            anyhow::bail!("Data file not found: {}", path.display());
        }

        let rows = load_csv(&path).with_context(|| format!("Failed to load data for {}", symbol))?;
        let series = build_series(symbol.clone(), &rows, &self.spec, self.index.as_deref())?;
        debug!(
            "Loaded {} rows for {}, {} inside the window",
            rows.len(),
            symbol,
            series.len()
        );
        Ok(series)
    }
}
