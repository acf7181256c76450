//! Core data types shared by the tracker, decision engine and backtest loop

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Money - decimal arithmetic for prices, shares and cash
// ============================================================================

/// Decimal amount used for every price, share count and cash bucket.
///
/// Ladder thresholds are compared with `<=` / `>=` against products such as
/// `MA120 * 0.88`, so binary floating point would flip boundary days
/// (`87 * 1.12` is `97.44000000000001` in f64). `Money` wraps
/// `rust_decimal::Decimal` to keep those comparisons exact.
///
/// ```
/// use ladder_rotation::Money;
/// let ma = Money::from_i64(100);
/// let entry = ma * Money::from_f64(0.88);
/// assert_eq!(entry, Money::from_i64(88));
/// ```
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);
    pub const ONE: Money = Money(Decimal::ONE);

    pub const fn new(value: Decimal) -> Self {
        Money(value)
    }

    /// Convert a config ratio or CSV float. NaN and infinities map to zero.
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return Money::ZERO;
        }
        Money(
            Decimal::try_from(value)
                .or_else(|_| Decimal::from_f64_retain(value).ok_or(()))
                .unwrap_or(Decimal::ZERO),
        )
    }

    pub fn from_i64(value: i64) -> Self {
        Money(Decimal::from(value))
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn inner(self) -> Decimal {
        self.0
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }

    /// `self / other - 1` as f64, zero when `other` is zero.
    pub fn rate_over(self, other: Money) -> f64 {
        if other.is_zero() {
            return 0.0;
        }
        (self / other - Money::ONE).to_f64()
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl From<i64> for Money {
    fn from(value: i64) -> Self {
        Money::from_i64(value)
    }
}

impl From<Money> for f64 {
    fn from(value: Money) -> Self {
        value.to_f64()
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Decimal::from_str(trimmed)
            .or_else(|_| Decimal::from_scientific(trimmed))
            .map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Money {}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

macro_rules! money_binop {
    ($trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident, $op:tt) => {
        impl $trait for Money {
            type Output = Money;
            fn $method(self, rhs: Money) -> Money {
                Money(self.0 $op rhs.0)
            }
        }

        impl $assign_trait for Money {
            fn $assign_method(&mut self, rhs: Money) {
                self.0 = self.0 $op rhs.0;
            }
        }
    };
}

money_binop!(Add, add, AddAssign, add_assign, +);
money_binop!(Sub, sub, SubAssign, sub_assign, -);

impl Mul for Money {
    type Output = Money;
    fn mul(self, rhs: Money) -> Money {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Money;
    /// Division by zero yields zero.
    fn div(self, rhs: Money) -> Money {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

// ============================================================================
// Symbol
// ============================================================================

/// Stock code, cheap to clone across worker threads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(Arc::from(s.as_ref().trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Symbol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Symbol::new(s))
    }
}

// ============================================================================
// Price series
// ============================================================================

/// Display-only fields attached to trades. Never read by the decision engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFields {
    pub atr_pct: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub index_price: Option<f64>,
}

/// One trading day of a stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub close: Money,
    /// Trailing simple moving average; `None` during warm-up or on data gaps.
    pub ma120: Option<Money>,
    #[serde(default)]
    pub reference: ReferenceFields,
}

impl DailyBar {
    pub fn new(date: NaiveDate, close: Money, ma120: Option<Money>) -> Self {
        Self {
            date,
            close,
            ma120,
            reference: ReferenceFields::default(),
        }
    }

    pub fn with_reference(mut self, reference: ReferenceFields) -> Self {
        self.reference = reference;
        self
    }

    /// Close and MA120 when both are usable for a decision.
    pub fn tradable(&self) -> Option<(Money, Money)> {
        match self.ma120 {
            Some(ma) if ma.is_positive() && self.close.is_positive() => Some((self.close, ma)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SeriesError {
    #[error("bar {index} ({date}) is not after the previous bar ({previous})")]
    NotAscending {
        index: usize,
        date: NaiveDate,
        previous: NaiveDate,
    },
}

/// Immutable, date-ascending daily history of one stock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockSeries {
    symbol: Symbol,
    name: Option<String>,
    bars: Vec<DailyBar>,
}

impl StockSeries {
    /// Build a series, rejecting duplicate or out-of-order dates.
    pub fn new(symbol: Symbol, bars: Vec<DailyBar>) -> Result<Self, SeriesError> {
        for (index, pair) in bars.windows(2).enumerate() {
            if pair[1].date <= pair[0].date {
                return Err(SeriesError::NotAscending {
                    index: index + 1,
                    date: pair[1].date,
                    previous: pair[0].date,
                });
            }
        }
        Ok(Self {
            symbol,
            name: None,
            bars,
        })
    }

    pub fn empty(symbol: Symbol) -> Self {
        Self {
            symbol,
            name: None,
            bars: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn bars(&self) -> &[DailyBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&DailyBar> {
        self.bars.last()
    }
}

// ============================================================================
// Trade ledger
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeAction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL_LAYER")]
    SellLayer,
    #[serde(rename = "SELL_ALL")]
    SellAll,
}

impl TradeAction {
    pub fn is_sell(self) -> bool {
        !matches!(self, TradeAction::Buy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::SellLayer => "SELL_LAYER",
            TradeAction::SellAll => "SELL_ALL",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a layer was sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellReason {
    /// Close reached `MA120 * full_clear_threshold`.
    FullClear,
    /// The layer reached its own `single_layer_profit` target.
    LayerTakeProfit,
}

impl fmt::Display for SellReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SellReason::FullClear => f.write_str("full_clear"),
            SellReason::LayerTakeProfit => f.write_str("layer_take_profit"),
        }
    }
}

/// Market context recorded with each trade for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeAnnotations {
    pub ma120: Option<Money>,
    /// Close as a percentage of MA120.
    pub price_ma120_pct: Option<f64>,
    pub atr_pct: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub index_price: Option<f64>,
    /// Realized profit of this stock up to and including this trade.
    pub cumulative_pnl: Money,
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub date: NaiveDate,
    pub action: TradeAction,
    pub ladder_index: usize,
    pub price: Money,
    pub shares: Money,
    pub amount: Money,
    pub profit_amount: Option<Money>,
    pub profit_rate: Option<f64>,
    pub holding_days: Option<i64>,
    pub entry_date: Option<NaiveDate>,
    pub entry_price: Option<Money>,
    pub target_price: Option<Money>,
    pub reason: Option<SellReason>,
    #[serde(default)]
    pub annotations: TradeAnnotations,
}

impl Trade {
    pub fn is_profitable(&self) -> bool {
        self.profit_amount.is_some_and(|p| p.is_positive())
    }
}
