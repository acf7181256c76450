//! Ladder position tracker
//!
//! Owns one stock's open layers and cash buckets. Every mutation keeps
//!
//! ```text
//! undeployed_cash + recycled_cash + Σ committed_fund == initial_capital + realized_pnl
//! ```
//!
//! which reduces to `... == initial_capital` until a profit or loss is realized.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Money;

/// Decimal places kept for share counts and realized profit, so cash bucket
/// sums stay exact.
pub const SHARE_SCALE: u32 = 8;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LadderError {
    #[error("insufficient capital for tier {ladder_index}: need {required}, have {available}")]
    InsufficientCapital {
        ladder_index: usize,
        required: Money,
        available: Money,
    },
    #[error("no open layer for tier {0}")]
    LayerNotFound(usize),
    #[error("tier {0} is already open")]
    TierAlreadyOpen(usize),
    #[error("tier {ladder_index} cannot open while deeper tier {deepest} is held")]
    TierOutOfOrder { ladder_index: usize, deepest: usize },
    #[error("price must be positive, got {0}")]
    InvalidPrice(Money),
}

/// One open ladder position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub ladder_index: usize,
    pub entry_date: NaiveDate,
    pub entry_price: Money,
    pub shares: Money,
    pub committed_fund: Money,
}

impl Layer {
    pub fn market_value(&self, price: Money) -> Money {
        self.shares * price
    }

    pub fn unrealized_profit(&self, price: Money) -> Money {
        (self.shares * (price - self.entry_price)).round_dp(SHARE_SCALE)
    }

    /// Close price at which this layer takes profit on its own.
    pub fn target_price(&self, single_layer_profit: Money) -> Money {
        self.entry_price * (Money::ONE + single_layer_profit)
    }
}

/// A layer removed from the tracker, with realized results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedLayer {
    pub layer: Layer,
    pub exit_date: NaiveDate,
    pub exit_price: Money,
    pub proceeds: Money,
    pub profit_amount: Money,
    pub profit_rate: f64,
    pub holding_days: i64,
}

/// One stock's ladder state for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    initial_capital: Money,
    undeployed_cash: Money,
    recycled_cash: Money,
    realized_pnl: Money,
    /// Open layers, ascending by `ladder_index`.
    layers: Vec<Layer>,
    /// MA120 recorded when the current cycle's first layer opened.
    cycle_reference: Option<Money>,
}

impl Position {
    pub fn new(initial_capital: Money) -> Self {
        Self {
            initial_capital,
            undeployed_cash: initial_capital,
            recycled_cash: Money::ZERO,
            realized_pnl: Money::ZERO,
            layers: Vec::new(),
            cycle_reference: None,
        }
    }

    /// Commit `fund_fraction * capital_base` to a new layer at `price`.
    ///
    /// Recycled cash is drawn before undeployed cash.
    pub fn open_layer(
        &mut self,
        ladder_index: usize,
        date: NaiveDate,
        price: Money,
        fund_fraction: f64,
        capital_base: Money,
    ) -> Result<Layer, LadderError> {
        if !price.is_positive() {
            return Err(LadderError::InvalidPrice(price));
        }
        if self.has_tier(ladder_index) {
            return Err(LadderError::TierAlreadyOpen(ladder_index));
        }
        if let Some(deepest) = self.deepest_tier() {
            if ladder_index < deepest {
                return Err(LadderError::TierOutOfOrder {
                    ladder_index,
                    deepest,
                });
            }
        }

        let committed_fund = capital_base * Money::from_f64(fund_fraction);
        let available = self.available_cash();
        if committed_fund > available {
            return Err(LadderError::InsufficientCapital {
                ladder_index,
                required: committed_fund,
                available,
            });
        }

        let from_recycled = committed_fund.min(self.recycled_cash);
        self.recycled_cash -= from_recycled;
        self.undeployed_cash -= committed_fund - from_recycled;

        let layer = Layer {
            ladder_index,
            entry_date: date,
            entry_price: price,
            shares: (committed_fund / price).round_dp(SHARE_SCALE),
            committed_fund,
        };
        self.layers.push(layer.clone());
        Ok(layer)
    }

    /// Remove the layer of `ladder_index`, realizing its profit at `price`.
    pub fn close_layer(
        &mut self,
        ladder_index: usize,
        date: NaiveDate,
        price: Money,
    ) -> Result<ClosedLayer, LadderError> {
        let pos = self
            .layers
            .iter()
            .position(|l| l.ladder_index == ladder_index)
            .ok_or(LadderError::LayerNotFound(ladder_index))?;
        let layer = self.layers.remove(pos);
        let closed = self.settle(layer, date, price);
        if self.layers.is_empty() {
            self.cycle_reference = None;
        }
        Ok(closed)
    }

    /// Close every open layer at the same price, ascending by tier.
    pub fn close_all(&mut self, date: NaiveDate, price: Money) -> Vec<ClosedLayer> {
        let layers = std::mem::take(&mut self.layers);
        let closed = layers
            .into_iter()
            .map(|layer| self.settle(layer, date, price))
            .collect();
        self.cycle_reference = None;
        closed
    }

    fn settle(&mut self, layer: Layer, date: NaiveDate, price: Money) -> ClosedLayer {
        let profit_amount = layer.unrealized_profit(price);
        let proceeds = layer.committed_fund + profit_amount;
        self.recycled_cash += proceeds;
        self.realized_pnl += profit_amount;

        ClosedLayer {
            profit_rate: price.rate_over(layer.entry_price),
            holding_days: (date - layer.entry_date).num_days(),
            exit_date: date,
            exit_price: price,
            proceeds,
            profit_amount,
            layer,
        }
    }

    pub fn available_cash(&self) -> Money {
        self.undeployed_cash + self.recycled_cash
    }

    pub fn undeployed_cash(&self) -> Money {
        self.undeployed_cash
    }

    pub fn recycled_cash(&self) -> Money {
        self.recycled_cash
    }

    pub fn realized_pnl(&self) -> Money {
        self.realized_pnl
    }

    pub fn initial_capital(&self) -> Money {
        self.initial_capital
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn is_flat(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn has_tier(&self, ladder_index: usize) -> bool {
        self.layers.iter().any(|l| l.ladder_index == ladder_index)
    }

    pub fn deepest_tier(&self) -> Option<usize> {
        self.layers.last().map(|l| l.ladder_index)
    }

    pub fn committed(&self) -> Money {
        self.layers.iter().map(|l| l.committed_fund).sum()
    }

    pub fn market_value(&self, price: Money) -> Money {
        self.layers.iter().map(|l| l.market_value(price)).sum()
    }

    pub fn equity(&self, price: Money) -> Money {
        self.available_cash() + self.market_value(price)
    }

    pub fn cycle_reference(&self) -> Option<Money> {
        self.cycle_reference
    }

    /// Record the MA120 of a new cycle. Ignored while a cycle is running.
    pub fn start_cycle(&mut self, ma120: Money) {
        if self.cycle_reference.is_none() {
            self.cycle_reference = Some(ma120);
        }
    }

    pub fn conservation_holds(&self) -> bool {
        self.undeployed_cash + self.recycled_cash + self.committed()
            == self.initial_capital + self.realized_pnl
    }
}
