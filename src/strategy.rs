//! Strategy decision engine
//!
//! Pure mapping from (close, MA120, position) to the day's ordered actions.
//! Precedence: full clear, then per-layer take-profit, then entry or ladder add.

use serde::{Deserialize, Serialize};

use crate::config::{LadderReference, StrategyConfig};
use crate::ladder::Position;
use crate::Money;

/// One instruction for the position tracker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Action {
    OpenLayer {
        ladder_index: usize,
        fund_fraction: f64,
    },
    CloseLayer {
        ladder_index: usize,
    },
    CloseAll,
}

/// Decision engine for the MA120 ladder rotation.
#[derive(Debug, Clone)]
pub struct LadderStrategy {
    config: StrategyConfig,
    entry_threshold: Money,
    full_clear_threshold: Money,
    single_layer_profit: Money,
    tier_ratios: Vec<Money>,
}

impl LadderStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        LadderStrategy {
            entry_threshold: Money::from_f64(config.entry_threshold),
            full_clear_threshold: Money::from_f64(config.full_clear_threshold),
            single_layer_profit: Money::from_f64(config.single_layer_profit),
            tier_ratios: config
                .ladder_down
                .iter()
                .map(|t| Money::from_f64(t.price_ratio))
                .collect(),
            config,
        }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn single_layer_profit(&self) -> Money {
        self.single_layer_profit
    }

    /// Decide today's actions. An empty vector means no action.
    pub fn decide(&self, price: Money, ma120: Money, position: &Position) -> Vec<Action> {
        if !position.is_flat() {
            if self.config.enable_full_clear && price >= ma120 * self.full_clear_threshold {
                return vec![Action::CloseAll];
            }

            let closes: Vec<Action> = position
                .layers()
                .iter()
                .filter(|layer| price >= layer.target_price(self.single_layer_profit))
                .map(|layer| Action::CloseLayer {
                    ladder_index: layer.ladder_index,
                })
                .collect();
            if !closes.is_empty() {
                return closes;
            }
        }

        self.entry_or_add(price, ma120, position)
            .map(|ladder_index| {
                vec![Action::OpenLayer {
                    ladder_index,
                    fund_fraction: self.config.ladder_down[ladder_index].fund_fraction,
                }]
            })
            .unwrap_or_default()
    }

    /// Tier to open today, if any.
    fn entry_or_add(&self, price: Money, ma120: Money, position: &Position) -> Option<usize> {
        let Some(deepest) = position.deepest_tier() else {
            return (price <= ma120 * self.entry_threshold).then_some(0);
        };

        let reference = match self.config.ladder_reference {
            LadderReference::Today => ma120,
            LadderReference::Entry => position.cycle_reference().unwrap_or(ma120),
        };

        // Deepest qualifying tier only; skipped shallower tiers are not back-filled.
        (deepest + 1..self.tier_ratios.len())
            .rev()
            .find(|&k| price <= reference * self.tier_ratios[k])
    }
}
