//! Configuration structures for the ladder-trader system.
//!
//! Defaults here are a convenience starting point only. Stop multipliers and
//! activation thresholds are deployment-tunable and expected to be overridden
//! per instrument.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Qty, TimestampMs};

/// Tolerance for the close-percentage sum invariant.
pub const CLOSE_PCT_TOLERANCE: f64 = 1e-6;

/// One take-profit rung: at `profit_pct` unrealized profit, close
/// `close_pct` of the original position quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TpLevel {
    /// Profit threshold as a fraction of entry price (e.g. 0.03 for 3%).
    pub profit_pct: f64,
    /// Fraction of the ORIGINAL quantity to close at this level.
    pub close_pct: Qty,
}

/// Exit/risk configuration for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Initial stop distance in ATR units.
    pub stop_loss_atr_multiplier: f64,
    /// Trailing stop distance in ATR units, once trailing is active.
    pub trailing_stop_atr_multiplier: f64,
    /// Profit (in ATR units) required before the trailing stop activates.
    pub trailing_stop_activation_atr: f64,
    /// Scaled take-profit ladder, strictly ascending `profit_pct`,
    /// `close_pct` summing to 1.0. Empty disables take-profit entirely
    /// (stop-only position).
    pub tp_levels: Vec<TpLevel>,
    /// Minimum tradable quantity for the instrument.
    pub min_order_size: Qty,
    /// Maximum holding time before a position is closed at market.
    /// `None` disables the time-based exit.
    pub max_hold_time_ms: Option<TimestampMs>,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_atr_multiplier: 2.0,
            trailing_stop_atr_multiplier: 1.5,
            trailing_stop_activation_atr: 1.0,
            tp_levels: vec![
                TpLevel { profit_pct: 0.03, close_pct: Decimal::new(40, 2) },
                TpLevel { profit_pct: 0.05, close_pct: Decimal::new(30, 2) },
                TpLevel { profit_pct: 0.08, close_pct: Decimal::new(30, 2) },
            ],
            min_order_size: Decimal::new(1, 3),
            max_hold_time_ms: None,
        }
    }
}

/// Execution cost assumptions applied to simulated fills.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostConfig {
    /// Taker fee as a fraction of notional (e.g. 0.0005 for 0.05%).
    pub trading_fee_rate: f64,
    /// Assumed slippage as a fraction of price (e.g. 0.0002 for 0.02%).
    pub slippage_rate: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            trading_fee_rate: 0.0005,
            slippage_rate: 0.0002,
        }
    }
}

impl CostConfig {
    /// Combined unfavorable price adjustment per fill.
    #[inline]
    pub fn total_rate(&self) -> f64 {
        self.trading_fee_rate + self.slippage_rate
    }
}

/// Outcome of validating a configured take-profit ladder.
///
/// Positions never carry an inconsistent ladder: a violated config is either
/// normalized or collapsed to a single take-profit, never left as-is.
#[derive(Debug, Clone)]
pub struct ResolvedLadder {
    /// The ladder the position will actually use.
    pub levels: Vec<TpLevel>,
    /// True when the scaled ladder survived validation; false when it was
    /// rejected and collapsed to a single 100% take-profit.
    pub scaled: bool,
    /// Human-readable validation warnings for the caller to log.
    pub warnings: Vec<String>,
}

impl ExitConfig {
    /// Validate and normalize the configured ladder.
    ///
    /// - Non-ascending `profit_pct` (or non-positive entries) rejects the
    ///   scaled ladder and falls back to a single take-profit at the highest
    ///   configured profit threshold.
    /// - A `close_pct` sum off by more than [`CLOSE_PCT_TOLERANCE`] is
    ///   normalized proportionally. The last level always absorbs the exact
    ///   remainder so the fixed-point sum is exactly 1.
    pub fn resolve_ladder(&self) -> ResolvedLadder {
        let mut warnings = Vec::new();

        if self.tp_levels.is_empty() {
            return ResolvedLadder { levels: Vec::new(), scaled: false, warnings };
        }

        let malformed = self
            .tp_levels
            .iter()
            .any(|l| l.profit_pct <= 0.0 || l.close_pct <= Decimal::ZERO)
            || self
                .tp_levels
                .windows(2)
                .any(|w| w[1].profit_pct <= w[0].profit_pct);

        if malformed {
            let final_profit = self
                .tp_levels
                .iter()
                .map(|l| l.profit_pct)
                .fold(f64::MIN, f64::max);
            warnings.push(format!(
                "tp_levels rejected (profit_pct must be positive and strictly \
                 ascending); falling back to single take-profit at {:.4}",
                final_profit
            ));
            return ResolvedLadder {
                levels: vec![TpLevel { profit_pct: final_profit, close_pct: Decimal::ONE }],
                scaled: false,
                warnings,
            };
        }

        let total: Decimal = self.tp_levels.iter().map(|l| l.close_pct).sum();
        let mut levels = self.tp_levels.clone();

        let off = (crate::types::qty_f64(total) - 1.0).abs();
        if off > CLOSE_PCT_TOLERANCE {
            warnings.push(format!(
                "close_pct sum is {} instead of 1.0; normalizing proportionally",
                total
            ));
            for level in levels.iter_mut() {
                level.close_pct /= total;
            }
        }

        // The last level absorbs rounding so the sum is exactly 1.
        let head: Decimal = levels[..levels.len() - 1].iter().map(|l| l.close_pct).sum();
        if let Some(last) = levels.last_mut() {
            last.close_pct = Decimal::ONE - head;
        }

        ResolvedLadder { levels, scaled: true, warnings }
    }
}
