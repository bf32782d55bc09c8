//! Bias-free fill simulation.
//!
//! Two rules keep simulated fills honest: a fill never uses a price the bar
//! did not trade at (clamping), and costs always move the price against the
//! trader (multiplicative fee + slippage).

use ladder_core::{Candle, CostConfig, Side};
use ladder_risk::FillPricer;

/// Applies execution costs and bar-range clamping to simulated fills.
#[derive(Debug, Clone, Default)]
pub struct FillSimulator {
    costs: CostConfig,
}

impl FillSimulator {
    pub fn new(costs: CostConfig) -> Self {
        Self { costs }
    }

    pub fn costs(&self) -> &CostConfig {
        &self.costs
    }

    /// Entry fill price: the next candle's open, adjusted unfavorably.
    ///
    /// A long entry buys, so it pays up; a short entry sells, so it
    /// receives less.
    pub fn entry_price(&self, side: Side, next_candle: &Candle) -> f64 {
        let rate = self.costs.total_rate();
        match side {
            Side::Long => next_candle.open * (1.0 + rate),
            Side::Short => next_candle.open * (1.0 - rate),
        }
    }

    /// Close fill price for a raw (unclamped) trigger price.
    ///
    /// Closing a long sells; closing a short buys. Both directions lose
    /// the combined fee and slippage rate.
    pub fn close_price(&self, position_side: Side, nominal: f64) -> f64 {
        let rate = self.costs.total_rate();
        match position_side {
            Side::Long => nominal * (1.0 - rate),
            Side::Short => nominal * (1.0 + rate),
        }
    }
}

/// Fill pricing scoped to one candle: trigger prices are clamped into the
/// bar's traded range before costs apply.
pub struct BarFill<'a> {
    pub sim: &'a FillSimulator,
    pub candle: &'a Candle,
}

impl FillPricer for BarFill<'_> {
    fn close_fill_price(&self, side: Side, nominal: f64) -> f64 {
        self.sim.close_price(side, self.candle.clamp(nominal))
    }
}
