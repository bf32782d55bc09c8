//! Core data types for the ladder-trader system.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Timestamp in milliseconds since Unix epoch (UTC).
pub type TimestampMs = i64;

/// Quantity type.
///
/// Quantities and close percentages use fixed-point arithmetic so the
/// conservation invariant (partials + remaining == original) holds exactly,
/// with no float drift across long partial-exit ladders.
pub type Qty = Decimal;

/// Convert a quantity to `f64` for PnL arithmetic.
///
/// Prices and PnL stay in `f64`; only position bookkeeping is fixed-point.
#[inline]
pub fn qty_f64(qty: Qty) -> f64 {
    qty.to_f64().unwrap_or(0.0)
}

/// Position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Get sign: +1 for long, -1 for short.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    /// The opposite side (the direction of a closing order).
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

/// One OHLCV observation; the causality unit for backtest simulation.
///
/// Candles are ordered and immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open timestamp in milliseconds.
    pub ts_ms: TimestampMs,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Total volume.
    pub volume: f64,
}

impl Candle {
    /// Clamp a price into this candle's realized `[low, high]` range.
    ///
    /// Simulated fills never use a price the bar did not trade at.
    #[inline]
    pub fn clamp(&self, price: f64) -> f64 {
        price.clamp(self.low, self.high)
    }

    /// The most adverse price this bar reached for a position on `side`.
    #[inline]
    pub fn adverse_extreme(&self, side: Side) -> f64 {
        match side {
            Side::Long => self.low,
            Side::Short => self.high,
        }
    }

    /// The most favorable price this bar reached for a position on `side`.
    #[inline]
    pub fn favorable_extreme(&self, side: Side) -> f64 {
        match side {
            Side::Long => self.high,
            Side::Short => self.low,
        }
    }
}

/// Reason a position (or part of one) was closed.
///
/// A closed enumeration checked at compile time. Emergency shutdown maps to
/// `Panic`; there is no escape hatch for ad hoc string reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    /// Initial protective stop hit.
    StopLoss,
    /// Trailing stop hit after it had ratcheted from the initial stop.
    TrailingStop,
    /// Final take-profit level of the ladder reached.
    TakeProfitFinal,
    /// External strategy signaled an exit.
    SignalExit,
    /// Emergency close of all positions.
    Panic,
    /// Maximum hold time exceeded.
    TimeBased,
    /// Market regime flipped against the position.
    RegimeChange,
}

impl ExitReason {
    /// Stable string form for structured logs and persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::TakeProfitFinal => "TAKE_PROFIT_FINAL",
            ExitReason::SignalExit => "SIGNAL_EXIT",
            ExitReason::Panic => "PANIC",
            ExitReason::TimeBased => "TIME_BASED",
            ExitReason::RegimeChange => "REGIME_CHANGE",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry signal consumed from the external signal generator.
///
/// The position core never decides *whether* to trade; it receives this and
/// manages the resulting position's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySignal {
    /// Trading symbol.
    pub symbol: String,
    /// Requested side.
    pub side: Side,
    /// Price hint at signal time (not the fill price).
    pub entry_price_hint: f64,
    /// ATR at signal time, used to size stops and targets.
    pub atr: f64,
}

/// A realized fill, simulated or confirmed by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Timestamp of fill.
    pub ts_ms: TimestampMs,
    /// Fill price, net of simulated slippage where applicable.
    pub price: f64,
    /// Filled quantity (positive).
    pub qty: Qty,
    /// Side of the fill order.
    pub side: Side,
    /// Fee paid (positive).
    pub fee: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_sign() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
        assert_eq!(Side::Long.opposite(), Side::Short);
    }

    #[test]
    fn test_candle_clamp() {
        let candle = Candle {
            ts_ms: 0,
            open: 100.0,
            high: 104.0,
            low: 98.0,
            close: 103.0,
            volume: 10.0,
        };
        assert_eq!(candle.clamp(105.0), 104.0);
        assert_eq!(candle.clamp(90.0), 98.0);
        assert_eq!(candle.clamp(101.5), 101.5);
    }

    #[test]
    fn test_candle_extremes() {
        let candle = Candle {
            ts_ms: 0,
            open: 100.0,
            high: 104.0,
            low: 98.0,
            close: 103.0,
            volume: 10.0,
        };
        assert_eq!(candle.adverse_extreme(Side::Long), 98.0);
        assert_eq!(candle.adverse_extreme(Side::Short), 104.0);
        assert_eq!(candle.favorable_extreme(Side::Long), 104.0);
        assert_eq!(candle.favorable_extreme(Side::Short), 98.0);
    }

    #[test]
    fn test_exit_reason_round_trip() {
        let json = serde_json::to_string(&ExitReason::TrailingStop).unwrap();
        let back: ExitReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ExitReason::TrailingStop);
        assert_eq!(ExitReason::Panic.as_str(), "PANIC");
    }

    #[test]
    fn test_qty_f64() {
        assert_eq!(qty_f64(dec!(0.4)), 0.4);
        assert_eq!(qty_f64(Qty::ZERO), 0.0);
    }
}
