//! Position state: one open trade and its exit progress.
//!
//! A `Position` is created on a confirmed entry fill and mutated exclusively
//! by the `PositionManager` for its open lifetime. Everything else sees
//! immutable snapshots.

use ladder_core::{qty_f64, Error, ExitReason, Qty, Result, Side, TimestampMs, TpLevel};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One executed partial exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialExit {
    /// Ladder level index (0-based) that triggered this exit.
    pub level: usize,
    /// Quantity closed.
    pub qty: Qty,
    /// Fill price.
    pub price: f64,
    /// Fill timestamp.
    pub ts_ms: TimestampMs,
    /// Realized PnL for this portion.
    pub realized_pnl: f64,
}

/// What an outstanding (unconfirmed) close order is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PendingKind {
    /// Partial close for a ladder level.
    Partial { level: usize },
    /// Full close of everything that was remaining.
    Full { reason: ExitReason },
}

/// Quantity reserved by a close order whose fill confirmation is still
/// outstanding. The quantity lives here, not in `remaining_quantity`, so it
/// can be neither re-closed nor silently assumed filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingClose {
    pub qty: Qty,
    pub kind: PendingKind,
}

/// An open position and its exit progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub(crate) symbol: String,
    pub(crate) side: Side,
    pub(crate) entry_price: f64,
    pub(crate) entry_time: TimestampMs,
    pub(crate) original_quantity: Qty,
    pub(crate) remaining_quantity: Qty,
    pub(crate) current_stop_loss: f64,
    /// Validated/normalized ladder. Empty means stop-only.
    pub(crate) tp_levels: Vec<TpLevel>,
    /// Level indices already triggered, strictly increasing.
    pub(crate) tp_levels_hit: Vec<usize>,
    pub(crate) partial_exits: Vec<PartialExit>,
    /// Candle index of the entry fill (backtest only).
    pub(crate) entry_bar_index: Option<usize>,
    /// ATR at entry, kept for stop/target recomputation on restore.
    pub(crate) atr_at_entry: f64,
    /// Set once the trailing stop has ratcheted away from the initial stop.
    pub(crate) trailing_active: bool,
    /// Close percentage carried over from levels skipped for being below
    /// the minimum order size.
    pub(crate) deferred_close_pct: Qty,
    /// Outstanding live close order, if any.
    pub(crate) pending_close: Option<PendingClose>,
    /// Set when a close order exhausted its retries; the position is still
    /// tracked and surfaced as a fatal alert.
    pub(crate) pending_failure: bool,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        symbol: String,
        side: Side,
        entry_price: f64,
        entry_time: TimestampMs,
        quantity: Qty,
        stop_loss: f64,
        tp_levels: Vec<TpLevel>,
        atr: f64,
        entry_bar_index: Option<usize>,
    ) -> Self {
        Self {
            symbol,
            side,
            entry_price,
            entry_time,
            original_quantity: quantity,
            remaining_quantity: quantity,
            current_stop_loss: stop_loss,
            tp_levels,
            tp_levels_hit: Vec::new(),
            partial_exits: Vec::new(),
            entry_bar_index,
            atr_at_entry: atr,
            trailing_active: false,
            deferred_close_pct: Decimal::ZERO,
            pending_close: None,
            pending_failure: false,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn entry_price(&self) -> f64 {
        self.entry_price
    }

    pub fn entry_time(&self) -> TimestampMs {
        self.entry_time
    }

    pub fn original_quantity(&self) -> Qty {
        self.original_quantity
    }

    pub fn remaining_quantity(&self) -> Qty {
        self.remaining_quantity
    }

    pub fn current_stop_loss(&self) -> f64 {
        self.current_stop_loss
    }

    pub fn tp_levels(&self) -> &[TpLevel] {
        &self.tp_levels
    }

    pub fn tp_levels_hit(&self) -> &[usize] {
        &self.tp_levels_hit
    }

    pub fn partial_exits(&self) -> &[PartialExit] {
        &self.partial_exits
    }

    pub fn entry_bar_index(&self) -> Option<usize> {
        self.entry_bar_index
    }

    pub fn atr_at_entry(&self) -> f64 {
        self.atr_at_entry
    }

    pub fn trailing_active(&self) -> bool {
        self.trailing_active
    }

    pub fn pending_close(&self) -> Option<&PendingClose> {
        self.pending_close.as_ref()
    }

    pub fn pending_failure(&self) -> bool {
        self.pending_failure
    }

    /// Closed means nothing remains and nothing is in flight.
    pub fn is_closed(&self) -> bool {
        self.remaining_quantity == Decimal::ZERO && self.pending_close.is_none()
    }

    /// Signed unrealized profit fraction of entry price at `price`.
    #[inline]
    pub fn profit_fraction(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) / self.entry_price
    }

    /// Unrealized PnL of the remaining quantity at `price`.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * qty_f64(self.remaining_quantity)
    }

    /// Target price for ladder level `level`.
    pub fn target_price(&self, level: usize) -> Option<f64> {
        let tp = self.tp_levels.get(level)?;
        Some(self.entry_price * (1.0 + self.side.sign() * tp.profit_pct))
    }

    /// Lowest-indexed ladder level not yet hit.
    pub fn next_unhit_level(&self) -> Option<usize> {
        (0..self.tp_levels.len()).find(|i| !self.tp_levels_hit.contains(i))
    }

    /// True once the price has crossed the stop against the position.
    #[inline]
    pub fn stop_breached(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price <= self.current_stop_loss,
            Side::Short => price >= self.current_stop_loss,
        }
    }

    /// Check the conservation and ordering invariants.
    ///
    /// Quantity bookkeeping is fixed-point, so conservation is checked
    /// exactly, not within a float tolerance.
    pub fn validate(&self) -> Result<()> {
        let partial_sum: Qty = self.partial_exits.iter().map(|p| p.qty).sum();
        let pending: Qty = self.pending_close.as_ref().map(|p| p.qty).unwrap_or(Decimal::ZERO);
        if partial_sum + self.remaining_quantity + pending != self.original_quantity {
            return Err(Error::position(format!(
                "{}: quantity conservation violated: partials {} + remaining {} + pending {} != original {}",
                self.symbol, partial_sum, self.remaining_quantity, pending, self.original_quantity
            )));
        }
        if self.tp_levels_hit.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::position(format!(
                "{}: tp_levels_hit not strictly increasing: {:?}",
                self.symbol, self.tp_levels_hit
            )));
        }
        if self.remaining_quantity < Decimal::ZERO {
            return Err(Error::position(format!(
                "{}: negative remaining quantity {}",
                self.symbol, self.remaining_quantity
            )));
        }
        Ok(())
    }

    /// Rebuild a position from persisted state.
    ///
    /// Recomputes `remaining_quantity` from the partial-exit history and
    /// validates it against the stored value before the position is resumed.
    pub fn restore(mut persisted: Position) -> Result<Position> {
        let partial_sum: Qty = persisted.partial_exits.iter().map(|p| p.qty).sum();
        let pending: Qty = persisted
            .pending_close
            .as_ref()
            .map(|p| p.qty)
            .unwrap_or(Decimal::ZERO);
        let recomputed = persisted.original_quantity - partial_sum - pending;
        if recomputed != persisted.remaining_quantity {
            return Err(Error::position(format!(
                "{}: persisted remaining {} disagrees with recomputed {}",
                persisted.symbol, persisted.remaining_quantity, recomputed
            )));
        }
        persisted.remaining_quantity = recomputed;
        persisted.validate()?;
        Ok(persisted)
    }

    /// Immutable snapshot for dashboard consumers.
    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            symbol: self.symbol.clone(),
            side: self.side,
            entry_price: self.entry_price,
            entry_time: self.entry_time,
            original_quantity: self.original_quantity,
            remaining_quantity: self.remaining_quantity,
            current_stop_loss: self.current_stop_loss,
            tp_levels_hit: self.tp_levels_hit.clone(),
            next_target_price: self.next_unhit_level().and_then(|l| self.target_price(l)),
            trailing_active: self.trailing_active,
            pending_failure: self.pending_failure,
        }
    }
}

/// Read-only view of a position for external consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: TimestampMs,
    pub original_quantity: Qty,
    pub remaining_quantity: Qty,
    pub current_stop_loss: f64,
    pub tp_levels_hit: Vec<usize>,
    pub next_target_price: Option<f64>,
    pub trailing_active: bool,
    pub pending_failure: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_position() -> Position {
        Position::new(
            "BTCUSDT".to_string(),
            Side::Long,
            100.0,
            1_000,
            dec!(1.0),
            94.0,
            vec![
                TpLevel { profit_pct: 0.03, close_pct: dec!(0.40) },
                TpLevel { profit_pct: 0.05, close_pct: dec!(0.30) },
                TpLevel { profit_pct: 0.08, close_pct: dec!(0.30) },
            ],
            2.0,
            None,
        )
    }

    #[test]
    fn test_target_prices() {
        let pos = make_position();
        approx::assert_relative_eq!(pos.target_price(0).unwrap(), 103.0);
        approx::assert_relative_eq!(pos.target_price(1).unwrap(), 105.0);
        approx::assert_relative_eq!(pos.target_price(2).unwrap(), 108.0);
        assert!(pos.target_price(3).is_none());
    }

    #[test]
    fn test_short_targets_below_entry() {
        let mut pos = make_position();
        pos.side = Side::Short;
        approx::assert_relative_eq!(pos.target_price(0).unwrap(), 97.0);
    }

    #[test]
    fn test_profit_fraction_sign_adjusted() {
        let mut pos = make_position();
        approx::assert_relative_eq!(pos.profit_fraction(103.0), 0.03);
        pos.side = Side::Short;
        approx::assert_relative_eq!(pos.profit_fraction(103.0), -0.03);
        approx::assert_relative_eq!(pos.profit_fraction(97.0), 0.03);
    }

    #[test]
    fn test_stop_breached() {
        let pos = make_position();
        assert!(pos.stop_breached(94.0));
        assert!(pos.stop_breached(93.0));
        assert!(!pos.stop_breached(94.1));
    }

    #[test]
    fn test_validate_conservation() {
        let mut pos = make_position();
        assert!(pos.validate().is_ok());

        pos.partial_exits.push(PartialExit {
            level: 0,
            qty: dec!(0.4),
            price: 103.0,
            ts_ms: 2_000,
            realized_pnl: 1.2,
        });
        pos.tp_levels_hit.push(0);
        // Forgot to reduce remaining: conservation must fail.
        assert!(pos.validate().is_err());

        pos.remaining_quantity = dec!(0.6);
        assert!(pos.validate().is_ok());
    }

    #[test]
    fn test_restore_round_trip() {
        let mut pos = make_position();
        pos.partial_exits.push(PartialExit {
            level: 0,
            qty: dec!(0.4),
            price: 103.0,
            ts_ms: 2_000,
            realized_pnl: 1.2,
        });
        pos.tp_levels_hit.push(0);
        pos.remaining_quantity = dec!(0.6);

        let json = serde_json::to_string(&pos).unwrap();
        let restored = Position::restore(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.remaining_quantity(), dec!(0.6));
        assert_eq!(restored.tp_levels_hit(), &[0]);
        assert_eq!(restored.partial_exits().len(), 1);
    }

    #[test]
    fn test_restore_rejects_inconsistent_remaining() {
        let mut pos = make_position();
        pos.partial_exits.push(PartialExit {
            level: 0,
            qty: dec!(0.4),
            price: 103.0,
            ts_ms: 2_000,
            realized_pnl: 1.2,
        });
        pos.tp_levels_hit.push(0);
        // Stored remaining still claims the full size.
        assert!(Position::restore(pos).is_err());
    }

    #[test]
    fn test_snapshot_next_target() {
        let mut pos = make_position();
        pos.tp_levels_hit.push(0);
        pos.remaining_quantity = dec!(0.6);
        pos.partial_exits.push(PartialExit {
            level: 0,
            qty: dec!(0.4),
            price: 103.0,
            ts_ms: 2_000,
            realized_pnl: 1.2,
        });
        let snap = pos.snapshot();
        approx::assert_relative_eq!(snap.next_target_price.unwrap(), 105.0);
        assert_eq!(snap.tp_levels_hit, vec![0]);
    }
}
