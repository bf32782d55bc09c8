//! Position manager: the sole mutator of position state.
//!
//! All lifecycle transitions go through here: opening on a confirmed entry
//! fill, applying exit decisions, the live pending-close protocol, and the
//! emergency close sweep. Callers outside this crate only ever see
//! snapshots and emitted events.

use std::collections::HashMap;

use ladder_core::{
    qty_f64, Error, ExitConfig, ExitReason, Qty, Result, Side, TimestampMs, TpLevel,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::ladder::{ExitDecision, ExitLadder};
use crate::position::{PartialExit, PendingClose, PendingKind, Position, PositionSnapshot};

/// Maps a nominal trigger price (stop or target) to the price a close order
/// actually fills at. The backtest implementation clamps into the current
/// bar and applies fee/slippage; live confirmations carry the real fill.
pub trait FillPricer {
    fn close_fill_price(&self, side: Side, nominal: f64) -> f64;
}

/// Identity pricer: fills at the nominal trigger price.
pub struct NominalFill;

impl FillPricer for NominalFill {
    fn close_fill_price(&self, _side: Side, nominal: f64) -> f64 {
        nominal
    }
}

/// One executed partial exit, with the stop movement it caused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialExitRecord {
    pub symbol: String,
    /// Ladder level index that triggered the exit.
    pub level: usize,
    pub qty: Qty,
    pub price: f64,
    pub realized_pnl: f64,
    /// Stop before the post-exit ratchet.
    pub old_stop: f64,
    /// Stop after the post-exit ratchet.
    pub new_stop: f64,
    pub ts_ms: TimestampMs,
}

/// One completed position lifecycle: entry through final close, partial
/// exits included. PnL is recorded once, here, when the position closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: TimestampMs,
    pub exit_price: f64,
    pub exit_time: TimestampMs,
    pub original_quantity: Qty,
    /// Quantity closed by the final exit (the remainder at close time).
    pub final_quantity: Qty,
    pub exit_reason: ExitReason,
    pub partial_exits: Vec<PartialExit>,
    /// PnL of the final close alone.
    pub final_pnl: f64,
    /// Sum of partial-exit PnL and the final close PnL.
    pub total_pnl: f64,
    /// Candle index of the entry fill (backtest only).
    pub entry_bar_index: Option<usize>,
}

/// State change emitted by the manager for downstream consumers.
#[derive(Debug, Clone)]
pub enum ExitEvent {
    Partial(PartialExitRecord),
    Closed(TradeRecord),
}

/// A close order the caller must now dispatch to the exchange.
#[derive(Debug, Clone)]
pub struct CloseIntent {
    pub symbol: String,
    /// Side of the closing order (opposite of the position side).
    pub order_side: Side,
    pub qty: Qty,
    pub kind: PendingKind,
    /// Trigger price that produced this intent.
    pub nominal_price: f64,
}

/// How a requested partial close resolves against the minimum order size.
enum PartialPlan {
    /// Too small to trade: mark the level hit and carry its percentage.
    Skip { carried: Qty },
    /// Normal partial close.
    Close { qty: Qty },
    /// Post-close remainder would be untradable: close everything now.
    CloseRemainder { qty: Qty },
}

/// Sole owner and mutator of open positions.
pub struct PositionManager {
    config: ExitConfig,
    positions: HashMap<String, Position>,
}

impl PositionManager {
    pub fn new(config: ExitConfig) -> Self {
        Self { config, positions: HashMap::new() }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn open_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn snapshots(&self) -> Vec<PositionSnapshot> {
        let mut snaps: Vec<PositionSnapshot> =
            self.positions.values().map(Position::snapshot).collect();
        snaps.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        snaps
    }

    /// Open a position from a confirmed entry fill.
    ///
    /// Resolves the configured ladder against the actual position size: if
    /// every partial rung falls below the minimum order size, scaled exits
    /// are disabled and the position carries a single 100% take-profit at
    /// the highest configured threshold.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        symbol: &str,
        side: Side,
        entry_price: f64,
        entry_time: TimestampMs,
        quantity: Qty,
        atr: f64,
        entry_bar_index: Option<usize>,
    ) -> Result<PositionSnapshot> {
        if self.positions.contains_key(symbol) {
            return Err(Error::position(format!("{symbol}: position already open")));
        }
        if quantity < self.config.min_order_size || quantity <= Decimal::ZERO {
            return Err(Error::position(format!(
                "{symbol}: entry quantity {quantity} below minimum order size {}",
                self.config.min_order_size
            )));
        }
        if atr <= 0.0 {
            return Err(Error::data(format!("{symbol}: non-positive ATR {atr} at entry")));
        }

        let resolved = self.config.resolve_ladder();
        for warning in &resolved.warnings {
            warn!(symbol, "{warning}");
        }

        let mut levels = resolved.levels;
        if levels.len() > 1 {
            let all_below = levels
                .iter()
                .all(|l| l.close_pct * quantity < self.config.min_order_size);
            if all_below {
                let final_profit = levels
                    .iter()
                    .map(|l| l.profit_pct)
                    .fold(f64::MIN, f64::max);
                warn!(
                    symbol,
                    %quantity,
                    "every ladder rung is below the minimum order size; \
                     disabling scaled exits for this position"
                );
                levels = vec![TpLevel { profit_pct: final_profit, close_pct: Decimal::ONE }];
            }
        }

        let stop_loss = entry_price - side.sign() * self.config.stop_loss_atr_multiplier * atr;
        let position = Position::new(
            symbol.to_string(),
            side,
            entry_price,
            entry_time,
            quantity,
            stop_loss,
            levels,
            atr,
            entry_bar_index,
        );
        info!(
            symbol,
            ?side,
            entry_price,
            %quantity,
            stop_loss,
            tp_levels = position.tp_levels().len(),
            "position opened"
        );
        let snapshot = position.snapshot();
        self.positions.insert(symbol.to_string(), position);
        Ok(snapshot)
    }

    /// Evaluate the exit ladder for one symbol without mutating anything.
    pub fn evaluate(
        &self,
        symbol: &str,
        price: f64,
        atr: f64,
        ts_ms: TimestampMs,
    ) -> Option<ExitDecision> {
        self.positions
            .get(symbol)
            .map(|p| ExitLadder::evaluate(p, price, atr, ts_ms, &self.config))
    }

    /// Evaluate and apply exit decisions for one price update.
    ///
    /// A single update can cross several triggers at once (a gap over two
    /// take-profit targets, a trailing ratchet followed by a partial), so
    /// this loops until the ladder settles. The iteration cap only guards
    /// against a misbehaving decision cycle; a healthy ladder settles in a
    /// handful of steps.
    pub fn update(
        &mut self,
        symbol: &str,
        price: f64,
        atr: f64,
        ts_ms: TimestampMs,
        pricer: &dyn FillPricer,
    ) -> Result<Vec<ExitEvent>> {
        let mut events = Vec::new();
        let max_steps = 2 * self.config.tp_levels.len() + 4;
        for _ in 0..max_steps {
            let Some(position) = self.positions.get(symbol) else { break };
            let side = position.side();
            let decision = ExitLadder::evaluate(position, price, atr, ts_ms, &self.config);
            match decision {
                ExitDecision::NoAction => break,
                ExitDecision::TrailingUpdate { .. } => {
                    self.apply(symbol, decision, price, ts_ms)?;
                }
                ExitDecision::PartialClose { target_price, .. } => {
                    let fill = pricer.close_fill_price(side, target_price);
                    if let Some(event) = self.apply(symbol, decision, fill, ts_ms)? {
                        events.push(event);
                    }
                }
                ExitDecision::FullClose { price: nominal, .. } => {
                    let fill = pricer.close_fill_price(side, nominal);
                    if let Some(event) = self.apply(symbol, decision, fill, ts_ms)? {
                        events.push(event);
                    }
                }
            }
        }
        Ok(events)
    }

    /// Apply one decision with a known fill price.
    ///
    /// The backtest calls this via [`PositionManager::update`]; live mode
    /// goes through the pending-close protocol instead, and only routes
    /// trailing updates (which need no order) through here.
    pub fn apply(
        &mut self,
        symbol: &str,
        decision: ExitDecision,
        fill_price: f64,
        ts_ms: TimestampMs,
    ) -> Result<Option<ExitEvent>> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| Error::position(format!("{symbol}: no open position")))?;

        match decision {
            ExitDecision::NoAction => Ok(None),
            ExitDecision::TrailingUpdate { new_stop } => {
                let tighter = match position.side() {
                    Side::Long => new_stop > position.current_stop_loss,
                    Side::Short => new_stop < position.current_stop_loss,
                };
                if tighter {
                    debug!(
                        symbol,
                        old_stop = position.current_stop_loss,
                        new_stop,
                        "trailing stop ratcheted"
                    );
                    position.current_stop_loss = new_stop;
                    position.trailing_active = true;
                }
                Ok(None)
            }
            ExitDecision::PartialClose { level, close_pct, .. } => {
                match Self::plan_partial(position, close_pct, self.config.min_order_size) {
                    PartialPlan::Skip { carried } => {
                        warn!(
                            symbol,
                            level,
                            %carried,
                            "partial below minimum order size; skipping level and \
                             deferring its percentage"
                        );
                        position.tp_levels_hit.push(level);
                        position.deferred_close_pct = carried;
                        Ok(None)
                    }
                    PartialPlan::Close { qty } => {
                        let record =
                            Self::record_partial(position, level, qty, fill_price, ts_ms);
                        position.validate()?;
                        info!(
                            symbol,
                            level,
                            %qty,
                            price = fill_price,
                            pnl = record.realized_pnl,
                            new_stop = record.new_stop,
                            "partial exit"
                        );
                        Ok(Some(ExitEvent::Partial(record)))
                    }
                    PartialPlan::CloseRemainder { qty } => {
                        warn!(
                            symbol,
                            level,
                            %qty,
                            "post-close remainder would be below minimum order size; \
                             closing the full remainder"
                        );
                        position.tp_levels_hit.push(level);
                        let record = self.finish(
                            symbol,
                            fill_price,
                            ts_ms,
                            ExitReason::TakeProfitFinal,
                        )?;
                        Ok(Some(ExitEvent::Closed(record)))
                    }
                }
            }
            ExitDecision::FullClose { reason, .. } => {
                let record = self.finish(symbol, fill_price, ts_ms, reason)?;
                Ok(Some(ExitEvent::Closed(record)))
            }
        }
    }

    /// Emergency close of every open position at current prices.
    ///
    /// Positions with an unconfirmed close order in flight are left for
    /// their pending protocol to settle; closing them here would risk a
    /// double fill. Symbols without a price are reported and kept open.
    pub fn panic_close_all(
        &mut self,
        prices: &HashMap<String, f64>,
        ts_ms: TimestampMs,
        pricer: &dyn FillPricer,
    ) -> Result<Vec<TradeRecord>> {
        let mut records = Vec::new();
        for symbol in self.open_symbols() {
            let Some(position) = self.positions.get(&symbol) else { continue };
            if position.pending_close().is_some() {
                warn!(symbol, "panic close deferred: close order already in flight");
                continue;
            }
            let Some(&price) = prices.get(&symbol) else {
                error!(symbol, "panic close has no current price; position left open");
                continue;
            };
            let fill = pricer.close_fill_price(position.side(), price);
            let record = self.finish(&symbol, fill, ts_ms, ExitReason::Panic)?;
            records.push(record);
        }
        info!(closed = records.len(), "panic close sweep complete");
        Ok(records)
    }

    /// Reserve quantity for a close order about to be dispatched.
    ///
    /// The quantity moves out of `remaining_quantity` so a concurrent
    /// evaluation cannot close it twice. Returns `None` when the decision
    /// needs no order (no-op, trailing update applied inline, or a skipped
    /// below-minimum level).
    pub fn begin_close(
        &mut self,
        symbol: &str,
        decision: &ExitDecision,
        ts_ms: TimestampMs,
    ) -> Result<Option<CloseIntent>> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| Error::position(format!("{symbol}: no open position")))?;
        if position.pending_close.is_some() {
            return Err(Error::position(format!(
                "{symbol}: close order already in flight"
            )));
        }

        match decision {
            ExitDecision::NoAction => Ok(None),
            ExitDecision::TrailingUpdate { .. } => {
                self.apply(symbol, decision.clone(), 0.0, ts_ms)?;
                Ok(None)
            }
            ExitDecision::PartialClose { level, close_pct, target_price } => {
                match Self::plan_partial(position, *close_pct, self.config.min_order_size) {
                    PartialPlan::Skip { carried } => {
                        warn!(
                            symbol,
                            level,
                            %carried,
                            "partial below minimum order size; skipping level and \
                             deferring its percentage"
                        );
                        position.tp_levels_hit.push(*level);
                        position.deferred_close_pct = carried;
                        Ok(None)
                    }
                    PartialPlan::Close { qty } => {
                        position.tp_levels_hit.push(*level);
                        position.deferred_close_pct = Decimal::ZERO;
                        position.remaining_quantity -= qty;
                        position.pending_close =
                            Some(PendingClose { qty, kind: PendingKind::Partial { level: *level } });
                        Ok(Some(CloseIntent {
                            symbol: symbol.to_string(),
                            order_side: position.side.opposite(),
                            qty,
                            kind: PendingKind::Partial { level: *level },
                            nominal_price: *target_price,
                        }))
                    }
                    PartialPlan::CloseRemainder { qty } => {
                        position.tp_levels_hit.push(*level);
                        position.deferred_close_pct = Decimal::ZERO;
                        position.remaining_quantity = Decimal::ZERO;
                        let kind = PendingKind::Full { reason: ExitReason::TakeProfitFinal };
                        position.pending_close = Some(PendingClose { qty, kind });
                        Ok(Some(CloseIntent {
                            symbol: symbol.to_string(),
                            order_side: position.side.opposite(),
                            qty,
                            kind,
                            nominal_price: *target_price,
                        }))
                    }
                }
            }
            ExitDecision::FullClose { reason, price } => {
                let qty = position.remaining_quantity;
                if qty == Decimal::ZERO {
                    return Ok(None);
                }
                position.remaining_quantity = Decimal::ZERO;
                let kind = PendingKind::Full { reason: *reason };
                position.pending_close = Some(PendingClose { qty, kind });
                Ok(Some(CloseIntent {
                    symbol: symbol.to_string(),
                    order_side: position.side.opposite(),
                    qty,
                    kind,
                    nominal_price: *price,
                }))
            }
        }
    }

    /// Finalize a confirmed close fill for the outstanding pending order.
    ///
    /// `fee` is the exchange-reported cost of the fill and comes straight
    /// off the realized PnL; simulated fills embed costs in the price and
    /// pass zero.
    pub fn confirm_close(
        &mut self,
        symbol: &str,
        fill_price: f64,
        fee: f64,
        ts_ms: TimestampMs,
    ) -> Result<ExitEvent> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| Error::position(format!("{symbol}: no open position")))?;
        let pending = position
            .pending_close
            .take()
            .ok_or_else(|| Error::position(format!("{symbol}: no close order in flight")))?;

        match pending.kind {
            PendingKind::Partial { level } => {
                // Quantity already left `remaining_quantity` at dispatch
                // time; put it back so the shared bookkeeping path applies.
                position.remaining_quantity += pending.qty;
                let record = Self::record_partial_reserved(
                    position,
                    level,
                    pending.qty,
                    fill_price,
                    fee,
                    ts_ms,
                );
                position.validate()?;
                info!(
                    symbol,
                    level,
                    qty = %pending.qty,
                    price = fill_price,
                    pnl = record.realized_pnl,
                    "partial close confirmed"
                );
                Ok(ExitEvent::Partial(record))
            }
            PendingKind::Full { reason } => {
                position.remaining_quantity += pending.qty;
                let record = self.finish_with_fee(symbol, fill_price, fee, ts_ms, reason)?;
                Ok(ExitEvent::Closed(record))
            }
        }
    }

    /// Restore reserved quantity after a close order exhausted its retries.
    ///
    /// The position stays tracked with `pending_failure` set; the operator
    /// must intervene before it trades again.
    pub fn abort_close(&mut self, symbol: &str) -> Result<()> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| Error::position(format!("{symbol}: no open position")))?;
        let pending = position
            .pending_close
            .take()
            .ok_or_else(|| Error::position(format!("{symbol}: no close order in flight")))?;
        position.remaining_quantity += pending.qty;
        position.pending_failure = true;
        error!(
            symbol,
            qty = %pending.qty,
            "close order failed after retries; quantity restored, manual \
             intervention required"
        );
        position.validate()
    }

    fn plan_partial(position: &Position, close_pct: Qty, min_order_size: Qty) -> PartialPlan {
        let requested =
            (close_pct + position.deferred_close_pct) * position.original_quantity;
        let qty = requested.min(position.remaining_quantity);
        if qty < min_order_size {
            PartialPlan::Skip { carried: close_pct + position.deferred_close_pct }
        } else if position.remaining_quantity - qty < min_order_size {
            PartialPlan::CloseRemainder { qty: position.remaining_quantity }
        } else {
            PartialPlan::Close { qty }
        }
    }

    /// Record a partial exit whose quantity is still inside
    /// `remaining_quantity` (the synchronous path).
    fn record_partial(
        position: &mut Position,
        level: usize,
        qty: Qty,
        fill_price: f64,
        ts_ms: TimestampMs,
    ) -> PartialExitRecord {
        position.tp_levels_hit.push(level);
        position.deferred_close_pct = Decimal::ZERO;
        Self::record_partial_reserved(position, level, qty, fill_price, 0.0, ts_ms)
    }

    /// Shared bookkeeping for a partial fill: reduce remaining, append the
    /// exit, ratchet the stop ladder. `fee` is deducted from the realized
    /// PnL.
    fn record_partial_reserved(
        position: &mut Position,
        level: usize,
        qty: Qty,
        fill_price: f64,
        fee: f64,
        ts_ms: TimestampMs,
    ) -> PartialExitRecord {
        let realized_pnl =
            position.side.sign() * (fill_price - position.entry_price) * qty_f64(qty) - fee;
        position.remaining_quantity -= qty;
        position.partial_exits.push(PartialExit {
            level,
            qty,
            price: fill_price,
            ts_ms,
            realized_pnl,
        });

        // Stop ladder ratchet: level 0 moves the stop to breakeven, level k
        // moves it to the level k-1 target. Never loosens.
        let old_stop = position.current_stop_loss;
        let ladder_stop = if level == 0 {
            Some(position.entry_price)
        } else {
            position.target_price(level - 1)
        };
        if let Some(candidate) = ladder_stop {
            let tighter = match position.side {
                Side::Long => candidate > position.current_stop_loss,
                Side::Short => candidate < position.current_stop_loss,
            };
            if tighter {
                position.current_stop_loss = candidate;
            }
        }

        PartialExitRecord {
            symbol: position.symbol.clone(),
            level,
            qty,
            price: fill_price,
            realized_pnl,
            old_stop,
            new_stop: position.current_stop_loss,
            ts_ms,
        }
    }

    /// Close the full remainder and retire the position.
    fn finish(
        &mut self,
        symbol: &str,
        exit_price: f64,
        ts_ms: TimestampMs,
        reason: ExitReason,
    ) -> Result<TradeRecord> {
        self.finish_with_fee(symbol, exit_price, 0.0, ts_ms, reason)
    }

    /// As [`PositionManager::finish`], deducting an exchange-reported fee
    /// from the final close's PnL.
    fn finish_with_fee(
        &mut self,
        symbol: &str,
        exit_price: f64,
        fee: f64,
        ts_ms: TimestampMs,
        reason: ExitReason,
    ) -> Result<TradeRecord> {
        let position = self
            .positions
            .remove(symbol)
            .ok_or_else(|| Error::position(format!("{symbol}: no open position")))?;

        let final_quantity = position.remaining_quantity;
        let final_pnl = position.side.sign()
            * (exit_price - position.entry_price)
            * qty_f64(final_quantity)
            - fee;
        let partial_pnl: f64 = position.partial_exits.iter().map(|p| p.realized_pnl).sum();
        let total_pnl = partial_pnl + final_pnl;

        info!(
            symbol,
            %reason,
            exit_price,
            final_qty = %final_quantity,
            total_pnl,
            "position closed"
        );

        Ok(TradeRecord {
            symbol: position.symbol,
            side: position.side,
            entry_price: position.entry_price,
            entry_time: position.entry_time,
            exit_price,
            exit_time: ts_ms,
            original_quantity: position.original_quantity,
            final_quantity,
            exit_reason: reason,
            partial_exits: position.partial_exits,
            final_pnl,
            total_pnl,
            entry_bar_index: position.entry_bar_index,
        })
    }
}
