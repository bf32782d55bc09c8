//! Deterministic candle-replay backtest.
//!
//! Single-threaded, one pass, no lookahead: an entry signaled on bar N
//! fills at the open of bar N+1, and exits are never evaluated until the
//! bar index is strictly past `entry_bar_index + 1`. Replaying the same
//! candles and signals yields byte-identical results.

use std::collections::HashMap;

use ladder_core::{Candle, CostConfig, EntrySignal, Error, ExitConfig, ExitReason, Qty, Result};
use ladder_risk::{ExitDecision, ExitEvent, PositionManager, TradeRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::fill_sim::{BarFill, FillSimulator};
use crate::metrics::BacktestMetrics;

/// Backtest run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Starting equity.
    pub initial_capital: f64,
    /// Fixed quantity per trade. Sizing policy is the caller's concern;
    /// the runner replays exits, it does not allocate capital.
    pub trade_quantity: Qty,
    pub exit: ExitConfig,
    pub costs: CostConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            trade_quantity: Decimal::ONE,
            exit: ExitConfig::default(),
            costs: CostConfig::default(),
        }
    }
}

/// Everything a completed run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub trades: Vec<TradeRecord>,
    /// One equity value per candle, realized PnL only.
    pub equity_curve: Vec<f64>,
    pub final_equity: f64,
    pub metrics: BacktestMetrics,
}

/// Replays an ordered candle slice against externally supplied signals.
pub struct BacktestRunner {
    config: BacktestConfig,
    sim: FillSimulator,
}

impl BacktestRunner {
    pub fn new(config: BacktestConfig) -> Self {
        let sim = FillSimulator::new(config.costs);
        Self { config, sim }
    }

    /// Run one backtest. `signals` pairs a candle index with the entry
    /// signal raised on that candle.
    pub fn run(
        &self,
        candles: &[Candle],
        signals: &[(usize, EntrySignal)],
    ) -> Result<BacktestReport> {
        if candles.is_empty() {
            return Err(Error::data("backtest requires at least one candle"));
        }
        if candles.windows(2).any(|w| w[1].ts_ms <= w[0].ts_ms) {
            return Err(Error::data("candles must be strictly ordered by timestamp"));
        }

        let mut signals_by_bar: HashMap<usize, Vec<&EntrySignal>> = HashMap::new();
        for (bar, signal) in signals {
            signals_by_bar.entry(*bar).or_default().push(signal);
        }

        let mut manager = PositionManager::new(self.config.exit.clone());
        let mut trades: Vec<TradeRecord> = Vec::new();
        let mut equity = self.config.initial_capital;
        let mut equity_curve = Vec::with_capacity(candles.len());
        // Entries queued for the open of a future bar.
        let mut pending_entries: Vec<(usize, EntrySignal)> = Vec::new();

        for (i, candle) in candles.iter().enumerate() {
            let mut realized = 0.0f64;

            // 1. Fill entries scheduled for this bar's open.
            let due: Vec<EntrySignal> = {
                let (fill_now, later): (Vec<_>, Vec<_>) =
                    pending_entries.drain(..).partition(|(bar, _)| *bar == i);
                pending_entries = later;
                fill_now.into_iter().map(|(_, s)| s).collect()
            };
            for signal in due {
                if manager.has_position(&signal.symbol) {
                    debug!(symbol = %signal.symbol, bar = i, "entry skipped: position open");
                    continue;
                }
                let entry_price = self.sim.entry_price(signal.side, candle);
                manager.open(
                    &signal.symbol,
                    signal.side,
                    entry_price,
                    candle.ts_ms,
                    self.config.trade_quantity,
                    signal.atr,
                    Some(i),
                )?;
            }

            // 2. Evaluate exits, earliest two bars after entry excluded.
            for symbol in manager.open_symbols() {
                let Some(position) = manager.position(&symbol) else { continue };
                let Some(entry_bar) = position.entry_bar_index() else { continue };
                if i <= entry_bar + 1 {
                    continue;
                }
                let side = position.side();
                let atr = position.atr_at_entry();
                let pricer = BarFill { sim: &self.sim, candle };

                // Adverse extreme first: if the bar touched both the stop
                // and a target, the simulation takes the loss.
                let mut events = manager.update(
                    &symbol,
                    candle.adverse_extreme(side),
                    atr,
                    candle.ts_ms,
                    &pricer,
                )?;
                if manager.has_position(&symbol) {
                    events.extend(manager.update(
                        &symbol,
                        candle.favorable_extreme(side),
                        atr,
                        candle.ts_ms,
                        &pricer,
                    )?);
                }
                for event in events {
                    match event {
                        ExitEvent::Partial(p) => realized += p.realized_pnl,
                        ExitEvent::Closed(t) => {
                            realized += t.final_pnl;
                            trades.push(t);
                        }
                    }
                }
            }

            // 3. Queue entries signaled on this bar for the next open.
            if let Some(raised) = signals_by_bar.get(&i) {
                for signal in raised {
                    if i + 1 < candles.len() {
                        pending_entries.push((i + 1, (*signal).clone()));
                    } else {
                        debug!(
                            symbol = %signal.symbol,
                            bar = i,
                            "signal on final candle dropped: no bar left to fill on"
                        );
                    }
                }
            }

            equity += realized;
            equity_curve.push(equity);
        }

        // End of data: flatten whatever is still open at the last close.
        let last = &candles[candles.len() - 1];
        for symbol in manager.open_symbols() {
            let Some(position) = manager.position(&symbol) else { continue };
            let side = position.side();
            let fill = self.sim.close_price(side, last.close);
            let decision =
                ExitDecision::FullClose { reason: ExitReason::SignalExit, price: last.close };
            if let Some(ExitEvent::Closed(trade)) =
                manager.apply(&symbol, decision, fill, last.ts_ms)?
            {
                equity += trade.final_pnl;
                trades.push(trade);
            }
        }
        if let Some(last_point) = equity_curve.last_mut() {
            *last_point = equity;
        }

        let metrics =
            BacktestMetrics::compute(&trades, &equity_curve, self.config.initial_capital);
        info!(
            candles = candles.len(),
            trades = trades.len(),
            total_pnl = metrics.total_pnl,
            "backtest complete"
        );
        Ok(BacktestReport { trades, equity_curve, final_equity: equity, metrics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ladder_core::Side;
    use rust_decimal_macros::dec;

    fn candle(ts_ms: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle { ts_ms, open, high, low, close, volume: 100.0 }
    }

    fn flat(ts_ms: i64, price: f64) -> Candle {
        candle(ts_ms, price, price, price, price)
    }

    fn signal(symbol: &str, side: Side, atr: f64) -> EntrySignal {
        EntrySignal { symbol: symbol.to_string(), side, entry_price_hint: 100.0, atr }
    }

    fn zero_cost_config() -> BacktestConfig {
        BacktestConfig {
            costs: CostConfig { trading_fee_rate: 0.0, slippage_rate: 0.0 },
            trade_quantity: dec!(1.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_unordered_candles() {
        let runner = BacktestRunner::new(zero_cost_config());
        let candles = vec![flat(2_000, 100.0), flat(1_000, 100.0)];
        assert!(runner.run(&candles, &[]).is_err());
    }

    #[test]
    fn test_entry_fills_at_next_open_and_exits_wait_two_bars() {
        // Every bar from the entry on breaches the stop; the structural
        // same-bar guard must hold the position until bar 13.
        let mut candles: Vec<Candle> = (0..11).map(|i| flat(i * 1_000, 100.0)).collect();
        for i in 11..14 {
            candles.push(candle(i * 1_000, 100.0, 100.0, 80.0, 100.0));
        }
        let runner = BacktestRunner::new(zero_cost_config());
        let report = runner
            .run(&candles, &[(10, signal("BTCUSDT", Side::Long, 2.0))])
            .unwrap();

        assert_eq!(report.trades.len(), 1);
        let trade = &report.trades[0];
        assert_eq!(trade.entry_bar_index, Some(11));
        assert_eq!(trade.entry_time, 11_000);
        approx::assert_relative_eq!(trade.entry_price, 100.0);
        // Stop at 96 (2 ATR of 2.0) fires on bar 13, the first eligible bar.
        assert_eq!(trade.exit_time, 13_000);
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        approx::assert_relative_eq!(trade.exit_price, 96.0);
    }

    #[test]
    fn test_full_ladder_walk() {
        let candles = vec![
            flat(0, 100.0),
            flat(1_000, 100.0), // entry fill at 100
            flat(2_000, 100.0), // guard bar
            candle(3_000, 100.0, 103.0, 99.0, 102.0), // level 0
            candle(4_000, 102.0, 105.0, 102.0, 104.0), // level 1
            candle(5_000, 104.0, 108.0, 104.0, 107.0), // final level
        ];
        let runner = BacktestRunner::new(zero_cost_config());
        let report = runner
            .run(&candles, &[(0, signal("BTCUSDT", Side::Long, 2.0))])
            .unwrap();

        assert_eq!(report.trades.len(), 1);
        let trade = &report.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::TakeProfitFinal);
        assert_eq!(trade.partial_exits.len(), 2);
        approx::assert_relative_eq!(trade.partial_exits[0].price, 103.0);
        approx::assert_relative_eq!(trade.partial_exits[1].price, 105.0);
        // 0.4*3 + 0.3*5 + 0.3*8
        approx::assert_relative_eq!(trade.total_pnl, 5.1, epsilon = 1e-9);
        approx::assert_relative_eq!(report.final_equity, 10_005.1, epsilon = 1e-6);
        assert_eq!(report.equity_curve.len(), candles.len());
    }

    #[test]
    fn test_gap_candle_executes_levels_in_order() {
        let candles = vec![
            flat(0, 100.0),
            flat(1_000, 100.0),
            flat(2_000, 100.0),
            candle(3_000, 100.0, 106.0, 99.0, 106.0), // crosses levels 0 and 1
            flat(4_000, 106.0),
        ];
        let runner = BacktestRunner::new(zero_cost_config());
        let report = runner
            .run(&candles, &[(0, signal("BTCUSDT", Side::Long, 2.0))])
            .unwrap();

        let trade = &report.trades[0];
        assert_eq!(trade.partial_exits.len(), 2);
        assert_eq!(trade.partial_exits[0].level, 0);
        approx::assert_relative_eq!(trade.partial_exits[0].price, 103.0);
        assert_eq!(trade.partial_exits[1].level, 1);
        approx::assert_relative_eq!(trade.partial_exits[1].price, 105.0);
        assert_eq!(trade.partial_exits[0].ts_ms, trade.partial_exits[1].ts_ms);
    }

    #[test]
    fn test_stop_beats_target_when_bar_touches_both() {
        // Bar 3 spans 96 down to 90 and up to 104: adverse-first evaluation
        // books the stop, not the level-0 target.
        let candles = vec![
            flat(0, 100.0),
            flat(1_000, 100.0),
            flat(2_000, 100.0),
            candle(3_000, 100.0, 104.0, 90.0, 95.0),
        ];
        let runner = BacktestRunner::new(zero_cost_config());
        let report = runner
            .run(&candles, &[(0, signal("BTCUSDT", Side::Long, 2.0))])
            .unwrap();

        let trade = &report.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert!(trade.partial_exits.is_empty());
        approx::assert_relative_eq!(trade.exit_price, 96.0);
    }

    #[test]
    fn test_end_of_data_flattens_remaining() {
        let candles = vec![flat(0, 100.0), flat(1_000, 100.0), flat(2_000, 101.0)];
        let runner = BacktestRunner::new(zero_cost_config());
        let report = runner
            .run(&candles, &[(0, signal("BTCUSDT", Side::Long, 2.0))])
            .unwrap();

        assert_eq!(report.trades.len(), 1);
        let trade = &report.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::SignalExit);
        approx::assert_relative_eq!(trade.exit_price, 101.0);
        approx::assert_relative_eq!(report.final_equity, 10_001.0);
    }

    #[test]
    fn test_signal_on_final_candle_is_dropped() {
        let candles = vec![flat(0, 100.0), flat(1_000, 100.0)];
        let runner = BacktestRunner::new(zero_cost_config());
        let report = runner
            .run(&candles, &[(1, signal("BTCUSDT", Side::Long, 2.0))])
            .unwrap();
        assert!(report.trades.is_empty());
        approx::assert_relative_eq!(report.final_equity, 10_000.0);
    }

    #[test]
    fn test_entry_costs_applied_to_fill() {
        let config = BacktestConfig {
            costs: CostConfig { trading_fee_rate: 0.0005, slippage_rate: 0.0002 },
            ..zero_cost_config()
        };
        let candles = vec![flat(0, 100.0), flat(1_000, 100.0), flat(2_000, 100.0)];
        let runner = BacktestRunner::new(config);
        let report = runner
            .run(&candles, &[(0, signal("BTCUSDT", Side::Long, 2.0))])
            .unwrap();
        let trade = &report.trades[0];
        // Buys pay up by fee + slippage; the flat exit then sells below it.
        approx::assert_relative_eq!(trade.entry_price, 100.07);
        approx::assert_relative_eq!(trade.exit_price, 100.0 * (1.0 - 0.0007));
        assert!(trade.total_pnl < 0.0);
    }

    #[test]
    fn test_short_ladder_walk() {
        let candles = vec![
            flat(0, 100.0),
            flat(1_000, 100.0),
            flat(2_000, 100.0),
            candle(3_000, 100.0, 100.5, 97.0, 98.0), // level 0 at 97
            candle(4_000, 98.0, 98.0, 95.0, 95.5),   // level 1 at 95
            candle(5_000, 95.0, 95.0, 92.0, 92.5),   // final at 92
        ];
        let runner = BacktestRunner::new(zero_cost_config());
        let report = runner
            .run(&candles, &[(0, signal("BTCUSDT", Side::Short, 2.0))])
            .unwrap();

        let trade = &report.trades[0];
        assert_eq!(trade.side, Side::Short);
        assert_eq!(trade.exit_reason, ExitReason::TakeProfitFinal);
        approx::assert_relative_eq!(trade.total_pnl, 5.1, epsilon = 1e-9);
    }
}
