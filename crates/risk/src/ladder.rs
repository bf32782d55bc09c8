//! Stateless exit evaluation.
//!
//! `ExitLadder::evaluate` is a pure function from (position state, price,
//! ATR, config) to a single `ExitDecision`. It never mutates anything; the
//! `PositionManager` applies decisions and re-invokes evaluation iteratively
//! when one price update crosses several levels at once.

use ladder_core::{ExitConfig, ExitReason, Qty, Side, TimestampMs};

use crate::position::Position;

/// What should happen to a position at a given price.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitDecision {
    /// Nothing to do.
    NoAction,
    /// Ratchet the trailing stop to `new_stop`.
    TrailingUpdate { new_stop: f64 },
    /// Close `close_pct` of the original quantity at ladder level `level`.
    PartialClose { level: usize, close_pct: Qty, target_price: f64 },
    /// Close everything that remains.
    FullClose { reason: ExitReason, price: f64 },
}

/// Stateless evaluator for the position exit state machine.
pub struct ExitLadder;

impl ExitLadder {
    /// Evaluate one position at one price.
    ///
    /// Ordering is deliberate and load-bearing:
    /// 1. A breached stop always wins; stop protection takes precedence over
    ///    a take-profit reachable at the same price update.
    /// 2. Maximum hold time, closing at the current price.
    /// 3. Trailing-stop activation/ratchet.
    /// 4. The lowest-indexed unhit take-profit level; the final configured
    ///    level closes the whole remainder.
    pub fn evaluate(
        position: &Position,
        current_price: f64,
        atr: f64,
        ts_ms: TimestampMs,
        config: &ExitConfig,
    ) -> ExitDecision {
        if position.is_closed() {
            return ExitDecision::NoAction;
        }

        // 1. Stop check first. The stop only ever tightens, so a breach of
        // the current value is always a breach of the protection invariant.
        if position.stop_breached(current_price) {
            let reason = if position.trailing_active() {
                ExitReason::TrailingStop
            } else {
                ExitReason::StopLoss
            };
            return ExitDecision::FullClose { reason, price: position.current_stop_loss() };
        }

        // 2. Stale positions close at market once the hold budget is spent.
        if let Some(max_hold) = config.max_hold_time_ms {
            if ts_ms - position.entry_time() >= max_hold {
                return ExitDecision::FullClose {
                    reason: ExitReason::TimeBased,
                    price: current_price,
                };
            }
        }

        // 3. Trailing stop. Activates once unrealized profit covers the
        // configured number of ATRs; the candidate then follows price at a
        // fixed ATR distance and only replaces a looser stop.
        if atr > 0.0 {
            let activation_fraction =
                config.trailing_stop_activation_atr * atr / position.entry_price();
            if position.profit_fraction(current_price) >= activation_fraction {
                let distance = config.trailing_stop_atr_multiplier * atr;
                let candidate = match position.side() {
                    Side::Long => current_price - distance,
                    Side::Short => current_price + distance,
                };
                let tighter = match position.side() {
                    Side::Long => candidate > position.current_stop_loss(),
                    Side::Short => candidate < position.current_stop_loss(),
                };
                if tighter {
                    return ExitDecision::TrailingUpdate { new_stop: candidate };
                }
            }
        }

        // 4. Take-profit ladder: lowest unhit level whose target the price
        // has reached. Gap handling is the caller's job: it applies this
        // level and evaluates again within the same update cycle.
        if let Some((level, target)) = position
            .next_unhit_level()
            .and_then(|level| position.target_price(level).map(|target| (level, target)))
        {
            let reached = match position.side() {
                Side::Long => current_price >= target,
                Side::Short => current_price <= target,
            };
            if reached {
                if level == position.tp_levels().len() - 1 {
                    return ExitDecision::FullClose {
                        reason: ExitReason::TakeProfitFinal,
                        price: target,
                    };
                }
                return ExitDecision::PartialClose {
                    level,
                    close_pct: position.tp_levels()[level].close_pct,
                    target_price: target,
                };
            }
        }

        ExitDecision::NoAction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ladder_core::TpLevel;
    use rust_decimal_macros::dec;

    fn config() -> ExitConfig {
        ExitConfig {
            stop_loss_atr_multiplier: 3.0,
            trailing_stop_atr_multiplier: 1.5,
            trailing_stop_activation_atr: 1.0,
            tp_levels: vec![
                TpLevel { profit_pct: 0.03, close_pct: dec!(0.40) },
                TpLevel { profit_pct: 0.05, close_pct: dec!(0.30) },
                TpLevel { profit_pct: 0.08, close_pct: dec!(0.30) },
            ],
            min_order_size: dec!(0.001),
            max_hold_time_ms: None,
        }
    }

    fn long_position() -> Position {
        Position::new(
            "BTCUSDT".to_string(),
            Side::Long,
            100.0,
            1_000,
            dec!(1.0),
            94.0,
            config().tp_levels,
            2.0,
            None,
        )
    }

    #[test]
    fn test_no_action_in_quiet_range() {
        let pos = long_position();
        let decision = ExitLadder::evaluate(&pos, 100.5, 2.0, 2_000, &config());
        assert_eq!(decision, ExitDecision::NoAction);
    }

    #[test]
    fn test_initial_stop_hit() {
        let pos = long_position();
        let decision = ExitLadder::evaluate(&pos, 93.5, 2.0, 2_000, &config());
        assert_eq!(
            decision,
            ExitDecision::FullClose { reason: ExitReason::StopLoss, price: 94.0 }
        );
    }

    #[test]
    fn test_trailing_stop_reason_after_activation() {
        let mut pos = long_position();
        pos.trailing_active = true;
        pos.current_stop_loss = 100.5;
        let decision = ExitLadder::evaluate(&pos, 100.0, 2.0, 2_000, &config());
        assert_eq!(
            decision,
            ExitDecision::FullClose { reason: ExitReason::TrailingStop, price: 100.5 }
        );
    }

    #[test]
    fn test_stop_takes_precedence_over_take_profit() {
        // Stop ratcheted above a take-profit target: at a price breaching
        // the stop, the stop fires even though level 0 is also reachable.
        let mut pos = long_position();
        pos.trailing_active = true;
        pos.current_stop_loss = 103.5;
        let decision = ExitLadder::evaluate(&pos, 103.0, 2.0, 2_000, &config());
        assert_eq!(
            decision,
            ExitDecision::FullClose { reason: ExitReason::TrailingStop, price: 103.5 }
        );
    }

    #[test]
    fn test_trailing_not_active_before_threshold() {
        // Activation requires 1 ATR = 2.0 of profit, i.e. price >= 102.
        let pos = long_position();
        let decision = ExitLadder::evaluate(&pos, 101.5, 2.0, 2_000, &config());
        assert_eq!(decision, ExitDecision::NoAction);
    }

    #[test]
    fn test_trailing_update_once_activated() {
        let pos = long_position();
        let decision = ExitLadder::evaluate(&pos, 102.0, 2.0, 2_000, &config());
        match decision {
            ExitDecision::TrailingUpdate { new_stop } => {
                approx::assert_relative_eq!(new_stop, 99.0); // 102 - 1.5 * 2
            }
            other => panic!("expected trailing update, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_never_loosens() {
        let mut pos = long_position();
        pos.trailing_active = true;
        pos.current_stop_loss = 101.0;
        // Candidate would be 102.5 - 3.0 = 99.5, looser than 101.
        // Price has not breached the stop, so next in line is level 0 (103),
        // not reached at 102.5: no action.
        let decision = ExitLadder::evaluate(&pos, 102.5, 2.0, 2_000, &config());
        assert_eq!(decision, ExitDecision::NoAction);
    }

    #[test]
    fn test_partial_close_at_first_level() {
        let mut pos = long_position();
        // Keep the trailing candidate below the current stop so the ladder
        // decision is visible in one evaluation.
        pos.trailing_active = true;
        pos.current_stop_loss = 101.0;
        let decision = ExitLadder::evaluate(&pos, 103.0, 1.0, 2_000, &config());
        match decision {
            ExitDecision::PartialClose { level, close_pct, target_price } => {
                assert_eq!(level, 0);
                assert_eq!(close_pct, dec!(0.40));
                approx::assert_relative_eq!(target_price, 103.0);
            }
            other => panic!("expected partial close, got {:?}", other),
        }
    }

    #[test]
    fn test_final_level_is_full_close() {
        let mut pos = long_position();
        pos.tp_levels_hit = vec![0, 1];
        pos.remaining_quantity = dec!(0.3);
        pos.trailing_active = true;
        pos.current_stop_loss = 105.0;
        pos.partial_exits = vec![
            crate::position::PartialExit {
                level: 0,
                qty: dec!(0.4),
                price: 103.0,
                ts_ms: 0,
                realized_pnl: 1.2,
            },
            crate::position::PartialExit {
                level: 1,
                qty: dec!(0.3),
                price: 105.0,
                ts_ms: 0,
                realized_pnl: 1.5,
            },
        ];
        let decision = ExitLadder::evaluate(&pos, 108.0, 1.0, 2_000, &config());
        assert_eq!(
            decision,
            ExitDecision::FullClose { reason: ExitReason::TakeProfitFinal, price: 108.0 }
        );
    }

    #[test]
    fn test_max_hold_time_closes_at_market() {
        let mut config = config();
        config.max_hold_time_ms = Some(60_000);
        let pos = long_position();

        // Inside the hold budget: nothing happens at a quiet price.
        let decision = ExitLadder::evaluate(&pos, 100.5, 2.0, 31_000, &config);
        assert_eq!(decision, ExitDecision::NoAction);

        // Budget spent (entry at 1_000): close at the current price.
        let decision = ExitLadder::evaluate(&pos, 100.5, 2.0, 61_000, &config);
        assert_eq!(
            decision,
            ExitDecision::FullClose { reason: ExitReason::TimeBased, price: 100.5 }
        );
    }

    #[test]
    fn test_stop_takes_precedence_over_time_exit() {
        let mut config = config();
        config.max_hold_time_ms = Some(60_000);
        let pos = long_position();

        let decision = ExitLadder::evaluate(&pos, 93.0, 2.0, 120_000, &config);
        assert_eq!(
            decision,
            ExitDecision::FullClose { reason: ExitReason::StopLoss, price: 94.0 }
        );
    }

    #[test]
    fn test_short_side_mirrors() {
        let mut pos = long_position();
        pos.side = Side::Short;
        pos.current_stop_loss = 106.0;

        // Stop above entry for a short.
        let decision = ExitLadder::evaluate(&pos, 106.5, 2.0, 2_000, &config());
        assert_eq!(
            decision,
            ExitDecision::FullClose { reason: ExitReason::StopLoss, price: 106.0 }
        );

        // Level 0 target is below entry.
        pos.trailing_active = true;
        pos.current_stop_loss = 99.0;
        let decision = ExitLadder::evaluate(&pos, 97.0, 1.0, 2_000, &config());
        match decision {
            ExitDecision::PartialClose { level, target_price, .. } => {
                assert_eq!(level, 0);
                approx::assert_relative_eq!(target_price, 97.0);
            }
            other => panic!("expected partial close, got {:?}", other),
        }
    }
}
