//! Performance metrics over a completed backtest.
//!
//! One trade means one full position lifecycle: the partial exits along the
//! way are folded into that trade's `total_pnl`, never counted as separate
//! trades. Win/loss classification uses the lifecycle total.

use ladder_risk::TradeRecord;
use serde::{Deserialize, Serialize};

/// Per-take-profit-level hit statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpLevelMetrics {
    /// Ladder level index.
    pub level: usize,
    /// Trades in which this level produced a fill.
    pub hit_count: usize,
    /// `hit_count / total_trades`.
    pub hit_rate: f64,
    /// Realized PnL summed over every fill at this level.
    pub total_profit: f64,
    /// `total_profit / hit_count`.
    pub avg_profit: f64,
}

/// Aggregate backtest performance report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// `winning_trades / total_trades`; 0 with no trades.
    pub win_rate: f64,
    pub total_pnl: f64,
    /// `total_pnl / initial_capital`.
    pub roi: f64,
    /// Largest peak-to-trough decline of the equity curve, in currency.
    pub max_drawdown: f64,
    /// Gross profit over gross loss. `+inf` when there are profits and no
    /// losses; 0 when there are neither.
    pub profit_factor: f64,
    /// Mean over standard deviation of per-trade PnL; 0 when the deviation
    /// is 0.
    pub sharpe_ratio: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Mean holding time per trade in milliseconds.
    pub avg_duration_ms: f64,
    /// Hit statistics per configured take-profit level.
    pub tp_levels: Vec<TpLevelMetrics>,
}

impl BacktestMetrics {
    pub fn compute(trades: &[TradeRecord], equity_curve: &[f64], initial_capital: f64) -> Self {
        let total_trades = trades.len();
        let winning: Vec<f64> = trades
            .iter()
            .map(|t| t.total_pnl)
            .filter(|p| *p > 0.0)
            .collect();
        let losing: Vec<f64> = trades
            .iter()
            .map(|t| t.total_pnl)
            .filter(|p| *p < 0.0)
            .collect();

        let total_pnl: f64 = trades.iter().map(|t| t.total_pnl).sum();
        let gross_profit: f64 = winning.iter().sum();
        let gross_loss: f64 = -losing.iter().sum::<f64>();

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let win_rate = if total_trades > 0 {
            winning.len() as f64 / total_trades as f64
        } else {
            0.0
        };

        let avg_win = if winning.is_empty() {
            0.0
        } else {
            gross_profit / winning.len() as f64
        };
        let avg_loss = if losing.is_empty() {
            0.0
        } else {
            -gross_loss / losing.len() as f64
        };
        let largest_win = winning.iter().copied().fold(0.0, f64::max);
        let largest_loss = losing.iter().copied().fold(0.0, f64::min);

        let avg_duration_ms = if total_trades > 0 {
            trades
                .iter()
                .map(|t| (t.exit_time - t.entry_time) as f64)
                .sum::<f64>()
                / total_trades as f64
        } else {
            0.0
        };

        let roi = if initial_capital > 0.0 {
            total_pnl / initial_capital
        } else {
            0.0
        };

        Self {
            total_trades,
            winning_trades: winning.len(),
            losing_trades: losing.len(),
            win_rate,
            total_pnl,
            roi,
            max_drawdown: max_drawdown(equity_curve),
            profit_factor,
            sharpe_ratio: sharpe(trades),
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            avg_duration_ms,
            tp_levels: tp_level_metrics(trades),
        }
    }
}

/// Largest peak-to-trough decline over the equity curve.
fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0f64;
    for &value in equity_curve {
        peak = peak.max(value);
        worst = worst.max(peak - value);
    }
    worst
}

/// Mean over population standard deviation of per-trade PnL.
fn sharpe(trades: &[TradeRecord]) -> f64 {
    if trades.len() < 2 {
        return 0.0;
    }
    let n = trades.len() as f64;
    let mean = trades.iter().map(|t| t.total_pnl).sum::<f64>() / n;
    let variance = trades
        .iter()
        .map(|t| (t.total_pnl - mean).powi(2))
        .sum::<f64>()
        / n;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        0.0
    } else {
        mean / stddev
    }
}

/// Which ladder levels actually paid, and how much.
fn tp_level_metrics(trades: &[TradeRecord]) -> Vec<TpLevelMetrics> {
    let max_level = trades
        .iter()
        .flat_map(|t| t.partial_exits.iter().map(|p| p.level))
        .max();
    let Some(max_level) = max_level else { return Vec::new() };

    (0..=max_level)
        .map(|level| {
            let mut hit_count = 0usize;
            let mut total_profit = 0.0f64;
            for trade in trades {
                let fills: Vec<_> =
                    trade.partial_exits.iter().filter(|p| p.level == level).collect();
                if !fills.is_empty() {
                    hit_count += 1;
                    total_profit += fills.iter().map(|p| p.realized_pnl).sum::<f64>();
                }
            }
            TpLevelMetrics {
                level,
                hit_count,
                hit_rate: if trades.is_empty() {
                    0.0
                } else {
                    hit_count as f64 / trades.len() as f64
                },
                total_profit,
                avg_profit: if hit_count > 0 {
                    total_profit / hit_count as f64
                } else {
                    0.0
                },
            }
        })
        .collect()
}
