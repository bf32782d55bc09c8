//! Deterministic backtesting for the ladder exit engine.
//!
//! The runner replays ordered candles against externally supplied entry
//! signals, drives the same `PositionManager` the live system uses, and
//! reports trades, an equity curve and aggregate metrics. Fills are
//! simulated without lookahead bias: next-open entries, bar-range clamping,
//! and always-unfavorable costs.

pub mod fill_sim;
pub mod metrics;
pub mod runner;

pub use fill_sim::{BarFill, FillSimulator};
pub use metrics::{BacktestMetrics, TpLevelMetrics};
pub use runner::{BacktestConfig, BacktestReport, BacktestRunner};
