//! Live-mode concurrency for the ladder exit engine.
//!
//! Three kinds of tasks cooperate:
//! - one monitor per symbol, exclusively owning that symbol's positions
//!   and driving the pending-close protocol,
//! - the order dispatch path with bounded retry and backoff,
//! - a single ledger task owning session risk state, which broadcasts the
//!   panic signal when limits are breached.
//!
//! Communication is by channel only: `watch` for prices, `mpsc` for
//! commands and ledger records, `broadcast` for panic.

pub mod executor;
pub mod ledger;
pub mod monitor;

pub use executor::{place_close_with_retry, OrderGateway, RetryPolicy};
pub use ledger::{spawn_ledger, LedgerHandle, LedgerSummary, PanicSignal, RiskLimits};
pub use monitor::{
    spawn_symbol_monitor, MonitorCommand, MonitorConfig, MonitorHandle, PriceTick,
};
