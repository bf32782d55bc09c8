//! Portfolio-risk ledger.
//!
//! One task exclusively owns the session ledger; every other task talks to
//! it over an mpsc command channel, so reads and updates are serialized
//! without a lock. When session limits are breached the ledger broadcasts
//! the panic signal that shuts trading down.

use ladder_core::{Error, Result};
use ladder_risk::{PartialExitRecord, TradeRecord};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Broadcast when the session must flatten everything and stop.
#[derive(Debug, Clone)]
pub struct PanicSignal {
    pub reason: String,
}

/// Session-level loss limits.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    /// Consecutive losing trades before the session halts.
    pub max_consecutive_losses: u32,
    /// Realized session loss (in currency) before the session halts.
    pub max_session_loss: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self { max_consecutive_losses: 5, max_session_loss: 1_000.0 }
    }
}

/// Point-in-time view of the session ledger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerSummary {
    /// Realized PnL over completed trades. Partial exits are included in
    /// their trade's total when it closes, never counted twice.
    pub realized_pnl: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Partial-exit fills observed so far, across open and closed trades.
    pub partial_exits: usize,
    pub consecutive_losses: u32,
    /// True once a limit breach broadcast the panic signal.
    pub halted: bool,
}

enum LedgerCommand {
    RecordTrade(Box<TradeRecord>),
    RecordPartial(Box<PartialExitRecord>),
    Snapshot { reply: oneshot::Sender<LedgerSummary> },
}

/// Cheap cloneable handle to the ledger task.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<LedgerCommand>,
}

impl LedgerHandle {
    pub async fn record_trade(&self, trade: TradeRecord) -> Result<()> {
        self.tx
            .send(LedgerCommand::RecordTrade(Box::new(trade)))
            .await
            .map_err(|_| Error::position("ledger task is gone"))
    }

    pub async fn record_partial(&self, partial: PartialExitRecord) -> Result<()> {
        self.tx
            .send(LedgerCommand::RecordPartial(Box::new(partial)))
            .await
            .map_err(|_| Error::position("ledger task is gone"))
    }

    pub async fn snapshot(&self) -> Result<LedgerSummary> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LedgerCommand::Snapshot { reply })
            .await
            .map_err(|_| Error::position("ledger task is gone"))?;
        rx.await.map_err(|_| Error::position("ledger task is gone"))
    }
}

/// Start the ledger task. Dropping every handle shuts it down.
pub fn spawn_ledger(
    limits: RiskLimits,
    panic_tx: broadcast::Sender<PanicSignal>,
) -> (LedgerHandle, JoinHandle<LedgerSummary>) {
    let (tx, mut rx) = mpsc::channel(64);
    let task = tokio::spawn(async move {
        let mut summary = LedgerSummary::default();
        while let Some(command) = rx.recv().await {
            match command {
                LedgerCommand::RecordTrade(trade) => {
                    summary.total_trades += 1;
                    summary.realized_pnl += trade.total_pnl;
                    if trade.total_pnl > 0.0 {
                        summary.winning_trades += 1;
                        summary.consecutive_losses = 0;
                    } else if trade.total_pnl < 0.0 {
                        summary.losing_trades += 1;
                        summary.consecutive_losses += 1;
                    }
                    info!(
                        symbol = %trade.symbol,
                        reason = %trade.exit_reason,
                        pnl = trade.total_pnl,
                        session_pnl = summary.realized_pnl,
                        "trade recorded"
                    );
                    check_limits(&mut summary, &limits, &panic_tx);
                }
                LedgerCommand::RecordPartial(partial) => {
                    summary.partial_exits += 1;
                    info!(
                        symbol = %partial.symbol,
                        level = partial.level,
                        pnl = partial.realized_pnl,
                        "partial exit recorded"
                    );
                }
                LedgerCommand::Snapshot { reply } => {
                    let _ = reply.send(summary.clone());
                }
            }
        }
        summary
    });
    (LedgerHandle { tx }, task)
}

fn check_limits(
    summary: &mut LedgerSummary,
    limits: &RiskLimits,
    panic_tx: &broadcast::Sender<PanicSignal>,
) {
    if summary.halted {
        return;
    }
    let reason = if summary.consecutive_losses >= limits.max_consecutive_losses {
        Some(format!(
            "{} consecutive losing trades",
            summary.consecutive_losses
        ))
    } else if summary.realized_pnl <= -limits.max_session_loss {
        Some(format!("session loss {:.2} exceeds limit", -summary.realized_pnl))
    } else {
        None
    };
    if let Some(reason) = reason {
        summary.halted = true;
        error!(%reason, "risk limit breached; broadcasting panic close");
        // No receivers just means nothing is trading.
        let _ = panic_tx.send(PanicSignal { reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ladder_core::{ExitReason, Side};
    use rust_decimal_macros::dec;

    fn trade(pnl: f64) -> TradeRecord {
        TradeRecord {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_price: 100.0,
            entry_time: 0,
            exit_price: 100.0 + pnl,
            exit_time: 1_000,
            original_quantity: dec!(1.0),
            final_quantity: dec!(1.0),
            exit_reason: ExitReason::StopLoss,
            partial_exits: vec![],
            final_pnl: pnl,
            total_pnl: pnl,
            entry_bar_index: None,
        }
    }

    #[tokio::test]
    async fn test_ledger_accumulates_trades() {
        let (panic_tx, _panic_rx) = broadcast::channel(4);
        let (ledger, task) = spawn_ledger(RiskLimits::default(), panic_tx);

        ledger.record_trade(trade(5.0)).await.unwrap();
        ledger.record_trade(trade(-2.0)).await.unwrap();
        let summary = ledger.snapshot().await.unwrap();
        assert_eq!(summary.total_trades, 2);
        assert_eq!(summary.winning_trades, 1);
        assert_eq!(summary.losing_trades, 1);
        assert_eq!(summary.consecutive_losses, 1);
        approx::assert_relative_eq!(summary.realized_pnl, 3.0);
        assert!(!summary.halted);

        drop(ledger);
        let final_summary = task.await.unwrap();
        assert_eq!(final_summary.total_trades, 2);
    }

    #[tokio::test]
    async fn test_consecutive_losses_trigger_panic() {
        let (panic_tx, mut panic_rx) = broadcast::channel(4);
        let limits = RiskLimits { max_consecutive_losses: 2, max_session_loss: 1_000_000.0 };
        let (ledger, _task) = spawn_ledger(limits, panic_tx);

        ledger.record_trade(trade(-10.0)).await.unwrap();
        ledger.record_trade(trade(-10.0)).await.unwrap();

        let signal = panic_rx.recv().await.unwrap();
        assert!(signal.reason.contains("consecutive"));
        assert!(ledger.snapshot().await.unwrap().halted);
    }

    #[tokio::test]
    async fn test_win_resets_loss_streak() {
        let (panic_tx, mut panic_rx) = broadcast::channel(4);
        let limits = RiskLimits { max_consecutive_losses: 2, max_session_loss: 1_000_000.0 };
        let (ledger, _task) = spawn_ledger(limits, panic_tx);

        ledger.record_trade(trade(-10.0)).await.unwrap();
        ledger.record_trade(trade(5.0)).await.unwrap();
        ledger.record_trade(trade(-10.0)).await.unwrap();

        let summary = ledger.snapshot().await.unwrap();
        assert_eq!(summary.consecutive_losses, 1);
        assert!(!summary.halted);
        assert!(panic_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_loss_limit_triggers_panic() {
        let (panic_tx, mut panic_rx) = broadcast::channel(4);
        let limits = RiskLimits { max_consecutive_losses: 100, max_session_loss: 15.0 };
        let (ledger, _task) = spawn_ledger(limits, panic_tx);

        ledger.record_trade(trade(-20.0)).await.unwrap();
        let signal = panic_rx.recv().await.unwrap();
        assert!(signal.reason.contains("session loss"));
    }
}
