//! Per-symbol position monitoring.
//!
//! Each traded symbol gets one task that exclusively owns that symbol's
//! `PositionManager`. Price ticks arrive on a watch channel (only the
//! latest matters), commands on an mpsc channel, and the panic signal on a
//! broadcast channel. Close orders go through the pending-close protocol:
//! quantity is reserved before dispatch and reconciled against the
//! confirmed fill, so a slow exchange can never cause a double close.

use std::sync::Arc;

use ladder_core::{ExitConfig, ExitReason, Qty, Side, TimestampMs};
use ladder_risk::{ExitDecision, ExitEvent, PositionManager, PositionSnapshot};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::executor::{place_close_with_retry, OrderGateway, RetryPolicy};
use crate::ledger::{LedgerHandle, PanicSignal};

/// Latest market observation for one symbol.
#[derive(Debug, Clone)]
pub struct PriceTick {
    pub ts_ms: TimestampMs,
    pub price: f64,
    pub atr: f64,
}

/// Commands accepted by a symbol monitor.
pub enum MonitorCommand {
    /// A confirmed entry fill: start managing the position.
    Open {
        side: Side,
        entry_price: f64,
        entry_time: TimestampMs,
        quantity: Qty,
        atr: f64,
    },
    /// The strategy wants out at market, e.g. an exit signal or a regime
    /// flip against the position.
    ForceExit { reason: ExitReason, price: f64, ts_ms: TimestampMs },
    /// Read-only view of the monitored position.
    Snapshot { reply: oneshot::Sender<Option<PositionSnapshot>> },
}

/// Monitor tuning for one symbol.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub exit: ExitConfig,
    pub retry: RetryPolicy,
}

/// Handle to a running symbol monitor.
pub struct MonitorHandle {
    commands: mpsc::Sender<MonitorCommand>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn send(&self, command: MonitorCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub async fn snapshot(&self) -> Option<PositionSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(MonitorCommand::Snapshot { reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Close the command channel and wait for the task to drain.
    pub async fn shutdown(self) {
        drop(self.commands);
        let _ = self.task.await;
    }
}

/// Spawn the monitor task for one symbol.
pub fn spawn_symbol_monitor(
    symbol: String,
    config: MonitorConfig,
    gateway: Arc<dyn OrderGateway>,
    price_rx: watch::Receiver<PriceTick>,
    panic_rx: broadcast::Receiver<PanicSignal>,
    ledger: LedgerHandle,
) -> MonitorHandle {
    let (commands, cmd_rx) = mpsc::channel(16);
    let last_tick = price_rx.borrow().clone();
    let monitor = Monitor {
        symbol,
        manager: PositionManager::new(config.exit),
        retry: config.retry,
        gateway,
        ledger,
        last_tick,
        halted: false,
    };
    let task = tokio::spawn(monitor.run(price_rx, panic_rx, cmd_rx));
    MonitorHandle { commands, task }
}

struct Monitor {
    symbol: String,
    manager: PositionManager,
    retry: RetryPolicy,
    gateway: Arc<dyn OrderGateway>,
    ledger: LedgerHandle,
    last_tick: PriceTick,
    halted: bool,
}

impl Monitor {
    async fn run(
        mut self,
        mut price_rx: watch::Receiver<PriceTick>,
        mut panic_rx: broadcast::Receiver<PanicSignal>,
        mut cmd_rx: mpsc::Receiver<MonitorCommand>,
    ) {
        loop {
            tokio::select! {
                changed = price_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let tick = price_rx.borrow_and_update().clone();
                    self.on_tick(tick).await;
                }
                signal = panic_rx.recv() => {
                    match signal {
                        Ok(signal) => self.on_panic(&signal).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(command) => self.on_command(command).await,
                        None => break,
                    }
                }
            }
        }
        debug!(symbol = %self.symbol, "monitor shut down");
    }

    async fn on_tick(&mut self, tick: PriceTick) {
        self.last_tick = tick.clone();
        if self.halted {
            return;
        }
        // A single tick can cross several triggers (trailing ratchet plus a
        // level, or a jump over two levels); settle the ladder before the
        // next tick is observed.
        let max_steps = 2 * self.manager.config().tp_levels.len() + 4;
        for _ in 0..max_steps {
            if self
                .manager
                .position(&self.symbol)
                .map_or(true, |p| p.pending_failure())
            {
                return;
            }
            let Some(decision) =
                self.manager.evaluate(&self.symbol, tick.price, tick.atr, tick.ts_ms)
            else {
                return;
            };
            match decision {
                ExitDecision::NoAction => return,
                ExitDecision::TrailingUpdate { .. } => {
                    if let Err(err) =
                        self.manager
                            .apply(&self.symbol, decision, tick.price, tick.ts_ms)
                    {
                        error!(symbol = %self.symbol, %err, "trailing update failed");
                        return;
                    }
                }
                decision @ (ExitDecision::PartialClose { .. }
                | ExitDecision::FullClose { .. }) => {
                    if !self.dispatch(decision, tick.ts_ms).await {
                        return;
                    }
                }
            }
        }
    }

    async fn on_panic(&mut self, signal: &PanicSignal) {
        info!(symbol = %self.symbol, reason = %signal.reason, "panic close requested");
        self.halted = true;
        let Some(position) = self.manager.position(&self.symbol) else { return };
        if position.pending_failure() {
            error!(
                symbol = %self.symbol,
                "panic close blocked: position already in failed state"
            );
            return;
        }
        let decision = ExitDecision::FullClose {
            reason: ExitReason::Panic,
            price: self.last_tick.price,
        };
        self.dispatch(decision, self.last_tick.ts_ms).await;
    }

    async fn on_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Open { side, entry_price, entry_time, quantity, atr } => {
                if self.halted {
                    warn!(symbol = %self.symbol, "entry ignored: monitor is halted");
                    return;
                }
                if let Err(err) = self.manager.open(
                    &self.symbol,
                    side,
                    entry_price,
                    entry_time,
                    quantity,
                    atr,
                    None,
                ) {
                    error!(symbol = %self.symbol, %err, "failed to open position");
                }
            }
            MonitorCommand::ForceExit { reason, price, ts_ms } => {
                if self.manager.has_position(&self.symbol) {
                    let decision = ExitDecision::FullClose { reason, price };
                    self.dispatch(decision, ts_ms).await;
                }
            }
            MonitorCommand::Snapshot { reply } => {
                let _ = reply.send(self.manager.position(&self.symbol).map(|p| p.snapshot()));
            }
        }
    }

    /// Reserve quantity, dispatch the order, reconcile the outcome.
    ///
    /// Returns false when the ladder must stop advancing for this tick
    /// (nothing to do, or the close failed and the position is flagged).
    async fn dispatch(&mut self, decision: ExitDecision, ts_ms: TimestampMs) -> bool {
        let intent = match self.manager.begin_close(&self.symbol, &decision, ts_ms) {
            Ok(Some(intent)) => intent,
            // Skipped below-minimum level: state advanced, keep evaluating.
            Ok(None) => return true,
            Err(err) => {
                error!(symbol = %self.symbol, %err, "failed to reserve close quantity");
                return false;
            }
        };
        match place_close_with_retry(self.gateway.as_ref(), &intent, &self.retry).await {
            Ok(fill) => {
                match self
                    .manager
                    .confirm_close(&self.symbol, fill.price, fill.fee, fill.ts_ms)
                {
                    Ok(ExitEvent::Partial(partial)) => {
                        if let Err(err) = self.ledger.record_partial(partial).await {
                            error!(symbol = %self.symbol, %err, "ledger unreachable");
                        }
                        true
                    }
                    Ok(ExitEvent::Closed(trade)) => {
                        if let Err(err) = self.ledger.record_trade(trade).await {
                            error!(symbol = %self.symbol, %err, "ledger unreachable");
                        }
                        false
                    }
                    Err(err) => {
                        error!(symbol = %self.symbol, %err, "close confirmation failed");
                        false
                    }
                }
            }
            Err(err) => {
                error!(symbol = %self.symbol, %err, "close dispatch failed; aborting");
                if let Err(err) = self.manager.abort_close(&self.symbol) {
                    error!(symbol = %self.symbol, %err, "abort failed");
                }
                false
            }
        }
    }
}
