//! Order dispatch with retry.
//!
//! The gateway is the only exchange-facing seam in the system. It is async
//! so no network call ever blocks a monitor loop; everything above it works
//! with confirmed fills.

use std::time::Duration;

use async_trait::async_trait;
use ladder_core::{Error, Fill, Qty, Result, Side};
use ladder_risk::CloseIntent;
use tracing::{error, warn};

/// Exchange-facing order interface.
///
/// Close orders are reduce-only: they can shrink a position but never flip
/// it. Implementations return the confirmed fill.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_close_order(&self, symbol: &str, order_side: Side, qty: Qty) -> Result<Fill>;
}

/// Retry schedule for close-order dispatch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` (1-based): doubles each time.
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Dispatch a close order, retrying transient failures.
///
/// Exhausting the schedule returns an error; the caller must then run
/// `abort_close` so the reserved quantity is not lost.
pub async fn place_close_with_retry(
    gateway: &dyn OrderGateway,
    intent: &CloseIntent,
    policy: &RetryPolicy,
) -> Result<Fill> {
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match gateway
            .place_close_order(&intent.symbol, intent.order_side, intent.qty)
            .await
        {
            Ok(fill) => return Ok(fill),
            Err(err) => {
                warn!(
                    symbol = %intent.symbol,
                    qty = %intent.qty,
                    attempt,
                    max_attempts = policy.max_attempts,
                    %err,
                    "close order attempt failed"
                );
                last_error = Some(err);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
        }
    }
    let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
    error!(
        symbol = %intent.symbol,
        qty = %intent.qty,
        attempts = policy.max_attempts,
        "close order failed after all retries"
    );
    Err(Error::execution(format!(
        "{}: close order failed after {} attempts: {detail}",
        intent.symbol, policy.max_attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ladder_risk::PendingKind;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyGateway {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl OrderGateway for FlakyGateway {
        async fn place_close_order(
            &self,
            _symbol: &str,
            side: Side,
            qty: Qty,
        ) -> Result<Fill> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(Error::execution("exchange unavailable"))
            } else {
                Ok(Fill { ts_ms: 1_000, price: 103.0, qty, side, fee: 0.05 })
            }
        }
    }

    fn intent() -> CloseIntent {
        CloseIntent {
            symbol: "BTCUSDT".to_string(),
            order_side: Side::Short,
            qty: dec!(0.4),
            kind: PendingKind::Partial { level: 0 },
            nominal_price: 103.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let gateway = FlakyGateway { calls: AtomicU32::new(0), fail_first: 2 };
        let fill = place_close_with_retry(&gateway, &intent(), &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(fill.qty, dec!(0.4));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_returns_error() {
        let gateway = FlakyGateway { calls: AtomicU32::new(0), fail_first: u32::MAX };
        let err = place_close_with_retry(&gateway, &intent(), &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles() {
        let policy = RetryPolicy { max_attempts: 4, base_delay: Duration::from_secs(1) };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }
}
