//! Chase-to-fill order protocol.
//!
//! An order is placed at the current quote plus/minus the slippage allowance
//! and then chased: while it rests unfilled the pending remainder is repriced
//! against the latest traded price each poll interval, until the brokerage
//! reports a terminal state. Brokerage throttling is absorbed with a fixed
//! backoff and a bounded retry count.

use std::future::Future;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use delta_desk_core::types::{OrderStatus, Side};
use delta_desk_core::{ExecutionConfig, StateStore};

use crate::adapter::BrokerAdapter;
use crate::error::ExecError;

/// One order to be chased to completion.
#[derive(Debug, Clone)]
pub struct ChaseRequest {
    pub username: String,
    pub underlying: String,
    pub tradingsymbol: String,
    pub partition: String,
    pub side: Side,
    pub quantity: u32,
    /// Initial limit price.
    pub price: Decimal,
    /// Price past which the chase stops repricing (buy: cap, sell: floor).
    pub worst_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct ChaseOutcome {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: u32,
}

/// Runs one brokerage call, absorbing rate limits with a fixed backoff.
///
/// Gives up with `ExecError::RateLimited` after the configured retry budget.
async fn with_backoff<T, F, Fut>(cfg: &ExecutionConfig, mut call: F) -> Result<T, ExecError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExecError>>,
{
    let mut attempts = 0;
    loop {
        match call().await {
            Err(ExecError::RateLimited) if attempts < cfg.max_rate_limit_retries => {
                attempts += 1;
                debug!(attempts, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(cfg.rate_limit_backoff_ms)).await;
            }
            other => return other,
        }
    }
}

/// Next chase price for the pending remainder.
fn chase_price(
    side: Side,
    ltp: Decimal,
    slippage: Decimal,
    floor: Decimal,
    worst: Option<Decimal>,
) -> Decimal {
    let raw = match side {
        Side::Buy => ltp + slippage,
        Side::Sell => (ltp - slippage).max(floor),
    };
    match (side, worst) {
        (Side::Buy, Some(cap)) => raw.min(cap),
        (Side::Sell, Some(bound)) => raw.max(bound),
        _ => raw,
    }
}

/// Places `req` and chases it until the brokerage reports a terminal state.
///
/// # Errors
///
/// Returns an error when the placement itself fails or the retry budget for
/// throttled calls is exhausted. A rejected or cancelled order is not an
/// error here; the terminal status is reported in the outcome for the caller
/// to act on.
pub async fn chase_order(
    adapter: &dyn BrokerAdapter,
    store: &StateStore,
    cfg: &ExecutionConfig,
    req: &ChaseRequest,
) -> Result<ChaseOutcome, ExecError> {
    let order_id = with_backoff(cfg, || {
        adapter.place(
            &req.username,
            &req.tradingsymbol,
            req.side,
            req.quantity,
            req.price,
        )
    })
    .await?;

    debug!(
        username = req.username,
        tradingsymbol = req.tradingsymbol,
        side = %req.side,
        quantity = req.quantity,
        price = %req.price,
        order_id,
        "Order placed, chasing"
    );

    let mut last_price = req.price;
    loop {
        let snap = with_backoff(cfg, || adapter.order_status(&req.username, &order_id)).await?;
        if snap.status.is_terminal() {
            if snap.status != OrderStatus::Complete {
                warn!(
                    username = req.username,
                    tradingsymbol = req.tradingsymbol,
                    order_id,
                    status = ?snap.status,
                    "Order ended without a full fill"
                );
            }
            return Ok(ChaseOutcome {
                order_id,
                status: snap.status,
                filled_quantity: snap.filled_quantity,
            });
        }

        tokio::time::sleep(Duration::from_millis(cfg.chase_poll_ms)).await;

        if let Some(ltp) =
            store.option_ltp(&req.underlying, &req.tradingsymbol, &req.partition)
        {
            last_price = chase_price(
                req.side,
                ltp,
                cfg.slippage,
                cfg.price_floor,
                req.worst_price,
            );
        }

        let pending = snap.pending_quantity.max(1);
        let price = last_price;
        let modify = with_backoff(cfg, || {
            adapter.modify(
                &req.username,
                &order_id,
                &req.tradingsymbol,
                req.side,
                pending,
                price,
            )
        })
        .await;
        if let Err(e) = modify {
            // The order may have gone terminal between poll and modify.
            debug!(order_id, error = %e, "Modify failed, re-polling");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use delta_desk_core::types::{BrokerKind, MarginInfo, NetPosition};
    use crate::adapter::OrderSnapshot;

    /// Fails the first `fail_places` placements with a rate limit, then
    /// fills instantly. Open polls before completion are configurable.
    struct ScriptedAdapter {
        fail_places: u32,
        open_polls: u32,
        place_attempts: AtomicU32,
        polls: AtomicU32,
        modify_prices: Mutex<Vec<Decimal>>,
        quantity: u32,
    }

    impl ScriptedAdapter {
        fn new(fail_places: u32, open_polls: u32, quantity: u32) -> Self {
            Self {
                fail_places,
                open_polls,
                place_attempts: AtomicU32::new(0),
                polls: AtomicU32::new(0),
                modify_prices: Mutex::new(Vec::new()),
                quantity,
            }
        }
    }

    #[async_trait]
    impl BrokerAdapter for ScriptedAdapter {
        fn kind(&self) -> BrokerKind {
            BrokerKind::Sim
        }

        async fn place(
            &self,
            _username: &str,
            _tradingsymbol: &str,
            _side: Side,
            _quantity: u32,
            _price: Decimal,
        ) -> Result<String, ExecError> {
            let n = self.place_attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_places {
                Err(ExecError::RateLimited)
            } else {
                Ok("ORD-1".to_string())
            }
        }

        async fn order_status(
            &self,
            _username: &str,
            _order_id: &str,
        ) -> Result<OrderSnapshot, ExecError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.open_polls {
                Ok(OrderSnapshot {
                    status: OrderStatus::Open,
                    filled_quantity: 0,
                    pending_quantity: self.quantity,
                })
            } else {
                Ok(OrderSnapshot {
                    status: OrderStatus::Complete,
                    filled_quantity: self.quantity,
                    pending_quantity: 0,
                })
            }
        }

        async fn modify(
            &self,
            _username: &str,
            _order_id: &str,
            _tradingsymbol: &str,
            _side: Side,
            _quantity: u32,
            price: Decimal,
        ) -> Result<(), ExecError> {
            self.modify_prices.lock().unwrap().push(price);
            Ok(())
        }

        async fn positions(&self, _usernames: &[String]) -> Result<Vec<NetPosition>, ExecError> {
            Ok(vec![])
        }

        async fn margin(&self, _usernames: &[String]) -> Result<Vec<MarginInfo>, ExecError> {
            Ok(vec![])
        }
    }

    fn fast_cfg() -> ExecutionConfig {
        ExecutionConfig {
            slippage: dec!(5),
            chase_poll_ms: 1,
            rate_limit_backoff_ms: 1,
            max_rate_limit_retries: 5,
            price_floor: dec!(0.05),
        }
    }

    fn request() -> ChaseRequest {
        ChaseRequest {
            username: "u1".to_string(),
            underlying: "NIFTY".to_string(),
            tradingsymbol: "NIFTY24JUL22000CE".to_string(),
            partition: "1".to_string(),
            side: Side::Buy,
            quantity: 75,
            price: dec!(185),
            worst_price: None,
        }
    }

    #[tokio::test]
    async fn throttled_placement_retries_then_fills() {
        let adapter = ScriptedAdapter::new(3, 0, 75);
        let store = StateStore::new();

        let outcome = chase_order(&adapter, &store, &fast_cfg(), &request())
            .await
            .unwrap();

        assert_eq!(outcome.status, OrderStatus::Complete);
        assert_eq!(outcome.filled_quantity, 75);
        assert_eq!(adapter.place_attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_is_an_error() {
        let adapter = ScriptedAdapter::new(10, 0, 75);
        let store = StateStore::new();

        let result = chase_order(&adapter, &store, &fast_cfg(), &request()).await;
        assert!(matches!(result, Err(ExecError::RateLimited)));
    }

    #[tokio::test]
    async fn resting_order_is_repriced_before_fill() {
        let adapter = ScriptedAdapter::new(0, 2, 75);
        let store = StateStore::new();
        store.set(
            &delta_desk_core::keys::greeks_instruments("NIFTY", "1"),
            &serde_json::json!([]),
        );

        let outcome = chase_order(&adapter, &store, &fast_cfg(), &request())
            .await
            .unwrap();
        assert_eq!(outcome.status, OrderStatus::Complete);
        // No quote in the store, so the chase keeps the original price.
        let prices = adapter.modify_prices.lock().unwrap();
        assert_eq!(prices.len(), 2);
        assert!(prices.iter().all(|p| *p == dec!(185)));
    }

    #[test]
    fn chase_price_respects_floor_and_worst() {
        assert_eq!(
            chase_price(Side::Buy, dec!(100), dec!(5), dec!(0.05), None),
            dec!(105)
        );
        assert_eq!(
            chase_price(Side::Sell, dec!(3), dec!(5), dec!(0.05), None),
            dec!(0.05)
        );
        assert_eq!(
            chase_price(Side::Buy, dec!(100), dec!(5), dec!(0.05), Some(dec!(102))),
            dec!(102)
        );
        assert_eq!(
            chase_price(Side::Sell, dec!(100), dec!(5), dec!(0.05), Some(dec!(98))),
            dec!(98)
        );
    }
}
