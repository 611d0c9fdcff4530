//! In-memory simulated brokerage.
//!
//! Fills every order instantly at the limit price plus a synthetic slippage
//! that scales inversely with the premium, so cheap options slip harder in
//! relative terms. Positions and margin are reconstructed from the recorded
//! fills, which lets the reconciler run end-to-end against this adapter.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use delta_desk_core::types::{
    BrokerKind, MarginInfo, NetPosition, Order, OrderStatus, Side,
};

use crate::adapter::{BrokerAdapter, OrderSnapshot};
use crate::error::ExecError;

const MIN_PREMIUM: f64 = 0.05;

pub struct SimBroker {
    slippage: Decimal,
    starting_margin: Decimal,
    orders: Mutex<HashMap<String, Order>>,
}

impl SimBroker {
    #[must_use]
    pub fn new(slippage: Decimal) -> Self {
        Self {
            slippage,
            starting_margin: Decimal::from(10_000_000),
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Limit price with synthetic slippage applied, rounded to the paisa.
    fn fill_price(&self, price: Decimal, side: Side) -> Decimal {
        let rate = price.to_f64().unwrap_or(MIN_PREMIUM).max(MIN_PREMIUM);
        let slip_points = self.slippage.to_f64().unwrap_or_default();
        let adjustment = if slip_points > 0.0 {
            rate * (rate.powf(1.0 / (rate.max(MIN_PREMIUM) * slip_points)) - 1.0).abs()
        } else {
            0.0
        };
        let filled = match side {
            Side::Buy => rate + adjustment,
            Side::Sell => (rate - adjustment).max(MIN_PREMIUM),
        };
        Decimal::from_f64(filled)
            .unwrap_or(price)
            .round_dp(2)
    }

    fn record(&self, order: Order) {
        let mut orders = self
            .orders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        orders.insert(order.order_id.clone(), order);
    }
}

#[async_trait]
impl BrokerAdapter for SimBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Sim
    }

    async fn place(
        &self,
        username: &str,
        tradingsymbol: &str,
        side: Side,
        quantity: u32,
        price: Decimal,
    ) -> Result<String, ExecError> {
        let order_id = Uuid::new_v4().to_string();
        let average_price = self.fill_price(price, side);
        debug!(
            username,
            tradingsymbol,
            %side,
            quantity,
            %price,
            %average_price,
            order_id,
            "Simulated fill"
        );
        self.record(Order {
            order_id: order_id.clone(),
            username: username.to_string(),
            tradingsymbol: tradingsymbol.to_string(),
            side,
            price,
            average_price,
            quantity,
            filled_quantity: quantity,
            pending_quantity: 0,
            cancelled_quantity: 0,
            status: OrderStatus::Complete,
            order_timestamp: Utc::now(),
        });
        Ok(order_id)
    }

    async fn order_status(
        &self,
        _username: &str,
        order_id: &str,
    ) -> Result<OrderSnapshot, ExecError> {
        let orders = self
            .orders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let order = orders
            .get(order_id)
            .ok_or_else(|| ExecError::UnknownOrder(order_id.to_string()))?;
        Ok(OrderSnapshot {
            status: order.status,
            filled_quantity: order.filled_quantity,
            pending_quantity: order.pending_quantity,
        })
    }

    async fn modify(
        &self,
        _username: &str,
        order_id: &str,
        _tradingsymbol: &str,
        _side: Side,
        _quantity: u32,
        _price: Decimal,
    ) -> Result<(), ExecError> {
        let orders = self
            .orders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if orders.contains_key(order_id) {
            Ok(())
        } else {
            Err(ExecError::UnknownOrder(order_id.to_string()))
        }
    }

    async fn positions(&self, usernames: &[String]) -> Result<Vec<NetPosition>, ExecError> {
        let orders = self
            .orders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut by_key: HashMap<(String, String), NetPosition> = HashMap::new();
        for order in orders.values() {
            if !usernames.iter().any(|u| u == &order.username) {
                continue;
            }
            let key = (order.username.clone(), order.tradingsymbol.clone());
            let entry = by_key.entry(key).or_insert_with(|| NetPosition {
                username: order.username.clone(),
                broker: BrokerKind::Sim,
                tradingsymbol: order.tradingsymbol.clone(),
                buy_qty: 0,
                sell_qty: 0,
                buy_value: Decimal::ZERO,
                sell_value: Decimal::ZERO,
                net_qty: 0,
            });
            let qty = i64::from(order.filled_quantity);
            let value = order.average_price * Decimal::from(order.filled_quantity);
            match order.side {
                Side::Buy => {
                    entry.buy_qty += qty;
                    entry.buy_value += value;
                }
                Side::Sell => {
                    entry.sell_qty += qty;
                    entry.sell_value += value;
                }
            }
            entry.net_qty = entry.buy_qty - entry.sell_qty;
        }
        Ok(by_key.into_values().collect())
    }

    async fn margin(&self, usernames: &[String]) -> Result<Vec<MarginInfo>, ExecError> {
        Ok(usernames
            .iter()
            .map(|username| MarginInfo {
                username: username.clone(),
                margin: self.starting_margin,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn fills_are_instant_and_slipped() {
        let broker = SimBroker::new(dec!(5));
        let id = broker
            .place("u1", "NIFTY24JUL22000CE", Side::Buy, 75, dec!(180))
            .await
            .unwrap();
        let snap = broker.order_status("u1", &id).await.unwrap();
        assert_eq!(snap.status, OrderStatus::Complete);
        assert_eq!(snap.filled_quantity, 75);

        let orders = broker.orders.lock().unwrap();
        let order = &orders[&id];
        assert!(order.average_price > dec!(180));
    }

    #[tokio::test]
    async fn sell_fill_never_goes_below_min_premium() {
        let broker = SimBroker::new(dec!(5));
        let id = broker
            .place("u1", "NIFTY24JUL26000CE", Side::Sell, 75, dec!(0.10))
            .await
            .unwrap();
        let orders = broker.orders.lock().unwrap();
        assert!(orders[&id].average_price >= dec!(0.05));
    }

    #[tokio::test]
    async fn positions_net_buys_against_sells() {
        let broker = SimBroker::new(dec!(0));
        broker
            .place("u1", "NIFTY24JUL22000PE", Side::Sell, 75, dec!(170))
            .await
            .unwrap();
        broker
            .place("u1", "NIFTY24JUL22000PE", Side::Buy, 25, dec!(171))
            .await
            .unwrap();

        let positions = broker
            .positions(&["u1".to_string()])
            .await
            .unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].net_qty, -50);
        assert_eq!(positions[0].sell_qty, 75);
    }

    #[tokio::test]
    async fn positions_filter_by_username() {
        let broker = SimBroker::new(dec!(0));
        broker
            .place("u1", "X", Side::Buy, 10, dec!(100))
            .await
            .unwrap();
        let positions = broker
            .positions(&["someone-else".to_string()])
            .await
            .unwrap();
        assert!(positions.is_empty());
    }
}
