use async_trait::async_trait;
use rust_decimal::Decimal;

use delta_desk_core::types::{BrokerKind, MarginInfo, NetPosition, OrderStatus, Side};

use crate::error::ExecError;

/// Point-in-time view of one working order at the brokerage.
#[derive(Debug, Clone, Copy)]
pub struct OrderSnapshot {
    pub status: OrderStatus,
    pub filled_quantity: u32,
    pub pending_quantity: u32,
}

/// Brokerage-facing operations needed by the chase engine and reconciler.
///
/// One adapter instance serves every account on that brokerage; calls carry
/// the username so the adapter can pick the right session.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn kind(&self) -> BrokerKind;

    /// Places a limit order, returning the brokerage order id.
    async fn place(
        &self,
        username: &str,
        tradingsymbol: &str,
        side: Side,
        quantity: u32,
        price: Decimal,
    ) -> Result<String, ExecError>;

    async fn order_status(
        &self,
        username: &str,
        order_id: &str,
    ) -> Result<OrderSnapshot, ExecError>;

    /// Reprices the pending remainder of a working order.
    async fn modify(
        &self,
        username: &str,
        order_id: &str,
        tradingsymbol: &str,
        side: Side,
        quantity: u32,
        price: Decimal,
    ) -> Result<(), ExecError>;

    /// Net positions for the given accounts.
    async fn positions(&self, usernames: &[String]) -> Result<Vec<NetPosition>, ExecError>;

    /// Available margin for the given accounts.
    async fn margin(&self, usernames: &[String]) -> Result<Vec<MarginInfo>, ExecError>;
}
