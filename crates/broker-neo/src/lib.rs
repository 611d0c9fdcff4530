//! Kotak Neo brokerage adapter.
//!
//! One adapter instance holds a session per account and speaks the Neo quick
//! order gateway: form posts with a `jData` JSON field, numeric values
//! returned as strings, and per-shard `sId` routing.

pub mod client;
pub mod session;

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::warn;

use delta_desk_core::types::{BrokerKind, MarginInfo, NetPosition, OrderStatus, Side};
use delta_desk_core::BrokerConfig;
use delta_desk_execution::{BrokerAdapter, ExecError, OrderSnapshot};

pub use client::NeoClient;
pub use session::{NeoSession, SealedSession};

const PLACE_PATH: &str = "/Orders/2.0/quick/order/rule/ms/place";
const MODIFY_PATH: &str = "/Orders/2.0/quick/order/vr/modify";
const HISTORY_PATH: &str = "/Orders/2.0/quick/order/history";
const POSITIONS_PATH: &str = "/Orders/2.0/quick/user/positions";
const LIMITS_PATH: &str = "/Orders/2.0/quick/user/limits";

pub struct NeoBroker {
    client: NeoClient,
    sessions: HashMap<String, NeoSession>,
}

impl NeoBroker {
    #[must_use]
    pub fn new(cfg: &BrokerConfig) -> Self {
        Self {
            client: NeoClient::new(cfg.neo_base_url.clone(), cfg.neo_requests_per_sec),
            sessions: HashMap::new(),
        }
    }

    pub fn add_session(&mut self, session: NeoSession) {
        self.sessions.insert(session.username.clone(), session);
    }

    fn session(&self, username: &str) -> Result<&NeoSession, ExecError> {
        self.sessions
            .get(username)
            .ok_or_else(|| ExecError::NoSession(username.to_string()))
    }
}

fn side_code(side: Side) -> &'static str {
    match side {
        Side::Buy => "B",
        Side::Sell => "S",
    }
}

fn place_payload(tradingsymbol: &str, side: Side, quantity: u32, price: Decimal) -> Value {
    json!({
        "am": "NO",
        "dq": "0",
        "es": "nse_fo",
        "mp": "0",
        "pc": "NRML",
        "pf": "N",
        "pr": price.to_string(),
        "pt": "L",
        "qt": quantity.to_string(),
        "rt": "DAY",
        "tp": "0",
        "ts": tradingsymbol,
        "tt": side_code(side),
    })
}

fn modify_payload(
    order_id: &str,
    tradingsymbol: &str,
    side: Side,
    quantity: u32,
    price: Decimal,
) -> Value {
    json!({
        "no": order_id,
        "ts": tradingsymbol,
        "qt": quantity.to_string(),
        "pr": price.to_string(),
        "tt": side_code(side),
        "pt": "L",
        "pc": "NRML",
        "es": "nse_fo",
        "vd": "DAY",
    })
}

/// Neo reports order state as a lowercase phrase.
fn map_status(raw: &str) -> OrderStatus {
    match raw.trim().to_lowercase().as_str() {
        "complete" => OrderStatus::Complete,
        "rejected" => OrderStatus::Rejected,
        "cancelled" | "cancelled for amo order" => OrderStatus::Cancelled,
        "partially filled" | "partial" => OrderStatus::PartiallyFilled,
        _ => OrderStatus::Open,
    }
}

/// Numeric fields arrive either as JSON numbers or as strings.
fn field_i64(row: &Value, key: &str) -> i64 {
    match row.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn field_decimal(row: &Value, key: &str) -> Decimal {
    match row.get(key) {
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(rust_decimal::prelude::FromPrimitive::from_f64)
            .unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => Decimal::ZERO,
    }
}

fn field_str<'a>(row: &'a Value, key: &str) -> &'a str {
    row.get(key).and_then(Value::as_str).unwrap_or_default()
}

#[async_trait]
impl BrokerAdapter for NeoBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Neo
    }

    async fn place(
        &self,
        username: &str,
        tradingsymbol: &str,
        side: Side,
        quantity: u32,
        price: Decimal,
    ) -> Result<String, ExecError> {
        let session = self.session(username)?;
        let payload = place_payload(tradingsymbol, side, quantity, price);
        let response = self.client.form_post(PLACE_PATH, session, &payload).await?;

        if let Some(order_id) = response.get("nOrdNo").and_then(Value::as_str) {
            return Ok(order_id.to_string());
        }
        let message = response
            .get("errMsg")
            .or_else(|| response.get("emsg"))
            .and_then(Value::as_str)
            .unwrap_or("order not accepted");
        Err(ExecError::Rejected(message.to_string()))
    }

    async fn order_status(
        &self,
        username: &str,
        order_id: &str,
    ) -> Result<OrderSnapshot, ExecError> {
        let session = self.session(username)?;
        let payload = json!({ "nOrdNo": order_id });
        let response = self
            .client
            .form_post(HISTORY_PATH, session, &payload)
            .await?;

        // History rows arrive newest first.
        let latest = response
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .ok_or_else(|| ExecError::UnknownOrder(order_id.to_string()))?;

        let quantity = field_i64(latest, "qty");
        let filled = field_i64(latest, "fldQty");
        Ok(OrderSnapshot {
            status: map_status(field_str(latest, "ordSt")),
            filled_quantity: u32::try_from(filled.max(0)).unwrap_or(0),
            pending_quantity: u32::try_from((quantity - filled).max(0)).unwrap_or(0),
        })
    }

    async fn modify(
        &self,
        username: &str,
        order_id: &str,
        tradingsymbol: &str,
        side: Side,
        quantity: u32,
        price: Decimal,
    ) -> Result<(), ExecError> {
        let session = self.session(username)?;
        let payload = modify_payload(order_id, tradingsymbol, side, quantity, price);
        let response = self
            .client
            .form_post(MODIFY_PATH, session, &payload)
            .await?;

        if response.get("nOrdNo").is_some() {
            Ok(())
        } else {
            let message = field_str(&response, "errMsg");
            Err(ExecError::Rejected(message.to_string()))
        }
    }

    async fn positions(&self, usernames: &[String]) -> Result<Vec<NetPosition>, ExecError> {
        let mut all = Vec::new();
        for username in usernames {
            let session = self.session(username)?;
            let response = self
                .client
                .form_post(POSITIONS_PATH, session, &json!({}))
                .await?;
            let Some(rows) = response.get("data").and_then(Value::as_array) else {
                warn!(username, "Positions response had no data rows");
                continue;
            };
            for row in rows {
                let buy_qty = field_i64(row, "flBuyQty") + field_i64(row, "cfBuyQty");
                let sell_qty = field_i64(row, "flSellQty") + field_i64(row, "cfSellQty");
                all.push(NetPosition {
                    username: username.clone(),
                    broker: BrokerKind::Neo,
                    tradingsymbol: field_str(row, "trdSym").to_string(),
                    buy_qty,
                    sell_qty,
                    buy_value: field_decimal(row, "buyAmt"),
                    sell_value: field_decimal(row, "sellAmt"),
                    net_qty: buy_qty - sell_qty,
                });
            }
        }
        Ok(all)
    }

    async fn margin(&self, usernames: &[String]) -> Result<Vec<MarginInfo>, ExecError> {
        let payload = json!({ "seg": "ALL", "exch": "ALL", "prod": "ALL" });
        let mut all = Vec::new();
        for username in usernames {
            let session = self.session(username)?;
            let response = self
                .client
                .form_post(LIMITS_PATH, session, &payload)
                .await?;
            all.push(MarginInfo {
                username: username.clone(),
                margin: field_decimal(&response, "Net"),
            });
        }
        Ok(all)
    }
}
