//! Domain types shared across the workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Option contract right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "CE"),
            Self::Put => write!(f, "PE"),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Greeks computed for one instrument in one tick cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub sigma: f64,
    pub delta: f64,
    pub theta: f64,
    pub gamma: f64,
    pub vega: f64,
}

/// One option contract as seen in the latest tick cycle.
///
/// Snapshots are immutable once published: the analytics engine replaces the
/// whole per-partition set each cycle instead of mutating rows in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub tradingsymbol: String,
    pub underlying: String,
    pub strike: Decimal,
    pub option_type: OptionType,
    pub expiry: DateTime<Utc>,
    pub tick_size: Decimal,
    pub lot_size: u32,
    pub max_order_size: u32,
    pub last_price: Decimal,
    pub oi: i64,
    pub exchange_timestamp: DateTime<Utc>,
    /// Data-feed partition this row was sourced from.
    pub partition: String,
    /// Spot price of the underlying at snapshot time (set by analytics).
    pub spot_price: Decimal,
    /// Time to expiry in years (set by analytics).
    pub time_left_years: f64,
    /// Computed greeks, `None` until the analytics cycle has run.
    pub greeks: Option<Greeks>,
}

impl InstrumentSnapshot {
    /// Delta, or 0.0 while greeks are not yet computed.
    #[must_use]
    pub fn delta(&self) -> f64 {
        self.greeks.map_or(0.0, |g| g.delta)
    }

    /// Implied volatility, or 0.0 while greeks are not yet computed.
    #[must_use]
    pub fn sigma(&self) -> f64 {
        self.greeks.map_or(0.0, |g| g.sigma)
    }
}

/// Supported brokerages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// In-memory simulated brokerage for internal accounts.
    Sim,
    /// HTTP brokerage adapter.
    Neo,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sim => write!(f, "sim"),
            Self::Neo => write!(f, "neo"),
        }
    }
}

/// One named, independently activatable parameter set (a leg group).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterProfile {
    pub name: String,
    /// Free-form per-strategy parameters, decoded by the strategy crate.
    pub params: serde_json::Value,
}

/// A configured strategy instance, read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: u32,
    pub name: String,
    pub underlying: String,
    pub lot_size: u32,
    /// Strategy kind tag resolved to a `StrategyKind` at load time.
    pub strategy_kind: String,
    /// Side taken on entry; exits use the opposite side.
    pub entry_side: Side,
    pub broker: BrokerKind,
    pub slippage: Decimal,
    /// Free-form strategy options (timing windows, delta thresholds, ...).
    pub options: serde_json::Value,
    /// Ordered active parameter profiles.
    pub profiles: Vec<ParameterProfile>,
    /// Data-feed partitions this deployment subscribes to.
    pub partitions: Vec<String>,
    pub is_active: bool,
    pub hedge_deployment: Option<u32>,
}

impl Deployment {
    /// Position direction derived from the entry side: short = -1, long = +1.
    #[must_use]
    pub const fn position_direction(&self) -> i64 {
        match self.entry_side {
            Side::Sell => -1,
            Side::Buy => 1,
        }
    }
}

/// Per-deployment, per-user quantity allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAllocation {
    pub username: String,
    pub broker: BrokerKind,
    pub alternate_broker: Option<BrokerKind>,
    pub lots: u32,
    /// One quantity (in contract units) per parameter profile; sums to
    /// `lots * lot_size`.
    pub quantity_multiples: Vec<u32>,
}

impl UserAllocation {
    /// Recomputes the per-profile quantities with the largest-remainder split.
    pub fn rebalance(&mut self, profile_count: usize, lot_size: u32) {
        self.quantity_multiples = crate::split::divide_lots(profile_count, self.lots)
            .into_iter()
            .map(|l| l * lot_size)
            .collect();
    }
}

/// Lifecycle of a deployed strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentLifecycle {
    Inactive,
    Entering,
    Active,
    Exiting,
}

/// Runtime registry entry for one deployment, kept in the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub lifecycle: DeploymentLifecycle,
    pub users: Vec<UserAllocation>,
    pub profile_count: usize,
}

/// Live state of one leg group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegState {
    pub ce_tradingsymbol: Option<String>,
    pub pe_tradingsymbol: Option<String>,
    pub exited_one_side: bool,
    pub ce_exit_one_side: bool,
    pub pe_exit_one_side: bool,
    /// Short = -1, long = +1.
    pub position_type: i64,
    pub partition: String,
    pub label: String,
}

impl LegState {
    #[must_use]
    pub fn entered(partition: &str, label: &str, position_type: i64) -> Self {
        Self {
            ce_tradingsymbol: None,
            pe_tradingsymbol: None,
            exited_one_side: false,
            ce_exit_one_side: false,
            pe_exit_one_side: false,
            position_type,
            partition: partition.to_string(),
            label: label.to_string(),
        }
    }
}

/// Ephemeral unit of work handed to the execution engine; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub tradingsymbol: String,
    pub partition: String,
    /// Index of the leg group this intent belongs to.
    pub leg_index: usize,
    /// Human-readable reason tag, e.g. "EXIT CE - SHIFTING CALL AWAY".
    pub reason: String,
}

impl OrderIntent {
    #[must_use]
    pub fn new(row: &InstrumentSnapshot, leg_index: usize, reason: &str) -> Self {
        Self {
            tradingsymbol: row.tradingsymbol.clone(),
            partition: row.partition.clone(),
            leg_index,
            reason: reason.to_string(),
        }
    }
}

/// Brokerage-side order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Rejected,
    Cancelled,
    Complete,
}

impl OrderStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Cancelled | Self::Complete)
    }
}

/// Brokerage-side order record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub username: String,
    pub tradingsymbol: String,
    pub side: Side,
    pub price: Decimal,
    pub average_price: Decimal,
    pub quantity: u32,
    pub filled_quantity: u32,
    pub pending_quantity: u32,
    pub cancelled_quantity: u32,
    pub status: OrderStatus,
    pub order_timestamp: DateTime<Utc>,
}

/// Per-user per-symbol net position, rebuilt from the brokerage's live feed
/// each reconciliation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetPosition {
    pub username: String,
    pub broker: BrokerKind,
    pub tradingsymbol: String,
    pub buy_qty: i64,
    pub sell_qty: i64,
    pub buy_value: Decimal,
    pub sell_value: Decimal,
    pub net_qty: i64,
}

/// Per-user available margin as reported by the brokerage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginInfo {
    pub username: String,
    pub margin: Decimal,
}
