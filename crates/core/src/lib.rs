pub mod clock;
pub mod config;
pub mod config_loader;
pub mod secrets;
pub mod split;
pub mod store;
pub mod types;

pub use config::{
    AnalyticsConfig, AppConfig, BrokerConfig, ExecutionConfig, MarketConfig, ReconcileConfig,
};
pub use config_loader::ConfigLoader;
pub use secrets::SecretBox;
pub use split::{divide_lots, split_quantity};
pub use store::{keys, StateStore};
pub use types::{
    BrokerKind, Deployment, DeploymentLifecycle, DeploymentState, Greeks, InstrumentSnapshot,
    LegState, MarginInfo, NetPosition, Order, OrderIntent, OrderStatus, ParameterProfile, Side,
    UserAllocation,
};
