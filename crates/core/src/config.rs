use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub market: MarketConfig,
    pub analytics: AnalyticsConfig,
    pub execution: ExecutionConfig,
    pub reconcile: ReconcileConfig,
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    pub underlying: String,
    /// Data-feed partitions the deployment set subscribes to.
    pub partitions: Vec<String>,
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// Decision/tick cycle length in seconds.
    pub tick_cadence_secs: u64,
    /// Strike spacing of the option chain, used to locate the ATM strike.
    pub strike_step: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub risk_free_rate: f64,
    /// Lookback windows for OI-change features, in tick-cycle units.
    pub oi_windows: Vec<usize>,
    /// Maximum retained OI history rows.
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Default slippage allowance in price points.
    pub slippage: Decimal,
    pub chase_poll_ms: u64,
    pub rate_limit_backoff_ms: u64,
    pub max_rate_limit_retries: u32,
    /// Exchange minimum limit price.
    pub price_floor: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub neo_base_url: String,
    pub neo_requests_per_sec: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            market: MarketConfig {
                underlying: "NIFTY".to_string(),
                partitions: vec!["1".to_string()],
                open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
                close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
                tick_cadence_secs: 5,
                strike_step: Decimal::from(50),
            },
            analytics: AnalyticsConfig {
                risk_free_rate: 0.10,
                oi_windows: vec![12, 72, 144],
                history_limit: 5000,
            },
            execution: ExecutionConfig {
                slippage: Decimal::from(5),
                chase_poll_ms: 250,
                rate_limit_backoff_ms: 250,
                max_rate_limit_retries: 20,
                price_floor: Decimal::new(5, 2),
            },
            reconcile: ReconcileConfig { interval_secs: 30 },
            broker: BrokerConfig {
                neo_base_url: "https://gw-napi.kotaksecurities.com".to_string(),
                neo_requests_per_sec: 10,
            },
        }
    }
}
