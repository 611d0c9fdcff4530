pub mod greeks;
pub mod oi_signal;
pub mod snapshot;

pub use greeks::{bs_price, implied_volatility, option_greeks};
pub use oi_signal::{signal_features, window_features, OiSample, WindowFeatures};
pub use snapshot::AnalyticsEngine;
