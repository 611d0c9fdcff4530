use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrategyError {
    /// Thin option chain: no strike satisfies the query this cycle.
    #[error("no strike found for {0}")]
    StrikeNotFound(String),

    /// Non-finite or missing signal features; skip the cycle's transition.
    #[error("signal not usable this cycle")]
    SignalUnusable,

    #[error("instrument {0} missing from the latest snapshot")]
    MissingInstrument(String),

    #[error("bad strategy parameters: {0}")]
    BadParams(String),
}
