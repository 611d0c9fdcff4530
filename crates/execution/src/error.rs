use thiserror::Error;

/// Errors surfaced by brokerage adapters and the chase engine.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The brokerage throttled the request; callers back off and retry.
    #[error("rate limited by brokerage")]
    RateLimited,

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("order not found: {0}")]
    UnknownOrder(String),

    #[error("no active session for {0}")]
    NoSession(String),

    #[error("transport error: {0}")]
    Transport(String),
}
