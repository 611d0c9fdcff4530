//! Per-leg option strategy state machines.
//!
//! A deployment is resolved to a [`StrategyRunner`] at load time and driven
//! through entry, tick-aligned decision cycles, and final unwind. Decisions
//! read only the immutable snapshots and features published for the current
//! cycle; orders go through the execution engine.

pub mod engine;
pub mod error;
pub mod kind;
pub mod manual;
pub mod params;
pub mod select;
pub mod signal;
pub mod straddle;

pub use engine::DeltaStrangleEngine;
pub use error::StrategyError;
pub use kind::{StrategyKind, StrategyOps, StrategyRunner};
pub use params::{DayParams, ExitVariant, ProfileParams, StrategyOptions};
pub use signal::OneSideDecision;
pub use straddle::ShortStraddleEngine;
