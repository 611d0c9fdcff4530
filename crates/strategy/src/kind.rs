//! Closed strategy dispatch.
//!
//! Deployment rows carry a plain string tag; resolving it to a variant at
//! load time means an unknown tag fails the deployment up front instead of
//! surfacing mid-session.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use delta_desk_core::types::{Deployment, UserAllocation};
use delta_desk_core::StateStore;
use delta_desk_execution::ExecutionEngine;

use crate::engine::DeltaStrangleEngine;
use crate::error::StrategyError;
use crate::straddle::ShortStraddleEngine;

/// The operations every strategy kind exposes. Object-safe so outer surfaces
/// can hold strategies behind one seam.
#[async_trait]
pub trait StrategyOps: Send + Sync {
    async fn place_entry(&self) -> Result<()>;
    async fn place_exit(&self) -> Result<()>;
    async fn users_entry(&self, joining: Vec<UserAllocation>) -> Result<()>;
    async fn users_exit(&self, usernames: &[String]) -> Result<()>;
    async fn run(&self) -> Result<()>;
}

#[async_trait]
impl StrategyOps for DeltaStrangleEngine {
    async fn place_entry(&self) -> Result<()> {
        DeltaStrangleEngine::place_entry(self).await
    }

    async fn place_exit(&self) -> Result<()> {
        DeltaStrangleEngine::place_exit(self).await
    }

    async fn users_entry(&self, joining: Vec<UserAllocation>) -> Result<()> {
        DeltaStrangleEngine::users_entry(self, joining).await
    }

    async fn users_exit(&self, usernames: &[String]) -> Result<()> {
        DeltaStrangleEngine::users_exit(self, usernames).await
    }

    async fn run(&self) -> Result<()> {
        DeltaStrangleEngine::run(self).await
    }
}

#[async_trait]
impl StrategyOps for ShortStraddleEngine {
    async fn place_entry(&self) -> Result<()> {
        ShortStraddleEngine::place_entry(self).await
    }

    async fn place_exit(&self) -> Result<()> {
        ShortStraddleEngine::place_exit(self).await
    }

    async fn users_entry(&self, joining: Vec<UserAllocation>) -> Result<()> {
        ShortStraddleEngine::users_entry(self, joining).await
    }

    async fn users_exit(&self, usernames: &[String]) -> Result<()> {
        ShortStraddleEngine::users_exit(self, usernames).await
    }

    async fn run(&self) -> Result<()> {
        ShortStraddleEngine::run(self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    DeltaStrangle,
    ShortStraddle,
}

impl StrategyKind {
    /// # Errors
    ///
    /// Returns `BadParams` for an unknown tag.
    pub fn from_tag(tag: &str) -> Result<Self, StrategyError> {
        match tag {
            "delta_strangle" => Ok(Self::DeltaStrangle),
            "short_straddle" => Ok(Self::ShortStraddle),
            other => Err(StrategyError::BadParams(format!(
                "unknown strategy kind '{other}'"
            ))),
        }
    }
}

/// One running strategy instance, dispatched by kind.
pub enum StrategyRunner {
    DeltaStrangle(DeltaStrangleEngine),
    ShortStraddle(ShortStraddleEngine),
}

impl StrategyRunner {
    /// # Errors
    ///
    /// Returns `BadParams` when the kind tag is unknown or the deployment's
    /// options do not decode for that kind.
    pub fn build(
        store: StateStore,
        exec: Arc<ExecutionEngine>,
        deployment: Deployment,
    ) -> Result<Self, StrategyError> {
        match StrategyKind::from_tag(&deployment.strategy_kind)? {
            StrategyKind::DeltaStrangle => Ok(Self::DeltaStrangle(DeltaStrangleEngine::new(
                store, exec, deployment,
            )?)),
            StrategyKind::ShortStraddle => Ok(Self::ShortStraddle(ShortStraddleEngine::new(
                store, exec, deployment,
            )?)),
        }
    }

    #[must_use]
    pub fn deployment_id(&self) -> u32 {
        match self {
            Self::DeltaStrangle(e) => e.deployment_id(),
            Self::ShortStraddle(e) => e.deployment_id(),
        }
    }

    /// Drives the strategy from entry to final unwind.
    ///
    /// # Errors
    ///
    /// Propagates entry, cycle dispatch, and exit failures.
    pub async fn run(&self) -> Result<()> {
        match self {
            Self::DeltaStrangle(e) => e.run().await,
            Self::ShortStraddle(e) => e.run().await,
        }
    }

    /// # Errors
    ///
    /// Propagates unwind dispatch failures.
    pub async fn place_exit(&self) -> Result<()> {
        match self {
            Self::DeltaStrangle(e) => e.place_exit().await,
            Self::ShortStraddle(e) => e.place_exit().await,
        }
    }

    /// # Errors
    ///
    /// Propagates order dispatch failures for the joining users.
    pub async fn users_entry(&self, joining: Vec<UserAllocation>) -> Result<()> {
        match self {
            Self::DeltaStrangle(e) => e.users_entry(joining).await,
            Self::ShortStraddle(e) => e.users_entry(joining).await,
        }
    }

    /// # Errors
    ///
    /// Propagates order dispatch failures for the leaving users.
    pub async fn users_exit(&self, usernames: &[String]) -> Result<()> {
        match self {
            Self::DeltaStrangle(e) => e.users_exit(usernames).await,
            Self::ShortStraddle(e) => e.users_exit(usernames).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_resolve() {
        assert_eq!(
            StrategyKind::from_tag("delta_strangle").unwrap(),
            StrategyKind::DeltaStrangle
        );
        assert_eq!(
            StrategyKind::from_tag("short_straddle").unwrap(),
            StrategyKind::ShortStraddle
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            StrategyKind::from_tag("iron_condor"),
            Err(StrategyError::BadParams(_))
        ));
    }
}
