//! Plain short straddle: both legs at the at-the-money strike, no shifting
//! and no open-interest signals, held until stop loss or exit time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{error, info, warn};

use delta_desk_core::clock;
use delta_desk_core::store::keys;
use delta_desk_core::types::{
    Deployment, DeploymentLifecycle, InstrumentSnapshot, LegState, OptionType, OrderIntent, Side,
    UserAllocation,
};
use delta_desk_core::StateStore;
use delta_desk_execution::ExecutionEngine;

use crate::error::StrategyError;
use crate::select;

const STRIKE_RETRY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct StraddleOptions {
    pub entry_time: NaiveTime,
    pub exit_time: NaiveTime,
    /// Decision cadence in seconds.
    pub sleep_time: u64,
}

pub struct ShortStraddleEngine {
    store: StateStore,
    exec: Arc<ExecutionEngine>,
    deployment: Deployment,
    options: StraddleOptions,
}

impl ShortStraddleEngine {
    /// # Errors
    ///
    /// Returns `BadParams` when the options do not decode or the deployment
    /// subscribes to no feed partition.
    pub fn new(
        store: StateStore,
        exec: Arc<ExecutionEngine>,
        deployment: Deployment,
    ) -> Result<Self, StrategyError> {
        if deployment.partitions.is_empty() {
            return Err(StrategyError::BadParams(format!(
                "deployment {} has no feed partitions",
                deployment.id
            )));
        }
        let options: StraddleOptions = serde_json::from_value(deployment.options.clone())
            .map_err(|e| StrategyError::BadParams(format!("deployment {}: {e}", deployment.id)))?;
        Ok(Self {
            store,
            exec,
            deployment,
            options,
        })
    }

    #[must_use]
    pub fn deployment_id(&self) -> u32 {
        self.deployment.id
    }

    fn chain(&self) -> Vec<InstrumentSnapshot> {
        self.store
            .instruments(&self.deployment.underlying, &self.deployment.partitions)
    }

    /// The straddle pair: call nearest to spot and the put at the same strike.
    fn atm_pair<'a>(
        &self,
        chain: &'a [InstrumentSnapshot],
        spot: Decimal,
    ) -> Option<(&'a InstrumentSnapshot, &'a InstrumentSnapshot)> {
        let ce = chain
            .iter()
            .filter(|r| r.option_type == OptionType::Call)
            .min_by_key(|r| (r.strike - spot).abs())?;
        let pe = select::row_at(chain, ce.strike, OptionType::Put)?;
        Some((ce, pe))
    }

    fn registry_users(&self) -> Vec<UserAllocation> {
        self.store
            .deployments()
            .get(&self.deployment.id.to_string())
            .map(|s| s.users.clone())
            .unwrap_or_default()
    }

    async fn dispatch(&self, closes: Vec<OrderIntent>, opens: Vec<OrderIntent>) -> Result<()> {
        if closes.is_empty() && opens.is_empty() {
            return Ok(());
        }
        let users = self.registry_users();
        let (buys, sells) = match self.deployment.entry_side {
            Side::Sell => (closes, opens),
            Side::Buy => (opens, closes),
        };
        self.exec
            .place_batch(&self.deployment.underlying, &users, &buys, &sells)
            .await?;
        if let Err(e) = self.exec.refresh_broker_state(self.deployment.broker).await {
            warn!(deployment = self.deployment.id, error = %e, "Position refresh failed");
        }
        Ok(())
    }

    /// Sells (or buys) the straddle once per parameter profile at the
    /// at-the-money strike, retrying while the chain is thin.
    ///
    /// # Errors
    ///
    /// Returns an error when dispatch fails outright.
    pub async fn place_entry(&self) -> Result<()> {
        let id = self.deployment.id;
        self.store.update_deployments(|registry| {
            if let Some(state) = registry.get_mut(&id.to_string()) {
                state.lifecycle = DeploymentLifecycle::Entering;
            }
        });

        loop {
            let chain = self.chain();
            let spot = self
                .store
                .spot(&self.deployment.underlying)
                .context("no spot price published")?;
            let Some((ce, pe)) = self.atm_pair(&chain, spot) else {
                warn!(deployment = id, "Straddle strike not found, retrying");
                tokio::time::sleep(STRIKE_RETRY).await;
                continue;
            };

            let mut legs = Vec::with_capacity(self.deployment.profiles.len());
            let mut opens = Vec::new();
            for (idx, profile) in self.deployment.profiles.iter().enumerate() {
                opens.extend([
                    OrderIntent::new(pe, idx, "ENTERING PE"),
                    OrderIntent::new(ce, idx, "ENTERING CE"),
                ]);
                let mut leg = LegState::entered(
                    &ce.partition,
                    &profile.name,
                    self.deployment.position_direction(),
                );
                leg.ce_tradingsymbol = Some(ce.tradingsymbol.clone());
                leg.pe_tradingsymbol = Some(pe.tradingsymbol.clone());
                legs.push(leg);
            }
            let entry_premium =
                (ce.last_price + pe.last_price) * Decimal::from(legs.len() as u64);

            self.store.set_legs(id, &legs);
            self.store.set(&keys::entry_premium(id), &entry_premium);
            self.dispatch(Vec::new(), opens).await?;
            self.store.update_deployments(|registry| {
                if let Some(state) = registry.get_mut(&id.to_string()) {
                    state.lifecycle = DeploymentLifecycle::Active;
                }
            });
            info!(deployment = id, strike = %ce.strike, "Straddle entered");
            return Ok(());
        }
    }

    /// # Errors
    ///
    /// Returns an error when the unwind orders fail to dispatch.
    pub async fn place_exit(&self) -> Result<()> {
        let id = self.deployment.id;
        self.store.update_deployments(|registry| {
            if let Some(state) = registry.get_mut(&id.to_string()) {
                state.lifecycle = DeploymentLifecycle::Exiting;
            }
        });

        let chain = self.chain();
        let mut closes = Vec::new();
        for (idx, leg) in self.store.legs(id).iter().enumerate() {
            for symbol in [leg.ce_tradingsymbol.as_deref(), leg.pe_tradingsymbol.as_deref()]
                .into_iter()
                .flatten()
            {
                match select::row_by_symbol(&chain, symbol) {
                    Some(row) => closes.push(OrderIntent::new(row, idx, "EXIT - EXIT ALGO")),
                    None => error!(deployment = id, leg = idx, symbol, "Exit row missing"),
                }
            }
        }

        let users = self.registry_users();
        let (buys, sells) = match self.deployment.entry_side {
            Side::Sell => (closes, Vec::new()),
            Side::Buy => (Vec::new(), closes),
        };
        let outcome = self
            .exec
            .place_batch(&self.deployment.underlying, &users, &buys, &sells)
            .await;

        self.store.delete(&keys::legs(id));
        self.store.delete(&keys::entry_premium(id));
        self.store.update_deployments(|registry| {
            registry.remove(&id.to_string());
        });
        info!(deployment = id, "Straddle exited");
        outcome
    }

    fn stop_loss_breached(&self, chain: &[InstrumentSnapshot]) -> bool {
        let stop: Decimal = self
            .store
            .get(&keys::stop_loss(self.deployment.id))
            .unwrap_or_default();
        if stop <= Decimal::ZERO {
            return false;
        }
        let entry: Decimal = self
            .store
            .get(&keys::entry_premium(self.deployment.id))
            .unwrap_or_default();
        let current: Decimal = self
            .store
            .legs(self.deployment.id)
            .iter()
            .flat_map(|leg| {
                [leg.ce_tradingsymbol.as_deref(), leg.pe_tradingsymbol.as_deref()]
            })
            .flatten()
            .filter_map(|symbol| select::row_by_symbol(chain, symbol))
            .map(|row| row.last_price)
            .sum();
        let points = if self.deployment.position_direction() < 0 {
            entry - current
        } else {
            current - entry
        };
        points + stop <= Decimal::ZERO
    }

    /// Holds the straddle until exit time, a stop-loss breach, or removal
    /// from the active registry.
    ///
    /// # Errors
    ///
    /// Propagates entry and exit dispatch failures.
    pub async fn run(&self) -> Result<()> {
        let exit_at = clock::today_at(self.options.exit_time);
        clock::sleep_until(clock::today_at(self.options.entry_time)).await;

        if self.store.legs(self.deployment.id).is_empty() {
            self.place_entry().await?;
        }
        clock::sleep_until_aligned(self.options.sleep_time).await;

        loop {
            if clock::now() >= exit_at || !self.store.deployment_running(self.deployment.id) {
                break;
            }
            if self.stop_loss_breached(&self.chain()) {
                warn!(deployment = self.deployment.id, "Stop loss breached");
                break;
            }
            clock::sleep_until_aligned(self.options.sleep_time).await;
        }

        self.place_exit().await
    }

    /// # Errors
    ///
    /// Fails when the joining orders do not complete.
    pub async fn users_entry(&self, mut joining: Vec<UserAllocation>) -> Result<()> {
        let id = self.deployment.id;
        let existing = self.registry_users();
        joining.retain(|u| !existing.iter().any(|e| e.username == u.username));
        if joining.is_empty() {
            return Ok(());
        }
        for user in &mut joining {
            user.rebalance(self.deployment.profiles.len(), self.deployment.lot_size);
        }

        let opens = self.open_leg_intents();
        let (buys, sells) = match self.deployment.entry_side {
            Side::Sell => (Vec::new(), opens),
            Side::Buy => (opens, Vec::new()),
        };
        self.exec
            .place_batch(&self.deployment.underlying, &joining, &buys, &sells)
            .await?;

        self.store.update_deployments(|registry| {
            if let Some(state) = registry.get_mut(&id.to_string()) {
                state.users.extend(joining.clone());
            }
        });
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when the unwinding orders do not complete.
    pub async fn users_exit(&self, usernames: &[String]) -> Result<()> {
        let id = self.deployment.id;
        let leaving: Vec<UserAllocation> = self
            .registry_users()
            .into_iter()
            .filter(|u| usernames.contains(&u.username))
            .collect();
        if leaving.is_empty() {
            return Ok(());
        }

        let closes = self.open_leg_intents();
        let (buys, sells) = match self.deployment.entry_side {
            Side::Sell => (closes, Vec::new()),
            Side::Buy => (Vec::new(), closes),
        };
        self.exec
            .place_batch(&self.deployment.underlying, &leaving, &buys, &sells)
            .await?;

        self.store.update_deployments(|registry| {
            if let Some(state) = registry.get_mut(&id.to_string()) {
                state.users.retain(|u| !usernames.contains(&u.username));
            }
        });
        Ok(())
    }

    fn open_leg_intents(&self) -> Vec<OrderIntent> {
        let chain = self.chain();
        let mut intents = Vec::new();
        for (idx, leg) in self.store.legs(self.deployment.id).iter().enumerate() {
            for symbol in [leg.ce_tradingsymbol.as_deref(), leg.pe_tradingsymbol.as_deref()]
                .into_iter()
                .flatten()
            {
                if let Some(row) = select::row_by_symbol(&chain, symbol) {
                    intents.push(OrderIntent::new(row, idx, "USER REBALANCE"));
                }
            }
        }
        intents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use delta_desk_core::types::{BrokerKind, DeploymentState, ParameterProfile};
    use delta_desk_core::ExecutionConfig;
    use delta_desk_execution::SimBroker;

    use crate::engine::tests::greek_row;

    fn deployment() -> Deployment {
        Deployment {
            id: 9,
            name: "straddle".to_string(),
            underlying: "NIFTY".to_string(),
            lot_size: 25,
            strategy_kind: "short_straddle".to_string(),
            entry_side: Side::Sell,
            broker: BrokerKind::Sim,
            slippage: dec!(5),
            options: json!({
                "entry_time": "09:20:00",
                "exit_time": "15:10:00",
                "sleep_time": 5,
            }),
            profiles: vec![ParameterProfile {
                name: "p1".to_string(),
                params: json!({}),
            }],
            partitions: vec!["1".to_string()],
            is_active: true,
            hedge_deployment: None,
        }
    }

    fn engine_with(chain: &[InstrumentSnapshot]) -> ShortStraddleEngine {
        let store = StateStore::new();
        store.set(&keys::greeks_instruments("NIFTY", "1"), &chain);
        store.set(&keys::spot("NIFTY"), &dec!(50020));
        store.update_deployments(|reg| {
            reg.insert(
                "9".to_string(),
                DeploymentState {
                    lifecycle: DeploymentLifecycle::Active,
                    users: vec![UserAllocation {
                        username: "u1".to_string(),
                        broker: BrokerKind::Sim,
                        alternate_broker: None,
                        lots: 3,
                        quantity_multiples: vec![75],
                    }],
                    profile_count: 1,
                },
            );
        });
        let cfg = ExecutionConfig {
            slippage: dec!(5),
            chase_poll_ms: 1,
            rate_limit_backoff_ms: 1,
            max_rate_limit_retries: 5,
            price_floor: dec!(0.05),
        };
        let mut exec = ExecutionEngine::new(store.clone(), cfg);
        exec.register(Arc::new(SimBroker::new(dec!(0))));
        ShortStraddleEngine::new(store, Arc::new(exec), deployment()).unwrap()
    }

    #[tokio::test]
    async fn entry_sells_both_legs_at_the_money() {
        let chain = vec![
            greek_row("C50000", dec!(50000), OptionType::Call, dec!(210), 0.51, 0.12),
            greek_row("C50100", dec!(50100), OptionType::Call, dec!(160), 0.40, 0.12),
            greek_row("P50000", dec!(50000), OptionType::Put, dec!(190), -0.49, 0.12),
        ];
        let engine = engine_with(&chain);

        engine.place_entry().await.unwrap();

        let legs = engine.store.legs(9);
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].ce_tradingsymbol.as_deref(), Some("C50000"));
        assert_eq!(legs[0].pe_tradingsymbol.as_deref(), Some("P50000"));
        let premium: Decimal = engine.store.get(&keys::entry_premium(9)).unwrap();
        assert_eq!(premium, dec!(400));
    }

    #[test]
    fn stop_loss_tracks_the_short_premium() {
        let chain = vec![
            greek_row("C50000", dec!(50000), OptionType::Call, dec!(250), 0.51, 0.12),
            greek_row("P50000", dec!(50000), OptionType::Put, dec!(210), -0.49, 0.12),
        ];
        let engine = engine_with(&chain);
        let mut leg = LegState::entered("1", "p1", -1);
        leg.ce_tradingsymbol = Some("C50000".to_string());
        leg.pe_tradingsymbol = Some("P50000".to_string());
        engine.store.set_legs(9, &[leg]);
        engine.store.set(&keys::entry_premium(9), &dec!(400));

        assert!(!engine.stop_loss_breached(&chain));
        engine.store.set(&keys::stop_loss(9), &dec!(50));
        assert!(engine.stop_loss_breached(&chain));
        engine.store.set(&keys::stop_loss(9), &dec!(80));
        assert!(!engine.stop_loss_breached(&chain));
    }

    #[test]
    fn options_must_decode() {
        let mut bad = deployment();
        bad.options = json!({"entry_time": "09:20:00"});
        let store = StateStore::new();
        let exec = Arc::new(ExecutionEngine::new(
            store.clone(),
            ExecutionConfig {
                slippage: dec!(5),
                chase_poll_ms: 1,
                rate_limit_backoff_ms: 1,
                max_rate_limit_retries: 5,
                price_floor: dec!(0.05),
            },
        ));
        assert!(ShortStraddleEngine::new(store, exec, bad).is_err());
    }
}
