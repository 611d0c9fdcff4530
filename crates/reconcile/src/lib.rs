//! Position reconciliation.
//!
//! Every interval the reconciler rebuilds what each user's net position
//! should be from the deployment registry and committed leg state, compares
//! it against the brokerage's live positions, and issues corrective orders
//! for any drift. Partial fills, missed callbacks, and lost store writes all
//! self-heal here; a brokerage that cannot be queried is skipped for the
//! cycle rather than corrected blind.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::NaiveTime;
use tracing::{error, info, warn};

use delta_desk_core::types::{BrokerKind, Deployment, Side};
use delta_desk_core::{clock, StateStore};
use delta_desk_execution::ExecutionEngine;

use std::sync::Arc;

/// One user's expected holding of one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PositionKey {
    username: String,
    broker: BrokerKind,
    tradingsymbol: String,
}

#[derive(Debug, Clone)]
struct Expectation {
    quantity: i64,
    underlying: String,
    partition: String,
}

pub struct Reconciler {
    store: StateStore,
    exec: Arc<ExecutionEngine>,
    deployments: Vec<Deployment>,
}

impl Reconciler {
    #[must_use]
    pub fn new(store: StateStore, exec: Arc<ExecutionEngine>, deployments: Vec<Deployment>) -> Self {
        Self {
            store,
            exec,
            deployments,
        }
    }

    /// Expected net position per user and symbol, derived from committed leg
    /// state: every held side of every leg, times the user's per-profile
    /// quantity, signed by the deployment's position direction.
    fn expectations(&self) -> HashMap<PositionKey, Expectation> {
        let registry = self.store.deployments();
        let mut expected: HashMap<PositionKey, Expectation> = HashMap::new();

        for deployment in &self.deployments {
            if !self.store.deployment_running(deployment.id) {
                continue;
            }
            let Some(state) = registry.get(&deployment.id.to_string()) else {
                continue;
            };
            let legs = self.store.legs(deployment.id);

            for (idx, leg) in legs.iter().enumerate() {
                for symbol in [leg.ce_tradingsymbol.as_deref(), leg.pe_tradingsymbol.as_deref()]
                    .into_iter()
                    .flatten()
                {
                    for user in &state.users {
                        let quantity = user
                            .quantity_multiples
                            .get(idx)
                            .copied()
                            .unwrap_or(0);
                        if quantity == 0 {
                            continue;
                        }
                        let key = PositionKey {
                            username: user.username.clone(),
                            broker: user.broker,
                            tradingsymbol: symbol.to_string(),
                        };
                        expected
                            .entry(key)
                            .or_insert_with(|| Expectation {
                                quantity: 0,
                                underlying: deployment.underlying.clone(),
                                partition: leg.partition.clone(),
                            })
                            .quantity += leg.position_type * i64::from(quantity);
                    }
                }
            }
        }
        expected
    }

    fn brokers_in_play(&self) -> HashSet<BrokerKind> {
        self.store
            .deployments()
            .values()
            .flat_map(|state| state.users.iter())
            .map(|u| u.broker)
            .collect()
    }

    /// One reconciliation pass. Returns the number of corrective orders
    /// placed.
    ///
    /// # Errors
    ///
    /// Returns an error when a corrective order fails to complete. Brokerage
    /// query failures are not errors; the affected brokerage is skipped.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let mut live_brokers = HashSet::new();
        for broker in self.brokers_in_play() {
            match self.exec.refresh_broker_state(broker).await {
                Ok(()) => {
                    live_brokers.insert(broker);
                }
                Err(e) => {
                    warn!(%broker, error = %e, "Brokerage unreachable, skipping this cycle");
                }
            }
        }

        let expected = self.expectations();

        // Live positions, including symbols no longer expected at all.
        let mut actual: HashMap<PositionKey, i64> = HashMap::new();
        for broker in &live_brokers {
            for position in self.store.positions(*broker) {
                actual.insert(
                    PositionKey {
                        username: position.username.clone(),
                        broker: *broker,
                        tradingsymbol: position.tradingsymbol.clone(),
                    },
                    position.net_qty,
                );
            }
        }

        let mut corrected = 0;
        for (key, expectation) in &expected {
            if !live_brokers.contains(&key.broker) {
                continue;
            }
            let held = actual.remove(key).unwrap_or(0);
            let diff = expectation.quantity - held;
            if diff == 0 {
                continue;
            }
            let side = if diff > 0 { Side::Buy } else { Side::Sell };
            info!(
                username = key.username,
                tradingsymbol = key.tradingsymbol,
                expected = expectation.quantity,
                held,
                %side,
                "Correcting position drift"
            );
            self.exec
                .place_direct(
                    key.broker,
                    &key.username,
                    &expectation.underlying,
                    &key.tradingsymbol,
                    &expectation.partition,
                    side,
                    diff.unsigned_abs() as u32,
                )
                .await?;
            corrected += 1;
        }

        // Anything held that no running deployment accounts for is left
        // alone: it may belong to a position opened outside this system.
        for (key, held) in actual {
            if held != 0 {
                warn!(
                    username = key.username,
                    tradingsymbol = key.tradingsymbol,
                    held,
                    "Unexpected open position, not touching it"
                );
            }
        }

        Ok(corrected)
    }

    /// Runs the reconciliation loop until market close.
    pub async fn run(&self, interval_secs: u64, close: NaiveTime) {
        info!(interval_secs, "Reconciler started");
        loop {
            if clock::now().time() >= close {
                info!("Market closed, reconciler stopping");
                break;
            }
            match self.reconcile_once().await {
                Ok(0) => {}
                Ok(n) => info!(corrections = n, "Reconciliation pass complete"),
                Err(e) => error!(error = %e, "Reconciliation pass failed"),
            }
            clock::sleep_until_aligned(interval_secs).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use delta_desk_core::store::keys;
    use delta_desk_core::types::{
        DeploymentLifecycle, DeploymentState, InstrumentSnapshot, LegState, OptionType,
        UserAllocation,
    };
    use delta_desk_core::ExecutionConfig;
    use delta_desk_execution::{BrokerAdapter, SimBroker};

    fn snapshot_row(symbol: &str, opt: OptionType, price: Decimal) -> InstrumentSnapshot {
        let now = Utc::now();
        InstrumentSnapshot {
            tradingsymbol: symbol.to_string(),
            underlying: "NIFTY".to_string(),
            strike: dec!(50000),
            option_type: opt,
            expiry: now + Duration::days(1),
            tick_size: dec!(0.05),
            lot_size: 25,
            max_order_size: 1800,
            last_price: price,
            oi: 0,
            exchange_timestamp: now,
            partition: "1".to_string(),
            spot_price: dec!(50000),
            time_left_years: 0.004,
            greeks: None,
        }
    }

    fn deployment() -> Deployment {
        Deployment {
            id: 7,
            name: "strangle".to_string(),
            underlying: "NIFTY".to_string(),
            lot_size: 25,
            strategy_kind: "delta_strangle".to_string(),
            entry_side: Side::Sell,
            broker: BrokerKind::Sim,
            slippage: dec!(5),
            options: json!({}),
            profiles: vec![],
            partitions: vec!["1".to_string()],
            is_active: true,
            hedge_deployment: None,
        }
    }

    fn short_leg(symbol: &str) -> LegState {
        let mut leg = LegState::entered("1", "p1", -1);
        leg.ce_tradingsymbol = Some(symbol.to_string());
        leg
    }

    fn fixture() -> (Reconciler, StateStore, Arc<SimBroker>) {
        let store = StateStore::new();
        store.set(
            &keys::greeks_instruments("NIFTY", "1"),
            &vec![snapshot_row("C50000", OptionType::Call, dec!(200))],
        );
        store.update_deployments(|reg| {
            reg.insert(
                "7".to_string(),
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
        store.set_legs(7, &[short_leg("C50000")]);

        let cfg = ExecutionConfig {
            slippage: dec!(5),
            chase_poll_ms: 1,
            rate_limit_backoff_ms: 1,
            max_rate_limit_retries: 5,
            price_floor: dec!(0.05),
        };
        let sim = Arc::new(SimBroker::new(dec!(0)));
        let mut exec = ExecutionEngine::new(store.clone(), cfg);
        exec.register(sim.clone());
        let reconciler = Reconciler::new(store.clone(), Arc::new(exec), vec![deployment()]);
        (reconciler, store, sim)
    }

    #[tokio::test]
    async fn partial_fill_drift_is_corrected() {
        let (reconciler, _store, sim) = fixture();

        // The user should be short 75 but only 50 ever filled.
        reconciler
            .exec
            .place_direct(
                BrokerKind::Sim,
                "u1",
                "NIFTY",
                "C50000",
                "1",
                Side::Sell,
                50,
            )
            .await
            .unwrap();

        let corrected = reconciler.reconcile_once().await.unwrap();
        assert_eq!(corrected, 1);

        let positions = sim.positions(&["u1".to_string()]).await.unwrap();
        assert_eq!(positions[0].net_qty, -75);
    }

    #[tokio::test]
    async fn matching_positions_produce_no_orders() {
        let (reconciler, _store, sim) = fixture();
        reconciler
            .exec
            .place_direct(
                BrokerKind::Sim,
                "u1",
                "NIFTY",
                "C50000",
                "1",
                Side::Sell,
                75,
            )
            .await
            .unwrap();

        let corrected = reconciler.reconcile_once().await.unwrap();
        assert_eq!(corrected, 0);

        let positions = sim.positions(&["u1".to_string()]).await.unwrap();
        assert_eq!(positions[0].net_qty, -75);
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let (reconciler, _store, sim) = fixture();

        assert_eq!(reconciler.reconcile_once().await.unwrap(), 1);
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 0);

        let positions = sim.positions(&["u1".to_string()]).await.unwrap();
        assert_eq!(positions[0].net_qty, -75);
    }

    #[tokio::test]
    async fn stopped_deployment_is_ignored() {
        let (reconciler, store, sim) = fixture();
        store.update_deployments(|reg| {
            if let Some(s) = reg.get_mut("7") {
                s.lifecycle = DeploymentLifecycle::Exiting;
            }
        });

        assert_eq!(reconciler.reconcile_once().await.unwrap(), 0);
        assert!(sim.positions(&["u1".to_string()]).await.unwrap().is_empty());
    }
}
