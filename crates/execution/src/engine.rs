//! Fan-out order dispatch.
//!
//! Turns strategy order intents into per-user, per-chunk chase requests and
//! runs them concurrently. Buy intents are dispatched and joined before sell
//! intents so margin freed by closing legs is available to the opening legs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{error, info};

use delta_desk_core::split::split_quantity;
use delta_desk_core::types::{BrokerKind, OrderIntent, OrderStatus, Side, UserAllocation};
use delta_desk_core::{ExecutionConfig, StateStore};

use crate::adapter::BrokerAdapter;
use crate::chase::{chase_order, ChaseRequest};

pub struct ExecutionEngine {
    adapters: HashMap<BrokerKind, Arc<dyn BrokerAdapter>>,
    store: StateStore,
    cfg: ExecutionConfig,
}

impl ExecutionEngine {
    #[must_use]
    pub fn new(store: StateStore, cfg: ExecutionConfig) -> Self {
        Self {
            adapters: HashMap::new(),
            store,
            cfg,
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn BrokerAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    #[must_use]
    pub fn adapter(&self, kind: BrokerKind) -> Option<Arc<dyn BrokerAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    fn adapter_for(&self, user: &UserAllocation) -> Result<Arc<dyn BrokerAdapter>> {
        self.adapters
            .get(&user.broker)
            .or_else(|| {
                user.alternate_broker
                    .as_ref()
                    .and_then(|b| self.adapters.get(b))
            })
            .cloned()
            .ok_or_else(|| anyhow!("no brokerage adapter for user {}", user.username))
    }

    /// Dispatches a batch of intents for every allocated user.
    ///
    /// Buys run to completion first, then sells. Each chunk failure is
    /// collected; the first error is returned after the whole batch has been
    /// attempted, so one rejected chunk never strands the rest of the batch.
    ///
    /// # Errors
    ///
    /// Returns an error when any chase fails or ends rejected or cancelled.
    pub async fn place_batch(
        &self,
        underlying: &str,
        users: &[UserAllocation],
        buys: &[OrderIntent],
        sells: &[OrderIntent],
    ) -> Result<()> {
        let mut failures = self.dispatch_side(underlying, users, buys, Side::Buy).await;
        failures.extend(self.dispatch_side(underlying, users, sells, Side::Sell).await);

        for failure in &failures {
            error!(underlying, error = %failure, "Order chunk failed");
        }
        match failures.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    async fn dispatch_side(
        &self,
        underlying: &str,
        users: &[UserAllocation],
        intents: &[OrderIntent],
        side: Side,
    ) -> Vec<anyhow::Error> {
        let mut failures = Vec::new();
        let mut chases = Vec::new();

        for intent in intents {
            let row = match self
                .store
                .instrument_row(underlying, &intent.tradingsymbol, &intent.partition)
            {
                Some(row) => row,
                None => {
                    failures.push(anyhow!(
                        "no snapshot row for {} in partition {}",
                        intent.tradingsymbol,
                        intent.partition
                    ));
                    continue;
                }
            };
            let price = self.initial_price(side, row.last_price);

            for user in users {
                let quantity = user
                    .quantity_multiples
                    .get(intent.leg_index)
                    .copied()
                    .unwrap_or(0);
                if quantity == 0 {
                    continue;
                }
                let adapter = match self.adapter_for(user) {
                    Ok(adapter) => adapter,
                    Err(e) => {
                        failures.push(e);
                        continue;
                    }
                };

                info!(
                    username = user.username,
                    tradingsymbol = intent.tradingsymbol,
                    %side,
                    quantity,
                    reason = intent.reason,
                    "Dispatching order"
                );
                for chunk in split_quantity(quantity, row.max_order_size) {
                    let request = ChaseRequest {
                        username: user.username.clone(),
                        underlying: underlying.to_string(),
                        tradingsymbol: intent.tradingsymbol.clone(),
                        partition: intent.partition.clone(),
                        side,
                        quantity: chunk,
                        price,
                        worst_price: None,
                    };
                    chases.push((adapter.clone(), request));
                }
            }
        }

        let results = join_all(chases.iter().map(|(adapter, request)| {
            chase_order(adapter.as_ref(), &self.store, &self.cfg, request)
        }))
        .await;

        for ((_, request), result) in chases.iter().zip(results) {
            match result {
                Ok(outcome) if outcome.status == OrderStatus::Complete => {}
                Ok(outcome) => failures.push(anyhow!(
                    "order {} for {} on {} ended {:?} with {} filled",
                    outcome.order_id,
                    request.username,
                    request.tradingsymbol,
                    outcome.status,
                    outcome.filled_quantity
                )),
                Err(e) => failures.push(
                    anyhow::Error::new(e).context(format!(
                        "chase failed for {} on {}",
                        request.username, request.tradingsymbol
                    )),
                ),
            }
        }
        failures
    }

    /// Places one corrective order outside the intent/allocation flow.
    ///
    /// # Errors
    ///
    /// Returns an error when no adapter is registered for `broker`, no quote
    /// exists for the symbol, or the chase does not complete.
    pub async fn place_direct(
        &self,
        broker: BrokerKind,
        username: &str,
        underlying: &str,
        tradingsymbol: &str,
        partition: &str,
        side: Side,
        quantity: u32,
    ) -> Result<()> {
        let adapter = self
            .adapter(broker)
            .ok_or_else(|| anyhow!("no brokerage adapter for {broker}"))?;
        let row = self
            .store
            .instrument_row(underlying, tradingsymbol, partition)
            .with_context(|| format!("no snapshot row for {tradingsymbol}"))?;
        let price = self.initial_price(side, row.last_price);

        for chunk in split_quantity(quantity, row.max_order_size) {
            let request = ChaseRequest {
                username: username.to_string(),
                underlying: underlying.to_string(),
                tradingsymbol: tradingsymbol.to_string(),
                partition: partition.to_string(),
                side,
                quantity: chunk,
                price,
                worst_price: None,
            };
            let outcome = chase_order(adapter.as_ref(), &self.store, &self.cfg, &request)
                .await
                .with_context(|| format!("chase failed for {username} on {tradingsymbol}"))?;
            if outcome.status != OrderStatus::Complete {
                anyhow::bail!(
                    "corrective order for {username} on {tradingsymbol} ended {:?}",
                    outcome.status
                );
            }
        }
        Ok(())
    }

    /// Pulls live positions and margin for one brokerage into the store,
    /// covering every user allocated to it across the deployment registry.
    ///
    /// # Errors
    ///
    /// Returns an error when no adapter is registered or the brokerage query
    /// fails; cached values are left untouched in that case.
    pub async fn refresh_broker_state(&self, broker: BrokerKind) -> Result<()> {
        let adapter = self
            .adapter(broker)
            .ok_or_else(|| anyhow!("no brokerage adapter for {broker}"))?;

        let mut usernames: Vec<String> = self
            .store
            .deployments()
            .values()
            .flat_map(|state| state.users.iter())
            .filter(|u| u.broker == broker || u.alternate_broker == Some(broker))
            .map(|u| u.username.clone())
            .collect();
        usernames.sort();
        usernames.dedup();
        if usernames.is_empty() {
            return Ok(());
        }

        let positions = adapter
            .positions(&usernames)
            .await
            .with_context(|| format!("position refresh failed for {broker}"))?;
        self.store.set_positions(broker, &positions);

        let margins = adapter
            .margin(&usernames)
            .await
            .with_context(|| format!("margin refresh failed for {broker}"))?;
        self.store.set_margin(broker, &margins);
        Ok(())
    }

    fn initial_price(&self, side: Side, ltp: Decimal) -> Decimal {
        match side {
            Side::Buy => ltp + self.cfg.slippage,
            Side::Sell => (ltp - self.cfg.slippage).max(self.cfg.price_floor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    use delta_desk_core::types::{InstrumentSnapshot, OptionType};
    use delta_desk_core::keys;

    use crate::sim::SimBroker;

    fn snapshot_row(symbol: &str, opt: OptionType, price: Decimal) -> InstrumentSnapshot {
        let now = Utc::now();
        InstrumentSnapshot {
            tradingsymbol: symbol.to_string(),
            underlying: "NIFTY".to_string(),
            strike: dec!(22000),
            option_type: opt,
            expiry: now + Duration::days(7),
            tick_size: dec!(0.05),
            lot_size: 25,
            max_order_size: 1800,
            last_price: price,
            oi: 0,
            exchange_timestamp: now,
            partition: "1".to_string(),
            spot_price: dec!(22000),
            time_left_years: 0.02,
            greeks: None,
        }
    }

    fn engine_with_sim() -> (ExecutionEngine, StateStore, Arc<SimBroker>) {
        let store = StateStore::new();
        store.set(
            &keys::greeks_instruments("NIFTY", "1"),
            &vec![
                snapshot_row("NIFTY24JUL22000CE", OptionType::Call, dec!(180)),
                snapshot_row("NIFTY24JUL22000PE", OptionType::Put, dec!(170)),
            ],
        );
        let cfg = ExecutionConfig {
            slippage: dec!(5),
            chase_poll_ms: 1,
            rate_limit_backoff_ms: 1,
            max_rate_limit_retries: 5,
            price_floor: dec!(0.05),
        };
        let sim = Arc::new(SimBroker::new(dec!(0)));
        let mut engine = ExecutionEngine::new(store.clone(), cfg);
        engine.register(sim.clone());
        (engine, store, sim)
    }

    fn user(name: &str, quantities: Vec<u32>) -> UserAllocation {
        UserAllocation {
            username: name.to_string(),
            broker: BrokerKind::Sim,
            alternate_broker: None,
            lots: 3,
            quantity_multiples: quantities,
        }
    }

    #[tokio::test]
    async fn batch_places_per_user_quantities() {
        let (engine, _store, sim) = engine_with_sim();
        let users = vec![user("u1", vec![75]), user("u2", vec![50])];
        let sells = vec![OrderIntent {
            tradingsymbol: "NIFTY24JUL22000CE".to_string(),
            partition: "1".to_string(),
            leg_index: 0,
            reason: "ENTRY CE".to_string(),
        }];

        engine
            .place_batch("NIFTY", &users, &[], &sells)
            .await
            .unwrap();

        let positions = sim
            .positions(&["u1".to_string(), "u2".to_string()])
            .await
            .unwrap();
        let total_sold: i64 = positions.iter().map(|p| p.sell_qty).sum();
        assert_eq!(total_sold, 125);
    }

    #[tokio::test]
    async fn missing_snapshot_row_fails_the_batch() {
        let (engine, _store, _sim) = engine_with_sim();
        let users = vec![user("u1", vec![75])];
        let sells = vec![OrderIntent {
            tradingsymbol: "NIFTY24JUL99999CE".to_string(),
            partition: "1".to_string(),
            leg_index: 0,
            reason: "ENTRY CE".to_string(),
        }];

        assert!(engine
            .place_batch("NIFTY", &users, &[], &sells)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn direct_order_chunks_above_freeze_quantity() {
        let (engine, _store, sim) = engine_with_sim();

        engine
            .place_direct(
                BrokerKind::Sim,
                "u1",
                "NIFTY",
                "NIFTY24JUL22000PE",
                "1",
                Side::Buy,
                4500,
            )
            .await
            .unwrap();

        let positions = sim.positions(&["u1".to_string()]).await.unwrap();
        assert_eq!(positions[0].buy_qty, 4500);
    }

    #[tokio::test]
    async fn refresh_pulls_positions_and_margin_into_the_store() {
        use delta_desk_core::types::{DeploymentLifecycle, DeploymentState};

        let (engine, store, _sim) = engine_with_sim();
        store.update_deployments(|reg| {
            reg.insert(
                "1".to_string(),
                DeploymentState {
                    lifecycle: DeploymentLifecycle::Active,
                    users: vec![user("u1", vec![75])],
                    profile_count: 1,
                },
            );
        });

        engine
            .place_direct(
                BrokerKind::Sim,
                "u1",
                "NIFTY",
                "NIFTY24JUL22000CE",
                "1",
                Side::Sell,
                75,
            )
            .await
            .unwrap();
        engine.refresh_broker_state(BrokerKind::Sim).await.unwrap();

        let positions = store.positions(BrokerKind::Sim);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].net_qty, -75);
    }

    #[tokio::test]
    async fn zero_quantity_profiles_are_skipped() {
        let (engine, _store, sim) = engine_with_sim();
        let users = vec![user("u1", vec![0, 75])];
        let sells = vec![OrderIntent {
            tradingsymbol: "NIFTY24JUL22000CE".to_string(),
            partition: "1".to_string(),
            leg_index: 0,
            reason: "ENTRY CE".to_string(),
        }];

        engine
            .place_batch("NIFTY", &users, &[], &sells)
            .await
            .unwrap();
        let positions = sim.positions(&["u1".to_string()]).await.unwrap();
        assert!(positions.is_empty());
    }
}
