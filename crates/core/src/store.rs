//! Shared state store, the single source of truth between decision cycles.
//!
//! A low-latency key/value map with `get`/`set`/`delete` and no transactions.
//! Callers read-modify-write whole values (use [`StateStore::update`] to do
//! the read-merge-write under the lock as one logical step) and accept
//! last-writer-wins semantics; the reconciliation loop self-heals any drift
//! a lost write produces.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::types::{
    BrokerKind, DeploymentState, InstrumentSnapshot, LegState, MarginInfo, NetPosition,
};

/// Cache key layout. One flat namespace, formatted keys per deployment,
/// underlying, and feed partition.
pub mod keys {
    use crate::types::BrokerKind;

    /// Registry of live deployments: `HashMap<String, DeploymentState>`.
    pub const DEPLOYMENTS: &str = "DEPLOYED_STRATEGIES";

    #[must_use]
    pub fn legs(deployment_id: u32) -> String {
        format!("LEGS_{deployment_id}")
    }

    #[must_use]
    pub fn one_side_hold(deployment_id: u32, leg_index: usize) -> String {
        format!("ONE_SIDE_EXIT_HOLD_{deployment_id}_{leg_index}")
    }

    #[must_use]
    pub fn stop_loss(deployment_id: u32) -> String {
        format!("STOP_LOSS_{deployment_id}")
    }

    #[must_use]
    pub fn entry_time(deployment_id: u32) -> String {
        format!("ENTRY_TIME_{deployment_id}")
    }

    /// Total premium collected/paid at entry, the stop-loss baseline.
    #[must_use]
    pub fn entry_premium(deployment_id: u32) -> String {
        format!("ENTRY_PREMIUM_{deployment_id}")
    }

    /// Raw per-partition instrument set written by the market-data feed.
    #[must_use]
    pub fn instruments(underlying: &str, partition: &str) -> String {
        format!("{underlying}_{partition}_OPTION_INSTRUMENTS")
    }

    /// Per-partition instrument set with greeks, written by analytics.
    #[must_use]
    pub fn greeks_instruments(underlying: &str, partition: &str) -> String {
        format!("{underlying}_{partition}_OPTION_GREEKS_INSTRUMENTS")
    }

    /// Rolling open-interest history: `Vec<OiSample>`.
    #[must_use]
    pub fn oi_history(underlying: &str, partition: &str) -> String {
        format!("{underlying}_{partition}_OI_HISTORY")
    }

    /// Spot last-traded price of the underlying.
    #[must_use]
    pub fn spot(underlying: &str) -> String {
        format!("{underlying}_LTP")
    }

    /// Current expiry date per partition.
    #[must_use]
    pub fn expiry(underlying: &str, partition: &str) -> String {
        format!("{underlying}_{partition}_EXPIRY")
    }

    #[must_use]
    pub fn positions(broker: BrokerKind) -> String {
        format!("{broker}_POSITIONS").to_uppercase()
    }

    #[must_use]
    pub fn margin(broker: BrokerKind) -> String {
        format!("{broker}_MARGIN").to_uppercase()
    }
}

/// In-memory key/value store shared by every component.
#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads and decodes a value. A missing key and an undecodable value both
    /// map to `None`; the latter is logged and never fatal.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.lock().get(key).cloned()?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "Dropping undecodable store value");
                None
            }
        }
    }

    /// Writes a whole value, replacing any previous one (last writer wins).
    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.lock().insert(key.to_string(), v);
            }
            Err(e) => warn!(key, error = %e, "Failed to encode store value"),
        }
    }

    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Read-modify-write of one whole value under the lock.
    pub fn update<T, F>(&self, key: &str, mutate: F)
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let mut map = self.lock();
        let mut value: T = map
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        mutate(&mut value);
        match serde_json::to_value(&value) {
            Ok(v) => {
                map.insert(key.to_string(), v);
            }
            Err(e) => warn!(key, error = %e, "Failed to encode store value"),
        }
    }

    // ---- typed helpers ----

    #[must_use]
    pub fn deployments(&self) -> HashMap<String, DeploymentState> {
        self.get(keys::DEPLOYMENTS).unwrap_or_default()
    }

    /// True while the deployment is present in the registry and not exiting.
    #[must_use]
    pub fn deployment_running(&self, deployment_id: u32) -> bool {
        self.deployments()
            .get(&deployment_id.to_string())
            .is_some_and(|s| {
                !matches!(
                    s.lifecycle,
                    crate::types::DeploymentLifecycle::Inactive
                        | crate::types::DeploymentLifecycle::Exiting
                )
            })
    }

    pub fn update_deployments<F>(&self, mutate: F)
    where
        F: FnOnce(&mut HashMap<String, DeploymentState>),
    {
        self.update(keys::DEPLOYMENTS, mutate);
    }

    #[must_use]
    pub fn legs(&self, deployment_id: u32) -> Vec<LegState> {
        self.get(&keys::legs(deployment_id)).unwrap_or_default()
    }

    pub fn set_legs(&self, deployment_id: u32, legs: &[LegState]) {
        self.set(&keys::legs(deployment_id), &legs);
    }

    #[must_use]
    pub fn one_side_hold(&self, deployment_id: u32, leg_index: usize) -> bool {
        self.get(&keys::one_side_hold(deployment_id, leg_index))
            .unwrap_or(false)
    }

    pub fn set_one_side_hold(&self, deployment_id: u32, leg_index: usize, held: bool) {
        self.set(&keys::one_side_hold(deployment_id, leg_index), &held);
    }

    /// Latest greeks-bearing instrument rows across the given partitions.
    #[must_use]
    pub fn instruments(&self, underlying: &str, partitions: &[String]) -> Vec<InstrumentSnapshot> {
        partitions
            .iter()
            .flat_map(|p| {
                self.get::<Vec<InstrumentSnapshot>>(&keys::greeks_instruments(underlying, p))
                    .unwrap_or_default()
            })
            .collect()
    }

    /// One instrument row by trading symbol.
    #[must_use]
    pub fn instrument_row(
        &self,
        underlying: &str,
        tradingsymbol: &str,
        partition: &str,
    ) -> Option<InstrumentSnapshot> {
        self.get::<Vec<InstrumentSnapshot>>(&keys::greeks_instruments(underlying, partition))?
            .into_iter()
            .find(|row| row.tradingsymbol == tradingsymbol)
    }

    /// Last traded price for one option, from the latest published snapshot.
    #[must_use]
    pub fn option_ltp(
        &self,
        underlying: &str,
        tradingsymbol: &str,
        partition: &str,
    ) -> Option<rust_decimal::Decimal> {
        self.instrument_row(underlying, tradingsymbol, partition)
            .map(|row| row.last_price)
    }

    #[must_use]
    pub fn spot(&self, underlying: &str) -> Option<rust_decimal::Decimal> {
        self.get(&keys::spot(underlying))
    }

    #[must_use]
    pub fn positions(&self, broker: BrokerKind) -> Vec<NetPosition> {
        self.get(&keys::positions(broker)).unwrap_or_default()
    }

    pub fn set_positions(&self, broker: BrokerKind, positions: &[NetPosition]) {
        self.set(&keys::positions(broker), &positions);
    }

    pub fn set_margin(&self, broker: BrokerKind, margins: &[MarginInfo]) {
        self.set(&keys::margin(broker), &margins);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeploymentLifecycle;

    #[test]
    fn get_set_delete_round_trip() {
        let store = StateStore::new();
        store.set("k", &vec![1u32, 2, 3]);
        assert_eq!(store.get::<Vec<u32>>("k"), Some(vec![1, 2, 3]));

        store.delete("k");
        assert_eq!(store.get::<Vec<u32>>("k"), None);
    }

    #[test]
    fn update_is_read_modify_write() {
        let store = StateStore::new();
        store.update::<Vec<u32>, _>("list", |v| v.push(1));
        store.update::<Vec<u32>, _>("list", |v| v.push(2));
        assert_eq!(store.get::<Vec<u32>>("list"), Some(vec![1, 2]));
    }

    #[test]
    fn deployment_running_checks_lifecycle() {
        let store = StateStore::new();
        assert!(!store.deployment_running(7));

        store.update_deployments(|reg| {
            reg.insert(
                "7".to_string(),
                DeploymentState {
                    lifecycle: DeploymentLifecycle::Active,
                    users: vec![],
                    profile_count: 2,
                },
            );
        });
        assert!(store.deployment_running(7));

        store.update_deployments(|reg| {
            if let Some(s) = reg.get_mut("7") {
                s.lifecycle = DeploymentLifecycle::Exiting;
            }
        });
        assert!(!store.deployment_running(7));
    }

    #[test]
    fn undecodable_value_maps_to_none() {
        let store = StateStore::new();
        store.set("k", &"not a number");
        assert_eq!(store.get::<u32>("k"), None);
    }
}
