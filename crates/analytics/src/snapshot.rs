//! Per-cycle snapshot publication.
//!
//! Each tick cycle the engine reads the raw instrument set the market-data
//! feed wrote for every partition, computes greeks against the current spot,
//! and publishes a fresh immutable snapshot plus one OI history row. The
//! previous snapshot is superseded wholesale, never mutated.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use futures::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, error, info};

use delta_desk_core::store::keys;
use delta_desk_core::types::{InstrumentSnapshot, OptionType};
use delta_desk_core::{clock, AnalyticsConfig, MarketConfig, StateStore};

use crate::greeks::option_greeks;
use crate::oi_signal::OiSample;

pub struct AnalyticsEngine {
    store: StateStore,
    underlying: String,
    partitions: Vec<String>,
    risk_free_rate: f64,
    strike_step: Decimal,
    history_limit: usize,
}

impl AnalyticsEngine {
    #[must_use]
    pub fn new(store: StateStore, market: &MarketConfig, analytics: &AnalyticsConfig) -> Self {
        Self {
            store,
            underlying: market.underlying.clone(),
            partitions: market.partitions.clone(),
            risk_free_rate: analytics.risk_free_rate,
            strike_step: market.strike_step,
            history_limit: analytics.history_limit,
        }
    }

    /// Recomputes greeks for one partition and publishes the cycle snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when the spot price is missing; an absent raw
    /// instrument set is not an error (the feed has simply not ticked yet).
    pub fn publish_cycle(&self, partition: &str, now: DateTime<Utc>) -> Result<()> {
        let raw: Vec<InstrumentSnapshot> = self
            .store
            .get(&keys::instruments(&self.underlying, partition))
            .unwrap_or_default();
        if raw.is_empty() {
            debug!(partition, "No instruments in feed yet, skipping cycle");
            return Ok(());
        }

        let spot = self
            .store
            .spot(&self.underlying)
            .with_context(|| format!("no spot price for {}", self.underlying))?;
        let spot_f = spot.to_f64().unwrap_or_default();

        let mut computed = raw;
        for row in &mut computed {
            let time_left =
                (row.expiry - now).num_seconds() as f64 / 86_400.0 / 365.0;
            row.spot_price = spot;
            row.time_left_years = time_left;
            row.greeks = Some(option_greeks(
                row.last_price.to_f64().unwrap_or_default(),
                spot_f,
                row.strike.to_f64().unwrap_or_default(),
                time_left,
                self.risk_free_rate,
                row.option_type,
            ));
        }

        self.store.set(
            &keys::greeks_instruments(&self.underlying, partition),
            &computed,
        );
        self.append_oi_sample(partition, now, spot, &computed);

        Ok(())
    }

    fn append_oi_sample(
        &self,
        partition: &str,
        now: DateTime<Utc>,
        spot: Decimal,
        rows: &[InstrumentSnapshot],
    ) {
        let ce_total: i64 = rows
            .iter()
            .filter(|r| r.option_type == OptionType::Call)
            .map(|r| r.oi)
            .sum();
        let pe_total: i64 = rows
            .iter()
            .filter(|r| r.option_type == OptionType::Put)
            .map(|r| r.oi)
            .sum();

        let atm = (spot / self.strike_step).round() * self.strike_step;
        let atm_row = |opt: OptionType| {
            rows.iter()
                .find(|r| r.option_type == opt && r.strike == atm)
        };
        let ce_atm = atm_row(OptionType::Call);
        let pe_atm = atm_row(OptionType::Put);

        let sample = OiSample {
            timestamp: now,
            ce_total_oi: ce_total,
            pe_total_oi: pe_total,
            pcr: OiSample::pcr_of(pe_total, ce_total),
            atm_strike: atm,
            ce_iv: ce_atm.map_or(0.0, InstrumentSnapshot::sigma),
            pe_iv: pe_atm.map_or(0.0, InstrumentSnapshot::sigma),
            ce_premium: ce_atm.map_or_else(Decimal::default, |r| r.last_price),
            pe_premium: pe_atm.map_or_else(Decimal::default, |r| r.last_price),
        };

        let limit = self.history_limit;
        self.store.update::<Vec<OiSample>, _>(
            &keys::oi_history(&self.underlying, partition),
            |history| {
                history.push(sample);
                if history.len() > limit {
                    let excess = history.len() - limit;
                    history.drain(..excess);
                }
            },
        );
    }

    /// Rolling OI history for one partition.
    #[must_use]
    pub fn oi_history(&self, partition: &str) -> Vec<OiSample> {
        self.store
            .get(&keys::oi_history(&self.underlying, partition))
            .unwrap_or_default()
    }

    /// Runs the tick-aligned analytics loop until market close. Partitions
    /// are recomputed concurrently and joined before the next sleep.
    pub async fn run(self: Arc<Self>, cadence_secs: u64, close: NaiveTime) {
        info!(
            underlying = self.underlying,
            partitions = self.partitions.len(),
            cadence_secs,
            "Analytics engine started"
        );

        loop {
            if clock::now().time() >= close {
                info!(underlying = self.underlying, "Market closed, analytics stopping");
                break;
            }

            let now = Utc::now();
            let tasks: Vec<_> = self
                .partitions
                .iter()
                .map(|partition| {
                    let engine = Arc::clone(&self);
                    let partition = partition.clone();
                    tokio::task::spawn_blocking(move || {
                        engine
                            .publish_cycle(&partition, now)
                            .map_err(|e| (partition, e))
                    })
                })
                .collect();

            for joined in join_all(tasks).await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err((partition, e))) => {
                        error!(partition, error = %e, "Analytics cycle failed");
                    }
                    Err(e) => error!(error = %e, "Analytics task panicked"),
                }
            }

            clock::sleep_until_aligned(cadence_secs).await;
        }
    }
}
