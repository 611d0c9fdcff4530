//! Delta-managing strangle engine with one-side exit.
//!
//! One engine instance drives one deployment: entry at the configured time,
//! a tick-aligned decision loop evaluating each leg group (one-side exit,
//! re-entry, shifting, stop loss), and a full unwind at exit time or when
//! the deployment leaves the active registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use delta_desk_analytics::{signal_features, OiSample, WindowFeatures};
use delta_desk_core::clock::{self, MARKET_TZ};
use delta_desk_core::store::keys;
use delta_desk_core::types::{
    Deployment, DeploymentLifecycle, InstrumentSnapshot, LegState, OptionType, OrderIntent, Side,
};
use delta_desk_core::StateStore;
use delta_desk_execution::ExecutionEngine;

use crate::error::StrategyError;
use crate::params::{DayParams, ProfileParams, StrategyOptions};
use crate::select::{self, Bound, Candidate};
use crate::signal::{self, CONFIRM_WINDOW};

/// Retry delay when the chain has no qualifying entry strike.
const STRIKE_RETRY: Duration = Duration::from_secs(10);

pub struct DeltaStrangleEngine {
    pub(crate) store: StateStore,
    pub(crate) exec: Arc<ExecutionEngine>,
    pub(crate) deployment: Deployment,
    pub(crate) options: StrategyOptions,
    pub(crate) profiles: Vec<ProfileParams>,
}

/// Planned transition for one leg group this cycle: orders that close
/// existing exposure, orders that open new exposure, and the leg state to
/// commit once both are dispatched.
#[derive(Debug, Default)]
pub(crate) struct CyclePlan {
    pub closes: Vec<OrderIntent>,
    pub opens: Vec<OrderIntent>,
    pub ce_tradingsymbol: Option<String>,
    pub pe_tradingsymbol: Option<String>,
    pub exited_one_side: bool,
    pub ce_exit_one_side: bool,
    pub pe_exit_one_side: bool,
}

impl CyclePlan {
    pub(crate) fn from_leg(leg: &LegState) -> Self {
        Self {
            closes: Vec::new(),
            opens: Vec::new(),
            ce_tradingsymbol: leg.ce_tradingsymbol.clone(),
            pe_tradingsymbol: leg.pe_tradingsymbol.clone(),
            exited_one_side: leg.exited_one_side,
            ce_exit_one_side: leg.ce_exit_one_side,
            pe_exit_one_side: leg.pe_exit_one_side,
        }
    }

    fn is_noop(&self) -> bool {
        self.closes.is_empty() && self.opens.is_empty()
    }

    pub(crate) fn apply_to_leg(&self, leg: &mut LegState) {
        leg.ce_tradingsymbol = self.ce_tradingsymbol.clone();
        leg.pe_tradingsymbol = self.pe_tradingsymbol.clone();
        leg.exited_one_side = self.exited_one_side;
        leg.ce_exit_one_side = self.ce_exit_one_side;
        leg.pe_exit_one_side = self.pe_exit_one_side;
    }
}

/// Daily context derived from the published expiry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DayContext {
    pub days_left: i64,
    pub oneside_cutoff: DateTime<Tz>,
    pub expiry_cutoff: DateTime<Tz>,
}

fn market_at(date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
    MARKET_TZ
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .unwrap_or_else(clock::now)
}

impl DeltaStrangleEngine {
    /// # Errors
    ///
    /// Returns `BadParams` when the deployment's options or profile tables
    /// do not decode, or the deployment subscribes to no feed partition.
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
        let options = StrategyOptions::from_value(&deployment.options)?;
        let profiles = deployment
            .profiles
            .iter()
            .map(ProfileParams::from_profile)
            .collect::<Result<Vec<_>, _>>()?;
        if profiles.is_empty() {
            return Err(StrategyError::BadParams(format!(
                "deployment {} has no active profiles",
                deployment.id
            )));
        }
        Ok(Self {
            store,
            exec,
            deployment,
            options,
            profiles,
        })
    }

    #[must_use]
    pub fn deployment_id(&self) -> u32 {
        self.deployment.id
    }

    pub(crate) fn partition(&self) -> &str {
        &self.deployment.partitions[0]
    }

    pub(crate) fn chain(&self) -> Vec<InstrumentSnapshot> {
        self.store
            .instruments(&self.deployment.underlying, &self.deployment.partitions)
    }

    pub(crate) fn leg_row<'a>(
        &self,
        chain: &'a [InstrumentSnapshot],
        tradingsymbol: &str,
    ) -> Result<&'a InstrumentSnapshot, StrategyError> {
        select::row_by_symbol(chain, tradingsymbol)
            .ok_or_else(|| StrategyError::MissingInstrument(tradingsymbol.to_string()))
    }

    pub(crate) fn day_context(&self) -> Result<DayContext, StrategyError> {
        let expiry: NaiveDate = self
            .store
            .get(&keys::expiry(&self.deployment.underlying, self.partition()))
            .ok_or_else(|| {
                StrategyError::BadParams(format!(
                    "no expiry published for {} partition {}",
                    self.deployment.underlying,
                    self.partition()
                ))
            })?;
        let today = clock::now().date_naive();
        Ok(DayContext {
            days_left: (expiry - today).num_days(),
            oneside_cutoff: market_at(today, self.options.oneside_check_time),
            expiry_cutoff: market_at(expiry, self.options.expiry_check_time),
        })
    }

    /// OI-change features for this cycle, keyed by window. The confirmation
    /// window is always included.
    pub(crate) fn features(&self) -> HashMap<usize, WindowFeatures> {
        let history: Vec<OiSample> = self
            .store
            .get(&keys::oi_history(
                &self.deployment.underlying,
                self.partition(),
            ))
            .unwrap_or_default();
        let mut windows = self.options.windows.clone();
        if !windows.contains(&CONFIRM_WINDOW) {
            windows.push(CONFIRM_WINDOW);
        }
        signal_features(&history, &windows)
            .into_iter()
            .map(|f| (f.window, f))
            .collect()
    }

    fn spot(&self) -> Decimal {
        self.store
            .spot(&self.deployment.underlying)
            .unwrap_or_default()
    }

    // ---- transition planning ----

    fn plan_ce_exit(leg: &LegState, idx: usize, ce: &InstrumentSnapshot) -> CyclePlan {
        let mut plan = CyclePlan::from_leg(leg);
        plan.closes.push(OrderIntent::new(ce, idx, "EXIT CE"));
        plan.ce_tradingsymbol = None;
        plan.exited_one_side = true;
        plan.ce_exit_one_side = true;
        plan
    }

    fn plan_pe_exit(leg: &LegState, idx: usize, pe: &InstrumentSnapshot) -> CyclePlan {
        let mut plan = CyclePlan::from_leg(leg);
        plan.closes.push(OrderIntent::new(pe, idx, "EXIT PE"));
        plan.pe_tradingsymbol = None;
        plan.exited_one_side = true;
        plan.pe_exit_one_side = true;
        plan
    }

    /// Re-entry of an exited call. The surviving put is restructured along
    /// with it when its delta has drifted past the shift bounds; otherwise
    /// only a call matched to the put's delta is re-opened.
    pub(crate) fn plan_ce_reentry(
        &self,
        leg: &LegState,
        idx: usize,
        chain: &[InstrumentSnapshot],
        pe: &InstrumentSnapshot,
        now: DateTime<Tz>,
        ctx: &DayContext,
    ) -> CyclePlan {
        let mut plan = CyclePlan::from_leg(leg);
        let spot = self.spot();

        let pe_target = select::find_strike_by_delta(
            chain,
            spot,
            -self.options.shift_min_delta_entry,
            OptionType::Put,
            Bound::AtMost,
        );
        let drifted = (pe.delta() > -self.options.shift_min_delta && now <= ctx.expiry_cutoff)
            || pe.delta() < -self.options.shift_max_delta;

        if drifted && pe_target.is_some_and(|t| t.strike != pe.strike) {
            let ce_target = select::find_strike_by_delta(
                chain,
                spot,
                self.options.shift_min_delta_entry,
                OptionType::Call,
                Bound::AtMost,
            );
            if let (Some(ce_target), Some(pe_target)) = (ce_target, pe_target) {
                if let (Some(new_ce), Some(new_pe)) = (
                    select::row_at(chain, ce_target.strike, OptionType::Call),
                    select::row_at(chain, pe_target.strike, OptionType::Put),
                ) {
                    plan.closes
                        .push(OrderIntent::new(pe, idx, "EXIT PE - RESTRUCTURING"));
                    plan.opens.extend([
                        OrderIntent::new(new_pe, idx, "ENTERING PE - RESTRUCTURING"),
                        OrderIntent::new(new_ce, idx, "ENTERING CE - RESTRUCTURING"),
                    ]);
                    plan.ce_tradingsymbol = Some(new_ce.tradingsymbol.clone());
                    plan.pe_tradingsymbol = Some(new_pe.tradingsymbol.clone());
                    plan.exited_one_side = false;
                    plan.ce_exit_one_side = false;
                    return plan;
                }
            }
        } else if let Some(target) = select::find_strike_by_delta(
            chain,
            spot,
            -pe.delta(),
            OptionType::Call,
            Bound::AtMost,
        ) {
            if let Some(new_ce) = select::row_at(chain, target.strike, OptionType::Call) {
                plan.opens.push(OrderIntent::new(new_ce, idx, "ENTERING CE"));
                plan.ce_tradingsymbol = Some(new_ce.tradingsymbol.clone());
                plan.exited_one_side = false;
                plan.ce_exit_one_side = false;
                return plan;
            }
        }

        warn!(
            deployment = self.deployment.id,
            leg = idx,
            "Call re-entry strike not found, staying one-side exited"
        );
        plan
    }

    pub(crate) fn plan_pe_reentry(
        &self,
        leg: &LegState,
        idx: usize,
        chain: &[InstrumentSnapshot],
        ce: &InstrumentSnapshot,
        now: DateTime<Tz>,
        ctx: &DayContext,
    ) -> CyclePlan {
        let mut plan = CyclePlan::from_leg(leg);
        let spot = self.spot();

        let ce_target = select::find_strike_by_delta(
            chain,
            spot,
            self.options.shift_min_delta_entry,
            OptionType::Call,
            Bound::AtLeast,
        );
        let drifted = (ce.delta() < self.options.shift_min_delta && now <= ctx.expiry_cutoff)
            || ce.delta() > self.options.shift_max_delta;

        if drifted && ce_target.is_some_and(|t| t.strike != ce.strike) {
            let pe_target = select::find_strike_by_delta(
                chain,
                spot,
                -self.options.shift_min_delta_entry,
                OptionType::Put,
                Bound::AtLeast,
            );
            if let (Some(ce_target), Some(pe_target)) = (ce_target, pe_target) {
                if let (Some(new_ce), Some(new_pe)) = (
                    select::row_at(chain, ce_target.strike, OptionType::Call),
                    select::row_at(chain, pe_target.strike, OptionType::Put),
                ) {
                    plan.closes
                        .push(OrderIntent::new(ce, idx, "EXIT CE - RESTRUCTURING"));
                    plan.opens.extend([
                        OrderIntent::new(new_pe, idx, "ENTERING PE - RESTRUCTURING"),
                        OrderIntent::new(new_ce, idx, "ENTERING CE - RESTRUCTURING"),
                    ]);
                    plan.ce_tradingsymbol = Some(new_ce.tradingsymbol.clone());
                    plan.pe_tradingsymbol = Some(new_pe.tradingsymbol.clone());
                    plan.exited_one_side = false;
                    plan.pe_exit_one_side = false;
                    return plan;
                }
            }
        } else if let Some(target) = select::find_strike_by_delta(
            chain,
            spot,
            -ce.delta(),
            OptionType::Put,
            Bound::AtLeast,
        ) {
            if let Some(new_pe) = select::row_at(chain, target.strike, OptionType::Put) {
                plan.opens.push(OrderIntent::new(new_pe, idx, "ENTERING PE"));
                plan.pe_tradingsymbol = Some(new_pe.tradingsymbol.clone());
                plan.exited_one_side = false;
                plan.pe_exit_one_side = false;
                return plan;
            }
        }

        warn!(
            deployment = self.deployment.id,
            leg = idx,
            "Put re-entry strike not found, staying one-side exited"
        );
        plan
    }

    fn shift_candidate(
        &self,
        chain: &[InstrumentSnapshot],
        spot: Decimal,
        before_expiry_cutoff: bool,
        delta_near: f64,
        premium_near: Decimal,
        option_type: OptionType,
        delta_bound: Bound,
        premium_bound: Bound,
    ) -> Option<Candidate> {
        if before_expiry_cutoff {
            select::find_strike_by_delta(chain, spot, delta_near, option_type, delta_bound)
        } else {
            select::find_strike_by_premium(chain, spot, premium_near, option_type, premium_bound)
        }
    }

    /// Shifting: one side is "heavy" when the combined delta exceeds the
    /// lighter side's magnitude times the multiplier. The heavy side moves
    /// away from spot while it is still near the money, otherwise the light
    /// side moves in. Candidates must pass the IV continuity check, and legs
    /// priced under the premium floor are never shifted.
    pub(crate) fn plan_shift(
        &self,
        leg: &LegState,
        idx: usize,
        chain: &[InstrumentSnapshot],
        ce: &InstrumentSnapshot,
        pe: &InstrumentSnapshot,
        multiplier: f64,
        now: DateTime<Tz>,
        ctx: &DayContext,
    ) -> CyclePlan {
        let mut plan = CyclePlan::from_leg(leg);
        let spot = self.spot();
        let before_cutoff = now <= ctx.expiry_cutoff;

        let combined = ce.delta() + pe.delta();
        let light = pe.delta().abs().min(ce.delta());

        if combined > light * multiplier && ce.last_price > self.options.skip_price {
            if ce.strike - spot <= self.options.point_difference {
                // Call shift away from spot.
                let candidate = self.shift_candidate(
                    chain,
                    spot,
                    before_cutoff,
                    -pe.delta(),
                    pe.last_price,
                    OptionType::Call,
                    Bound::AtLeast,
                    Bound::AtLeast,
                );
                match candidate {
                    Some(c)
                        if c.strike != ce.strike
                            && (c.sigma - ce.sigma()).abs() < self.options.sigma_diff =>
                    {
                        if let Some(new_ce) = select::row_at(chain, c.strike, OptionType::Call) {
                            plan.closes.push(OrderIntent::new(
                                ce,
                                idx,
                                "EXIT CE - SHIFTING CALL AWAY",
                            ));
                            plan.opens.push(OrderIntent::new(
                                new_ce,
                                idx,
                                "ENTER CE - SHIFTING CALL AWAY",
                            ));
                            plan.ce_tradingsymbol = Some(new_ce.tradingsymbol.clone());
                        }
                    }
                    _ => debug!(deployment = self.deployment.id, leg = idx, "No call-away shift"),
                }
            } else {
                // Put shift in toward spot.
                let candidate = self.shift_candidate(
                    chain,
                    spot,
                    before_cutoff,
                    -ce.delta(),
                    ce.last_price,
                    OptionType::Put,
                    Bound::AtLeast,
                    Bound::AtMost,
                );
                match candidate {
                    Some(c)
                        if c.strike != pe.strike
                            && (c.sigma - ce.sigma()).abs() < self.options.sigma_diff =>
                    {
                        if let Some(new_pe) = select::row_at(chain, c.strike, OptionType::Put) {
                            plan.closes.push(OrderIntent::new(
                                pe,
                                idx,
                                "EXIT PE - SHIFTING PUT IN",
                            ));
                            plan.opens.push(OrderIntent::new(
                                new_pe,
                                idx,
                                "ENTER PE - SHIFTING PUT IN",
                            ));
                            plan.pe_tradingsymbol = Some(new_pe.tradingsymbol.clone());
                        }
                    }
                    _ => debug!(deployment = self.deployment.id, leg = idx, "No put-in shift"),
                }
            }
        } else if combined < -(light * multiplier) && pe.last_price > self.options.skip_price {
            if pe.strike - spot >= -self.options.point_difference {
                // Put shift away from spot.
                let candidate = self.shift_candidate(
                    chain,
                    spot,
                    before_cutoff,
                    -ce.delta(),
                    ce.last_price,
                    OptionType::Put,
                    Bound::AtMost,
                    Bound::AtLeast,
                );
                match candidate {
                    Some(c)
                        if c.strike != pe.strike
                            && (c.sigma - pe.sigma()).abs() < self.options.sigma_diff =>
                    {
                        if let Some(new_pe) = select::row_at(chain, c.strike, OptionType::Put) {
                            plan.closes.push(OrderIntent::new(
                                pe,
                                idx,
                                "EXIT PE - SHIFTING PUT AWAY",
                            ));
                            plan.opens.push(OrderIntent::new(
                                new_pe,
                                idx,
                                "ENTER PE - SHIFTING PUT AWAY",
                            ));
                            plan.pe_tradingsymbol = Some(new_pe.tradingsymbol.clone());
                        }
                    }
                    _ => debug!(deployment = self.deployment.id, leg = idx, "No put-away shift"),
                }
            } else {
                // Call shift in toward spot.
                let candidate = self.shift_candidate(
                    chain,
                    spot,
                    before_cutoff,
                    -pe.delta(),
                    pe.last_price,
                    OptionType::Call,
                    Bound::AtMost,
                    Bound::AtMost,
                );
                match candidate {
                    Some(c)
                        if c.strike != ce.strike
                            && (c.sigma - ce.sigma()).abs() < self.options.sigma_diff =>
                    {
                        if let Some(new_ce) = select::row_at(chain, c.strike, OptionType::Call) {
                            plan.closes.push(OrderIntent::new(
                                ce,
                                idx,
                                "EXIT CE - SHIFTING CALL IN",
                            ));
                            plan.opens.push(OrderIntent::new(
                                new_ce,
                                idx,
                                "ENTER CE - SHIFTING CALL IN",
                            ));
                            plan.ce_tradingsymbol = Some(new_ce.tradingsymbol.clone());
                        }
                    }
                    _ => debug!(deployment = self.deployment.id, leg = idx, "No call-in shift"),
                }
            }
        }

        plan
    }

    /// One leg group's full decision for this cycle.
    pub(crate) fn plan_leg(
        &self,
        idx: usize,
        leg: &LegState,
        chain: &[InstrumentSnapshot],
        features: &HashMap<usize, WindowFeatures>,
        params: &DayParams,
        variant: crate::params::ExitVariant,
        now: DateTime<Tz>,
        ctx: &DayContext,
    ) -> Result<CyclePlan, StrategyError> {
        let held = self.store.one_side_hold(self.deployment.id, idx);
        let before_cutoffs = now < ctx.oneside_cutoff && now < ctx.expiry_cutoff;
        let decision = signal::decide(features, leg, params, variant, held, before_cutoffs);

        if leg.exited_one_side {
            if decision.reenter_ce && leg.ce_exit_one_side {
                let pe_symbol = leg
                    .pe_tradingsymbol
                    .as_deref()
                    .ok_or(StrategyError::SignalUnusable)?;
                let pe = self.leg_row(chain, pe_symbol)?;
                return Ok(self.plan_ce_reentry(leg, idx, chain, pe, now, ctx));
            }
            if decision.reenter_pe && leg.pe_exit_one_side {
                let ce_symbol = leg
                    .ce_tradingsymbol
                    .as_deref()
                    .ok_or(StrategyError::SignalUnusable)?;
                let ce = self.leg_row(chain, ce_symbol)?;
                return Ok(self.plan_pe_reentry(leg, idx, chain, ce, now, ctx));
            }
            return Ok(CyclePlan::from_leg(leg));
        }

        let (Some(ce_symbol), Some(pe_symbol)) =
            (leg.ce_tradingsymbol.as_deref(), leg.pe_tradingsymbol.as_deref())
        else {
            return Ok(CyclePlan::from_leg(leg));
        };
        let ce = self.leg_row(chain, ce_symbol)?;
        let pe = self.leg_row(chain, pe_symbol)?;

        if decision.exit_ce {
            return Ok(Self::plan_ce_exit(leg, idx, ce));
        }
        if decision.exit_pe {
            return Ok(Self::plan_pe_exit(leg, idx, pe));
        }
        Ok(self.plan_shift(leg, idx, chain, ce, pe, self.options.multiplier, now, ctx))
    }

    // ---- commit and dispatch ----

    /// Orders opening exposure take the deployment's entry side; closing
    /// orders take the opposite.
    pub(crate) async fn dispatch(
        &self,
        closes: Vec<OrderIntent>,
        opens: Vec<OrderIntent>,
    ) -> Result<()> {
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

    pub(crate) fn registry_users(&self) -> Vec<delta_desk_core::types::UserAllocation> {
        self.store
            .deployments()
            .get(&self.deployment.id.to_string())
            .map(|s| s.users.clone())
            .unwrap_or_default()
    }

    pub(crate) fn commit_leg(&self, idx: usize, plan: &CyclePlan) {
        let id = self.deployment.id;
        self.store.update::<Vec<LegState>, _>(&keys::legs(id), |legs| {
            if let Some(leg) = legs.get_mut(idx) {
                plan.apply_to_leg(leg);
            }
        });
    }

    /// Running P&L in premium points against the entry baseline.
    fn running_points(&self, chain: &[InstrumentSnapshot]) -> Decimal {
        let entry: Decimal = self
            .store
            .get(&keys::entry_premium(self.deployment.id))
            .unwrap_or_default();
        let current = self.legs_premium(chain, &self.store.legs(self.deployment.id));
        if self.deployment.position_direction() < 0 {
            entry - current
        } else {
            current - entry
        }
    }

    fn legs_premium(&self, chain: &[InstrumentSnapshot], legs: &[LegState]) -> Decimal {
        legs.iter()
            .flat_map(|leg| {
                [leg.ce_tradingsymbol.as_deref(), leg.pe_tradingsymbol.as_deref()]
            })
            .flatten()
            .filter_map(|symbol| select::row_by_symbol(chain, symbol))
            .map(|row| row.last_price)
            .sum()
    }

    fn stop_loss_breached(&self, chain: &[InstrumentSnapshot]) -> bool {
        let stop: Decimal = self
            .store
            .get(&keys::stop_loss(self.deployment.id))
            .unwrap_or_default();
        if stop <= Decimal::ZERO {
            return false;
        }
        self.running_points(chain) + stop <= Decimal::ZERO
    }

    // ---- lifecycle ----

    /// Selects entry legs for every profile and dispatches the entry orders.
    /// Retries on a thin chain instead of committing a partial leg set.
    ///
    /// # Errors
    ///
    /// Returns an error when the daily context is unavailable or dispatch
    /// fails outright.
    pub async fn place_entry(&self) -> Result<()> {
        let ctx = self.day_context().context("entry aborted")?;
        let id = self.deployment.id;

        self.store.update_deployments(|registry| {
            if let Some(state) = registry.get_mut(&id.to_string()) {
                state.lifecycle = DeploymentLifecycle::Entering;
            }
        });

        loop {
            let chain = self.chain();
            let mut legs = Vec::with_capacity(self.profiles.len());
            let mut opens = Vec::new();
            let mut entry_premium = Decimal::ZERO;
            let mut incomplete = false;

            for (idx, profile) in self.profiles.iter().enumerate() {
                let day = profile.day_params(ctx.days_left).map_err(anyhow::Error::new)?;
                let Some((ce, pe)) = select::entry_pair(&chain, day.min_delta, self.options.max_delta)
                else {
                    warn!(
                        deployment = id,
                        profile = %profile.name,
                        "Entry strike not found, retrying"
                    );
                    incomplete = true;
                    break;
                };
                opens.extend([
                    OrderIntent::new(pe, idx, "ENTERING PE"),
                    OrderIntent::new(ce, idx, "ENTERING CE"),
                ]);
                entry_premium += ce.last_price + pe.last_price;
                let mut leg = LegState::entered(
                    &ce.partition,
                    &profile.name,
                    self.deployment.position_direction(),
                );
                leg.ce_tradingsymbol = Some(ce.tradingsymbol.clone());
                leg.pe_tradingsymbol = Some(pe.tradingsymbol.clone());
                legs.push(leg);
            }

            if incomplete {
                tokio::time::sleep(STRIKE_RETRY).await;
                continue;
            }

            self.store.set_legs(id, &legs);
            self.store.set(&keys::entry_premium(id), &entry_premium);
            self.dispatch(Vec::new(), opens).await?;
            self.store.update_deployments(|registry| {
                if let Some(state) = registry.get_mut(&id.to_string()) {
                    state.lifecycle = DeploymentLifecycle::Active;
                }
            });
            info!(deployment = id, legs = legs.len(), "Strategy entered");
            return Ok(());
        }
    }

    /// Unconditional unwind of every remaining leg; clears leg state and the
    /// registry entry.
    ///
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
        let legs = self.store.legs(id);
        let mut closes = Vec::new();
        for (idx, leg) in legs.iter().enumerate() {
            for symbol in [leg.ce_tradingsymbol.as_deref(), leg.pe_tradingsymbol.as_deref()]
                .into_iter()
                .flatten()
            {
                match self.leg_row(&chain, symbol) {
                    Ok(row) => closes.push(OrderIntent::new(row, idx, "EXIT - EXIT ALGO")),
                    Err(e) => error!(deployment = id, leg = idx, error = %e, "Exit row missing"),
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
        if let Err(e) = self.exec.refresh_broker_state(self.deployment.broker).await {
            warn!(deployment = id, error = %e, "Position refresh failed");
        }
        info!(deployment = id, "Strategy exited");
        outcome
    }

    /// Tick-aligned decision loop, running until exit time, a stop-loss
    /// breach, or removal from the active registry.
    pub async fn run(&self) -> Result<()> {
        let exit_at = clock::today_at(self.options.exit_time);
        let entry_at = clock::today_at(self.entry_time_override());
        clock::sleep_until(entry_at).await;

        if self.store.legs(self.deployment.id).is_empty() {
            self.place_entry().await?;
        }
        clock::sleep_until_aligned(self.options.sleep_time).await;

        loop {
            if clock::now() >= exit_at || !self.store.deployment_running(self.deployment.id) {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                error!(deployment = self.deployment.id, error = %e, "Cycle failed");
            }
            if !self.store.deployment_running(self.deployment.id) {
                break;
            }
            clock::sleep_until_aligned(self.options.sleep_time).await;
        }

        self.place_exit().await
    }

    /// Entry time, with any operator override from the store.
    fn entry_time_override(&self) -> NaiveTime {
        self.store
            .get(&keys::entry_time(self.deployment.id))
            .unwrap_or(self.options.entry_time)
    }

    async fn run_cycle(&self) -> Result<()> {
        let ctx = self.day_context().map_err(anyhow::Error::new)?;
        let now = clock::now();
        let chain = self.chain();
        let features = self.features();
        let legs = self.store.legs(self.deployment.id);

        for (idx, leg) in legs.iter().enumerate() {
            let Some(profile) = self.profiles.get(idx) else {
                continue;
            };
            let variant = profile.variant_for(ctx.days_left);
            let day = match profile.day_params(ctx.days_left) {
                Ok(day) => day,
                Err(e) => {
                    warn!(deployment = self.deployment.id, leg = idx, error = %e, "No day parameters");
                    continue;
                }
            };

            let plan = match self.plan_leg(idx, leg, &chain, &features, &day, variant, now, &ctx) {
                Ok(plan) => plan,
                Err(StrategyError::MissingInstrument(symbol)) => {
                    warn!(
                        deployment = self.deployment.id,
                        leg = idx,
                        symbol,
                        "Leg instrument missing from snapshot, skipping cycle"
                    );
                    continue;
                }
                Err(e) => {
                    debug!(deployment = self.deployment.id, leg = idx, error = %e, "No transition");
                    continue;
                }
            };

            if !plan.is_noop() {
                self.commit_leg(idx, &plan);
                self.dispatch(plan.closes, plan.opens).await?;
            }
        }

        if self.stop_loss_breached(&chain) {
            warn!(deployment = self.deployment.id, "Stop loss breached");
            self.store.update_deployments(|registry| {
                if let Some(state) = registry.get_mut(&self.deployment.id.to_string()) {
                    state.lifecycle = DeploymentLifecycle::Exiting;
                }
            });
        }

        Ok(())
    }
}
