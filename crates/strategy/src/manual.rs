//! Operator-initiated transitions, invoked outside the signal loop.
//!
//! Every manual operation reuses the same planning and dispatch primitives
//! as the automatic cycle, so committed leg state and the order trail stay
//! consistent regardless of who initiated the change.

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use tracing::info;

use delta_desk_core::store::keys;
use delta_desk_core::types::{OptionType, OrderIntent, Side, UserAllocation};

use crate::engine::{CyclePlan, DeltaStrangleEngine};
use crate::error::StrategyError;
use crate::select;

/// Manual shifts probe with a near-zero multiplier so the heavy-side branch
/// is taken whenever the strangle is even slightly unbalanced.
const MANUAL_SHIFT_MULTIPLIER: f64 = 0.1;

impl DeltaStrangleEngine {
    fn leg_at(&self, idx: usize) -> Result<delta_desk_core::types::LegState> {
        self.store
            .legs(self.deployment.id)
            .get(idx)
            .cloned()
            .ok_or_else(|| anyhow!("deployment {} has no leg {idx}", self.deployment.id))
    }

    async fn commit_and_dispatch(&self, idx: usize, plan: CyclePlan) -> Result<()> {
        self.commit_leg(idx, &plan);
        self.dispatch(plan.closes, plan.opens).await
    }

    /// Forces a one-side exit of the given leg's call or put.
    ///
    /// # Errors
    ///
    /// Fails when the leg is already one-side exited, the side holds no
    /// position, or the exit orders do not complete.
    pub async fn manual_exit(&self, idx: usize, option_type: OptionType) -> Result<()> {
        let leg = self.leg_at(idx)?;
        if leg.exited_one_side {
            return Err(anyhow!(
                "leg {idx} of deployment {} is already one-side exited",
                self.deployment.id
            ));
        }
        let chain = self.chain();
        let mut plan = CyclePlan::from_leg(&leg);
        match option_type {
            OptionType::Call => {
                let symbol = leg
                    .ce_tradingsymbol
                    .as_deref()
                    .ok_or_else(|| anyhow!("leg {idx} holds no call"))?;
                let row = self.leg_row(&chain, symbol)?;
                plan.closes.push(OrderIntent::new(row, idx, "EXIT CE - MANUAL"));
                plan.ce_tradingsymbol = None;
                plan.ce_exit_one_side = true;
            }
            OptionType::Put => {
                let symbol = leg
                    .pe_tradingsymbol
                    .as_deref()
                    .ok_or_else(|| anyhow!("leg {idx} holds no put"))?;
                let row = self.leg_row(&chain, symbol)?;
                plan.closes.push(OrderIntent::new(row, idx, "EXIT PE - MANUAL"));
                plan.pe_tradingsymbol = None;
                plan.pe_exit_one_side = true;
            }
        }
        plan.exited_one_side = true;
        info!(deployment = self.deployment.id, leg = idx, side = %option_type, "Manual exit");
        self.commit_and_dispatch(idx, plan).await
    }

    /// Re-enters the exited side of a one-side-exited leg and arms the hold
    /// flag so the signal loop does not immediately exit it again.
    ///
    /// # Errors
    ///
    /// Fails when the leg is not one-side exited, no candidate strike
    /// qualifies, or the orders do not complete.
    pub async fn manual_reentry(&self, idx: usize) -> Result<()> {
        let leg = self.leg_at(idx)?;
        if !leg.exited_one_side {
            return Err(anyhow!(
                "leg {idx} of deployment {} is not one-side exited",
                self.deployment.id
            ));
        }
        let chain = self.chain();
        let ctx = self.day_context()?;
        let now = delta_desk_core::clock::now();

        let plan = if leg.ce_exit_one_side {
            let symbol = leg
                .pe_tradingsymbol
                .as_deref()
                .ok_or_else(|| anyhow!("leg {idx} holds no surviving put"))?;
            let pe = self.leg_row(&chain, symbol)?;
            self.plan_ce_reentry(&leg, idx, &chain, pe, now, &ctx)
        } else {
            let symbol = leg
                .ce_tradingsymbol
                .as_deref()
                .ok_or_else(|| anyhow!("leg {idx} holds no surviving call"))?;
            let ce = self.leg_row(&chain, symbol)?;
            self.plan_pe_reentry(&leg, idx, &chain, ce, now, &ctx)
        };
        if plan.exited_one_side {
            return Err(StrategyError::StrikeNotFound(format!(
                "no re-entry strike for leg {idx} of deployment {}",
                self.deployment.id
            ))
            .into());
        }

        info!(deployment = self.deployment.id, leg = idx, "Manual re-entry");
        self.commit_and_dispatch(idx, plan).await?;
        self.store.set_one_side_hold(self.deployment.id, idx, true);
        Ok(())
    }

    /// Runs one shift evaluation with the manual multiplier, which moves a
    /// leg on much smaller imbalance than the automatic cycle would.
    ///
    /// # Errors
    ///
    /// Fails when the leg is incomplete or the shift orders do not complete.
    pub async fn manual_shift_pair(&self, idx: usize) -> Result<()> {
        let leg = self.leg_at(idx)?;
        let (Some(ce_symbol), Some(pe_symbol)) =
            (leg.ce_tradingsymbol.clone(), leg.pe_tradingsymbol.clone())
        else {
            return Err(anyhow!("leg {idx} is not a complete strangle"));
        };
        let chain = self.chain();
        let ctx = self.day_context()?;
        let now = delta_desk_core::clock::now();
        let ce = self.leg_row(&chain, &ce_symbol)?;
        let pe = self.leg_row(&chain, &pe_symbol)?;

        let plan = self.plan_shift(&leg, idx, &chain, ce, pe, MANUAL_SHIFT_MULTIPLIER, now, &ctx);
        info!(
            deployment = self.deployment.id,
            leg = idx,
            moved = !plan.closes.is_empty(),
            "Manual shift"
        );
        self.commit_and_dispatch(idx, plan).await
    }

    /// Moves one side of a leg a fixed number of points away from spot: calls
    /// shift down by `points`, puts shift up.
    ///
    /// # Errors
    ///
    /// Fails when the side is one-side exited, the target strike has no chain
    /// row, or the orders do not complete.
    pub async fn manual_shift_single(
        &self,
        idx: usize,
        option_type: OptionType,
        points: Decimal,
    ) -> Result<()> {
        let leg = self.leg_at(idx)?;
        let chain = self.chain();
        let mut plan = CyclePlan::from_leg(&leg);

        match option_type {
            OptionType::Call => {
                if leg.ce_exit_one_side {
                    return Err(anyhow!("call side of leg {idx} is one-side exited"));
                }
                let symbol = leg
                    .ce_tradingsymbol
                    .as_deref()
                    .ok_or_else(|| anyhow!("leg {idx} holds no call"))?;
                let current = self.leg_row(&chain, symbol)?;
                let target = current.strike - points;
                let new_row = select::row_at(&chain, target, OptionType::Call)
                    .ok_or(StrategyError::StrikeNotFound(format!("{target} CE")))?;
                plan.closes
                    .push(OrderIntent::new(current, idx, "EXIT CE - MANUAL SHIFT"));
                plan.opens
                    .push(OrderIntent::new(new_row, idx, "ENTER CE - MANUAL SHIFT"));
                plan.ce_tradingsymbol = Some(new_row.tradingsymbol.clone());
            }
            OptionType::Put => {
                if leg.pe_exit_one_side {
                    return Err(anyhow!("put side of leg {idx} is one-side exited"));
                }
                let symbol = leg
                    .pe_tradingsymbol
                    .as_deref()
                    .ok_or_else(|| anyhow!("leg {idx} holds no put"))?;
                let current = self.leg_row(&chain, symbol)?;
                let target = current.strike + points;
                let new_row = select::row_at(&chain, target, OptionType::Put)
                    .ok_or(StrategyError::StrikeNotFound(format!("{target} PE")))?;
                plan.closes
                    .push(OrderIntent::new(current, idx, "EXIT PE - MANUAL SHIFT"));
                plan.opens
                    .push(OrderIntent::new(new_row, idx, "ENTER PE - MANUAL SHIFT"));
                plan.pe_tradingsymbol = Some(new_row.tradingsymbol.clone());
            }
        }

        info!(
            deployment = self.deployment.id,
            leg = idx,
            side = %option_type,
            %points,
            "Manual single-strike shift"
        );
        self.commit_and_dispatch(idx, plan).await
    }

    /// Suspends automatic one-side exits for one leg.
    pub fn hold(&self, idx: usize) {
        self.store.set_one_side_hold(self.deployment.id, idx, true);
    }

    /// Resumes automatic one-side exits for one leg.
    pub fn release(&self, idx: usize) {
        self.store.set_one_side_hold(self.deployment.id, idx, false);
    }

    pub fn set_stop_loss(&self, points: Decimal) {
        self.store.set(&keys::stop_loss(self.deployment.id), &points);
    }

    /// Brings late-joining users into the running position: entry-side orders
    /// at the current legs for the new users only, then a registry update.
    ///
    /// # Errors
    ///
    /// Fails when the joining orders do not complete; the registry is only
    /// updated after they do.
    pub async fn users_entry(&self, mut joining: Vec<UserAllocation>) -> Result<()> {
        let id = self.deployment.id;
        let existing = self.registry_users();
        joining.retain(|u| !existing.iter().any(|e| e.username == u.username));
        if joining.is_empty() {
            return Ok(());
        }
        for user in &mut joining {
            user.rebalance(self.profiles.len(), self.deployment.lot_size);
        }

        let opens = self.open_leg_intents()?;
        let (buys, sells) = match self.deployment.entry_side {
            Side::Sell => (Vec::new(), opens),
            Side::Buy => (opens, Vec::new()),
        };
        self.exec
            .place_batch(&self.deployment.underlying, &joining, &buys, &sells)
            .await?;

        info!(deployment = id, joining = joining.len(), "Users joined mid-flight");
        self.store.update_deployments(|registry| {
            if let Some(state) = registry.get_mut(&id.to_string()) {
                state.users.extend(joining.clone());
            }
        });
        Ok(())
    }

    /// Takes leaving users out of the running position with opposite-side
    /// orders, then drops them from the registry.
    ///
    /// # Errors
    ///
    /// Fails when the unwinding orders do not complete; the registry is only
    /// updated after they do.
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

        let closes = self.open_leg_intents()?;
        let (buys, sells) = match self.deployment.entry_side {
            Side::Sell => (closes, Vec::new()),
            Side::Buy => (Vec::new(), closes),
        };
        self.exec
            .place_batch(&self.deployment.underlying, &leaving, &buys, &sells)
            .await?;

        info!(deployment = id, leaving = leaving.len(), "Users left mid-flight");
        self.store.update_deployments(|registry| {
            if let Some(state) = registry.get_mut(&id.to_string()) {
                state.users.retain(|u| !usernames.contains(&u.username));
            }
        });
        Ok(())
    }

    /// Changes one user's lot count mid-flight. The per-profile difference is
    /// traded out directly: grown profiles get entry-side orders, shrunk
    /// profiles get the opposite, and the registry records the new split.
    ///
    /// # Errors
    ///
    /// Fails when the user is not allocated to this deployment or an
    /// adjustment order does not complete; the registry is only updated after
    /// all adjustments fill.
    pub async fn set_user_lots(&self, username: &str, lots: u32) -> Result<()> {
        let id = self.deployment.id;
        let current = self
            .registry_users()
            .into_iter()
            .find(|u| u.username == username)
            .ok_or_else(|| anyhow!("user {username} is not allocated to deployment {id}"))?;

        let mut updated = current.clone();
        updated.lots = lots;
        updated.rebalance(self.profiles.len(), self.deployment.lot_size);

        let chain = self.chain();
        for (idx, leg) in self.store.legs(id).iter().enumerate() {
            let before = i64::from(current.quantity_multiples.get(idx).copied().unwrap_or(0));
            let after = i64::from(updated.quantity_multiples.get(idx).copied().unwrap_or(0));
            let diff = after - before;
            if diff == 0 {
                continue;
            }
            let side = if diff > 0 {
                self.deployment.entry_side
            } else {
                self.deployment.entry_side.opposite()
            };

            for symbol in [leg.ce_tradingsymbol.as_deref(), leg.pe_tradingsymbol.as_deref()]
                .into_iter()
                .flatten()
            {
                let row = self.leg_row(&chain, symbol)?;
                self.exec
                    .place_direct(
                        current.broker,
                        username,
                        &self.deployment.underlying,
                        &row.tradingsymbol,
                        &row.partition,
                        side,
                        diff.unsigned_abs() as u32,
                    )
                    .await?;
            }
        }

        info!(deployment = id, username, lots, "User quantity changed");
        self.store.update_deployments(|registry| {
            if let Some(state) = registry.get_mut(&id.to_string()) {
                if let Some(user) = state.users.iter_mut().find(|u| u.username == username) {
                    *user = updated.clone();
                }
            }
        });
        Ok(())
    }

    /// One intent per currently held side of every leg.
    fn open_leg_intents(&self) -> Result<Vec<OrderIntent>> {
        let chain = self.chain();
        let mut intents = Vec::new();
        for (idx, leg) in self.store.legs(self.deployment.id).iter().enumerate() {
            for symbol in [leg.ce_tradingsymbol.as_deref(), leg.pe_tradingsymbol.as_deref()]
                .into_iter()
                .flatten()
            {
                let row = self.leg_row(&chain, symbol)?;
                intents.push(OrderIntent::new(row, idx, "USER REBALANCE"));
            }
        }
        Ok(intents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use delta_desk_core::types::BrokerKind;
    use delta_desk_execution::BrokerAdapter;

    use crate::engine::tests::{engine_with, entered_leg, greek_row};
    use delta_desk_core::types::OptionType as Opt;

    fn sim_of(engine: &DeltaStrangleEngine) -> std::sync::Arc<dyn BrokerAdapter> {
        engine.exec.adapter(BrokerKind::Sim).unwrap()
    }

    #[tokio::test]
    async fn manual_exit_closes_one_side_only() {
        let chain = vec![
            greek_row("C50100", dec!(50100), Opt::Call, dec!(180), 0.30, 0.12),
            greek_row("P49900", dec!(49900), Opt::Put, dec!(170), -0.30, 0.12),
        ];
        let engine = engine_with(&chain);
        engine
            .store
            .set_legs(7, &[entered_leg(Some("C50100"), Some("P49900"))]);

        engine.manual_exit(0, Opt::Call).await.unwrap();

        let legs = engine.store.legs(7);
        assert!(legs[0].ce_tradingsymbol.is_none());
        assert_eq!(legs[0].pe_tradingsymbol.as_deref(), Some("P49900"));
        assert!(legs[0].exited_one_side);
        assert!(legs[0].ce_exit_one_side);

        // A second manual exit is rejected while one side is already out.
        assert!(engine.manual_exit(0, Opt::Put).await.is_err());
    }

    #[tokio::test]
    async fn manual_reentry_arms_the_hold_flag() {
        let chain = vec![
            greek_row("C50150", dec!(50150), Opt::Call, dec!(130), 0.38, 0.12),
            greek_row("P49900", dec!(49900), Opt::Put, dec!(140), -0.40, 0.12),
        ];
        let engine = engine_with(&chain);
        let mut leg = entered_leg(None, Some("P49900"));
        leg.exited_one_side = true;
        leg.ce_exit_one_side = true;
        engine.store.set_legs(7, &[leg]);

        engine.manual_reentry(0).await.unwrap();

        let legs = engine.store.legs(7);
        assert_eq!(legs[0].ce_tradingsymbol.as_deref(), Some("C50150"));
        assert!(!legs[0].exited_one_side);
        assert!(engine.store.one_side_hold(7, 0));
    }

    #[tokio::test]
    async fn single_strike_shift_moves_the_put_up() {
        let chain = vec![
            greek_row("C50100", dec!(50100), Opt::Call, dec!(180), 0.30, 0.12),
            greek_row("P49800", dec!(49800), Opt::Put, dec!(120), -0.25, 0.12),
            greek_row("P49900", dec!(49900), Opt::Put, dec!(170), -0.30, 0.12),
        ];
        let engine = engine_with(&chain);
        engine
            .store
            .set_legs(7, &[entered_leg(Some("C50100"), Some("P49800"))]);

        engine
            .manual_shift_single(0, Opt::Put, dec!(100))
            .await
            .unwrap();

        let legs = engine.store.legs(7);
        assert_eq!(legs[0].pe_tradingsymbol.as_deref(), Some("P49900"));
    }

    #[tokio::test]
    async fn joining_user_gets_entry_orders_only_for_itself() {
        let chain = vec![
            greek_row("C50100", dec!(50100), Opt::Call, dec!(180), 0.30, 0.12),
            greek_row("P49900", dec!(49900), Opt::Put, dec!(170), -0.30, 0.12),
        ];
        let engine = engine_with(&chain);
        engine
            .store
            .set_legs(7, &[entered_leg(Some("C50100"), Some("P49900"))]);

        let joining = vec![UserAllocation {
            username: "u2".to_string(),
            broker: BrokerKind::Sim,
            alternate_broker: None,
            lots: 2,
            quantity_multiples: vec![],
        }];
        engine.users_entry(joining).await.unwrap();

        let users = engine.registry_users();
        assert_eq!(users.len(), 2);
        let u2 = users.iter().find(|u| u.username == "u2").unwrap();
        assert_eq!(u2.quantity_multiples, vec![50]);

        let positions = sim_of(&engine)
            .positions(&["u2".to_string()])
            .await
            .unwrap();
        let sold: i64 = positions.iter().map(|p| p.sell_qty).sum();
        assert_eq!(sold, 100);
    }

    #[tokio::test]
    async fn lot_change_trades_the_difference() {
        let chain = vec![
            greek_row("C50100", dec!(50100), Opt::Call, dec!(180), 0.30, 0.12),
            greek_row("P49900", dec!(49900), Opt::Put, dec!(170), -0.30, 0.12),
        ];
        let engine = engine_with(&chain);
        engine
            .store
            .set_legs(7, &[entered_leg(Some("C50100"), Some("P49900"))]);

        // 3 lots -> 5 lots of 25, so each leg grows by 50.
        engine.set_user_lots("u1", 5).await.unwrap();

        let users = engine.registry_users();
        assert_eq!(users[0].quantity_multiples, vec![125]);

        let positions = sim_of(&engine)
            .positions(&["u1".to_string()])
            .await
            .unwrap();
        let sold: i64 = positions.iter().map(|p| p.sell_qty).sum();
        assert_eq!(sold, 100);
    }

    #[tokio::test]
    async fn leaving_user_is_unwound_and_dropped() {
        let chain = vec![
            greek_row("C50100", dec!(50100), Opt::Call, dec!(180), 0.30, 0.12),
            greek_row("P49900", dec!(49900), Opt::Put, dec!(170), -0.30, 0.12),
        ];
        let engine = engine_with(&chain);
        engine
            .store
            .set_legs(7, &[entered_leg(Some("C50100"), Some("P49900"))]);

        engine.users_exit(&["u1".to_string()]).await.unwrap();

        assert!(engine.registry_users().is_empty());
        let positions = sim_of(&engine)
            .positions(&["u1".to_string()])
            .await
            .unwrap();
        let bought: i64 = positions.iter().map(|p| p.buy_qty).sum();
        assert_eq!(bought, 150);
    }
}
