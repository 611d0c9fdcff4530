//! One-side exit and re-entry decisions from OI-change features.
//!
//! The held call-minus-put spread at the profile's exit window is the
//! primary trigger; a confirmation on the absolute-change ratio at the
//! confirmation window filters out cycles where both sides are building
//! together. Missing or non-finite feature rows never trigger anything.

use std::collections::HashMap;

use delta_desk_analytics::WindowFeatures;
use delta_desk_core::types::LegState;

use crate::params::{DayParams, ExitVariant};

/// Confirmation window in tick-cycle units.
pub const CONFIRM_WINDOW: usize = 72;

/// Ratio bound confirming put-side OI dominance.
const CONFIRM_RATIO: f64 = 1.4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OneSideDecision {
    pub exit_ce: bool,
    pub exit_pe: bool,
    pub reenter_ce: bool,
    pub reenter_pe: bool,
}

fn usable(features: &HashMap<usize, WindowFeatures>, window: usize) -> Option<&WindowFeatures> {
    features.get(&window).filter(|row| row.usable())
}

/// Put-dominance confirmation for a CE exit. Passes when the put side is
/// clearly building faster than the call side, or when either side's
/// absolute change is non-positive and the ratio carries no information.
fn confirms_ce_exit(confirm: &WindowFeatures) -> bool {
    (confirm.pe_oi_abs_change > 0.0
        && confirm.ce_oi_abs_change > 0.0
        && confirm.pe_by_ce_abs_change > CONFIRM_RATIO)
        || confirm.pe_oi_abs_change <= 0.0
        || confirm.ce_oi_abs_change <= 0.0
}

fn confirms_pe_exit(confirm: &WindowFeatures) -> bool {
    (confirm.pe_oi_abs_change > 0.0
        && confirm.ce_oi_abs_change > 0.0
        && confirm.pe_by_ce_abs_change < 1.0 / CONFIRM_RATIO)
        || confirm.pe_oi_abs_change <= 0.0
        || confirm.ce_oi_abs_change <= 0.0
}

/// Evaluates one leg's one-side exit / re-entry signals for this cycle.
///
/// `before_cutoffs` is the conjunction of the time-of-day and days-to-expiry
/// gates; a held leg never exits automatically but may still re-enter.
#[must_use]
pub fn decide(
    features: &HashMap<usize, WindowFeatures>,
    leg: &LegState,
    params: &DayParams,
    variant: ExitVariant,
    held: bool,
    before_cutoffs: bool,
) -> OneSideDecision {
    let mut decision = OneSideDecision::default();
    if variant == ExitVariant::None {
        return decision;
    }

    if !leg.exited_one_side && before_cutoffs && !held {
        let Some(exit_row) = usable(features, params.exit_window) else {
            return decision;
        };
        let Some(confirm) = usable(features, CONFIRM_WINDOW) else {
            return decision;
        };

        let ce_secondary = match variant {
            ExitVariant::Check => exit_row.ce_oi_change <= params.less_than,
            _ => true,
        };
        let pe_secondary = match variant {
            ExitVariant::Check => exit_row.pe_oi_change <= params.less_than,
            _ => true,
        };

        if exit_row.pe_minus_ce_held > params.change && ce_secondary && confirms_ce_exit(confirm) {
            decision.exit_ce = true;
        } else if exit_row.ce_minus_pe_held > params.change
            && pe_secondary
            && confirms_pe_exit(confirm)
        {
            decision.exit_pe = true;
        }
    } else if leg.exited_one_side {
        let Some(reentry_row) = usable(features, params.reentry_window) else {
            return decision;
        };
        if leg.ce_exit_one_side && reentry_row.ce_minus_pe_held > params.reentry_oi {
            decision.reenter_ce = true;
        } else if leg.pe_exit_one_side && reentry_row.pe_minus_ce_held > params.reentry_oi {
            decision.reenter_pe = true;
        }
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features_with(
        window: usize,
        pe_minus_ce: f64,
        ce_minus_pe: f64,
        ratio: f64,
    ) -> HashMap<usize, WindowFeatures> {
        let mut map = HashMap::new();
        map.insert(
            window,
            WindowFeatures {
                window,
                ce_oi_change: 0.001,
                pe_oi_change: 0.001,
                ce_minus_pe_change: ce_minus_pe,
                ce_minus_pe_held: ce_minus_pe,
                pe_minus_ce_held: pe_minus_ce,
                ce_oi_abs_change: 1000.0,
                pe_oi_abs_change: 1000.0,
                pe_by_ce_abs_change: ratio,
            },
        );
        if window != CONFIRM_WINDOW {
            map.insert(
                CONFIRM_WINDOW,
                WindowFeatures {
                    window: CONFIRM_WINDOW,
                    ce_oi_change: 0.001,
                    pe_oi_change: 0.001,
                    ce_minus_pe_change: ce_minus_pe,
                    ce_minus_pe_held: ce_minus_pe,
                    pe_minus_ce_held: pe_minus_ce,
                    ce_oi_abs_change: 1000.0,
                    pe_oi_abs_change: 1000.0,
                    pe_by_ce_abs_change: ratio,
                },
            );
        }
        map
    }

    fn day_params() -> DayParams {
        DayParams {
            min_delta: 0.25,
            change: 0.02,
            reentry_oi: 0.03,
            less_than: f64::MAX,
            exit_window: 72,
            reentry_window: 24,
        }
    }

    fn entered_leg() -> LegState {
        let mut leg = LegState::entered("1", "p1", -1);
        leg.ce_tradingsymbol = Some("CE".to_string());
        leg.pe_tradingsymbol = Some("PE".to_string());
        leg
    }

    #[test]
    fn strong_put_spread_exits_the_call() {
        let features = features_with(72, 0.05, -0.05, 2.0);
        let decision = decide(
            &features,
            &entered_leg(),
            &day_params(),
            ExitVariant::WithoutCheck,
            false,
            true,
        );
        assert!(decision.exit_ce);
        assert!(!decision.exit_pe);
    }

    #[test]
    fn ratio_inside_band_blocks_the_exit() {
        // Spread fires but both sides build at a similar pace.
        let features = features_with(72, 0.05, -0.05, 1.1);
        let decision = decide(
            &features,
            &entered_leg(),
            &day_params(),
            ExitVariant::WithoutCheck,
            false,
            true,
        );
        assert_eq!(decision, OneSideDecision::default());
    }

    #[test]
    fn hold_flag_skips_exit_regardless_of_signal() {
        let features = features_with(72, 0.50, -0.50, 5.0);
        let decision = decide(
            &features,
            &entered_leg(),
            &day_params(),
            ExitVariant::WithoutCheck,
            true,
            true,
        );
        assert_eq!(decision, OneSideDecision::default());
    }

    #[test]
    fn after_cutoff_no_exit_fires() {
        let features = features_with(72, 0.50, -0.50, 5.0);
        let decision = decide(
            &features,
            &entered_leg(),
            &day_params(),
            ExitVariant::WithoutCheck,
            false,
            false,
        );
        assert_eq!(decision, OneSideDecision::default());
    }

    #[test]
    fn check_variant_enforces_secondary_ceiling() {
        let mut features = features_with(72, 0.05, -0.05, 2.0);
        let mut params = day_params();
        params.less_than = 0.0001;
        if let Some(row) = features.get_mut(&72) {
            row.ce_oi_change = 0.01;
        }
        let decision = decide(
            &features,
            &entered_leg(),
            &params,
            ExitVariant::Check,
            false,
            true,
        );
        assert!(!decision.exit_ce);
    }

    #[test]
    fn reverse_spread_reenters_the_exited_side() {
        let features = features_with(24, -0.01, 0.06, 1.0);
        let mut leg = entered_leg();
        leg.exited_one_side = true;
        leg.ce_exit_one_side = true;
        leg.ce_tradingsymbol = None;
        let decision = decide(
            &features,
            &leg,
            &day_params(),
            ExitVariant::WithoutCheck,
            false,
            true,
        );
        assert!(decision.reenter_ce);
    }

    #[test]
    fn missing_feature_rows_do_nothing() {
        let features = HashMap::new();
        let decision = decide(
            &features,
            &entered_leg(),
            &day_params(),
            ExitVariant::WithoutCheck,
            false,
            true,
        );
        assert_eq!(decision, OneSideDecision::default());
    }
}
