//! Strategy parameter decoding.
//!
//! Deployments carry free-form JSON options; delta and IV thresholds are
//! configured in percent and scaled down here, and lookback windows are
//! configured in minutes and scaled to 5-second tick-cycle units (12 cycles
//! per minute).

use std::collections::HashMap;

use chrono::NaiveTime;
use serde::Deserialize;

use delta_desk_core::types::ParameterProfile;

use crate::error::StrategyError;

/// Tick cycles per configured window unit.
pub const CYCLES_PER_MINUTE: usize = 12;

#[derive(Debug, Clone, Deserialize)]
struct RawOptions {
    entry_time: NaiveTime,
    exit_time: NaiveTime,
    max_delta: f64,
    shift_min_delta: f64,
    shift_max_delta: f64,
    shift_min_delta_entry: f64,
    multiplier: f64,
    point_difference: rust_decimal::Decimal,
    sigma_diff: f64,
    skip_price: rust_decimal::Decimal,
    sleep_time: u64,
    oneside_check_time: NaiveTime,
    expiry_check_time: NaiveTime,
    difference_list: Vec<usize>,
}

/// Deployment-level options with percent scaling applied.
#[derive(Debug, Clone)]
pub struct StrategyOptions {
    pub entry_time: NaiveTime,
    pub exit_time: NaiveTime,
    pub max_delta: f64,
    pub shift_min_delta: f64,
    pub shift_max_delta: f64,
    pub shift_min_delta_entry: f64,
    pub multiplier: f64,
    pub point_difference: rust_decimal::Decimal,
    pub sigma_diff: f64,
    pub skip_price: rust_decimal::Decimal,
    pub sleep_time: u64,
    pub oneside_check_time: NaiveTime,
    pub expiry_check_time: NaiveTime,
    /// Feature lookback windows in tick-cycle units.
    pub windows: Vec<usize>,
}

impl StrategyOptions {
    /// # Errors
    ///
    /// Returns `BadParams` when the options JSON does not decode.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, StrategyError> {
        let raw: RawOptions = serde_json::from_value(value.clone())
            .map_err(|e| StrategyError::BadParams(e.to_string()))?;
        Ok(Self {
            entry_time: raw.entry_time,
            exit_time: raw.exit_time,
            max_delta: raw.max_delta / 100.0,
            shift_min_delta: raw.shift_min_delta / 100.0,
            shift_max_delta: raw.shift_max_delta / 100.0,
            shift_min_delta_entry: raw.shift_min_delta_entry / 100.0,
            multiplier: raw.multiplier,
            point_difference: raw.point_difference,
            sigma_diff: raw.sigma_diff / 100.0,
            skip_price: raw.skip_price,
            sleep_time: raw.sleep_time.max(1),
            oneside_check_time: raw.oneside_check_time,
            expiry_check_time: raw.expiry_check_time,
            windows: raw
                .difference_list
                .iter()
                .map(|w| w * CYCLES_PER_MINUTE)
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawDayParams {
    min_delta: f64,
    change: f64,
    reentry_oi: f64,
    #[serde(default)]
    less_than: Option<f64>,
    one_side_exit_change_param: usize,
    one_side_reentry_change_param: usize,
}

/// One day-to-expiry row of a profile's parameter table, scaled.
#[derive(Debug, Clone, Copy)]
pub struct DayParams {
    pub min_delta: f64,
    /// Held-spread threshold that triggers a one-side exit.
    pub change: f64,
    /// Reverse-spread threshold that triggers re-entry.
    pub reentry_oi: f64,
    /// Secondary OI pct-change ceiling, used by the check variant only.
    pub less_than: f64,
    pub exit_window: usize,
    pub reentry_window: usize,
}

/// Which one-side-exit signal the profile runs on a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitVariant {
    WithoutCheck,
    Check,
    /// No one-side evaluation on this day.
    None,
}

#[derive(Debug, Clone, Deserialize)]
struct RawProfile {
    #[serde(default)]
    one_side_without_check_exit: Vec<i64>,
    #[serde(default)]
    one_side_check_exit: Vec<i64>,
    day_wise: HashMap<String, RawDayParams>,
}

/// One parameter profile (leg group) with its day-wise tables.
#[derive(Debug, Clone)]
pub struct ProfileParams {
    pub name: String,
    without_check_days: Vec<i64>,
    check_days: Vec<i64>,
    day_wise: HashMap<String, RawDayParams>,
}

impl ProfileParams {
    /// # Errors
    ///
    /// Returns `BadParams` when the profile JSON does not decode.
    pub fn from_profile(profile: &ParameterProfile) -> Result<Self, StrategyError> {
        let raw: RawProfile = serde_json::from_value(profile.params.clone())
            .map_err(|e| StrategyError::BadParams(format!("{}: {e}", profile.name)))?;
        Ok(Self {
            name: profile.name.clone(),
            without_check_days: raw.one_side_without_check_exit,
            check_days: raw.one_side_check_exit,
            day_wise: raw.day_wise,
        })
    }

    #[must_use]
    pub fn variant_for(&self, days_left: i64) -> ExitVariant {
        if self.without_check_days.contains(&days_left) {
            ExitVariant::WithoutCheck
        } else if self.check_days.contains(&days_left) {
            ExitVariant::Check
        } else {
            ExitVariant::None
        }
    }

    /// # Errors
    ///
    /// Returns `BadParams` when the table has no row for `days_left`.
    pub fn day_params(&self, days_left: i64) -> Result<DayParams, StrategyError> {
        let raw = self.day_wise.get(&days_left.to_string()).ok_or_else(|| {
            StrategyError::BadParams(format!(
                "profile {} has no parameters for {days_left} days to expiry",
                self.name
            ))
        })?;
        Ok(DayParams {
            min_delta: raw.min_delta / 100.0,
            change: raw.change / 100.0,
            reentry_oi: raw.reentry_oi / 100.0,
            less_than: raw.less_than.map_or(f64::MAX, |v| v / 100.0),
            exit_window: raw.one_side_exit_change_param * CYCLES_PER_MINUTE,
            reentry_window: raw.one_side_reentry_change_param * CYCLES_PER_MINUTE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn options_json() -> serde_json::Value {
        json!({
            "entry_time": "09:20:00",
            "exit_time": "15:10:00",
            "max_delta": 60,
            "shift_min_delta": 35,
            "shift_max_delta": 60,
            "shift_min_delta_entry": 45,
            "multiplier": 1.2,
            "point_difference": 100,
            "sigma_diff": 3,
            "skip_price": 5,
            "sleep_time": 5,
            "oneside_check_time": "14:00:00",
            "expiry_check_time": "13:00:00",
            "difference_list": [1, 2, 6, 12],
        })
    }

    #[test]
    fn percent_fields_are_scaled() {
        let options = StrategyOptions::from_value(&options_json()).unwrap();
        assert!((options.max_delta - 0.60).abs() < 1e-12);
        assert!((options.shift_min_delta - 0.35).abs() < 1e-12);
        assert!((options.sigma_diff - 0.03).abs() < 1e-12);
        assert_eq!(options.windows, vec![12, 24, 72, 144]);
    }

    #[test]
    fn day_params_scale_and_window() {
        let profile = ParameterProfile {
            name: "p1".to_string(),
            params: json!({
                "one_side_without_check_exit": [0, 1],
                "one_side_check_exit": [2, 3],
                "day_wise": {
                    "1": {
                        "min_delta": 25,
                        "change": 2,
                        "reentry_oi": 3,
                        "less_than": 1,
                        "one_side_exit_change_param": 6,
                        "one_side_reentry_change_param": 2,
                    }
                }
            }),
        };
        let params = ProfileParams::from_profile(&profile).unwrap();
        assert_eq!(params.variant_for(1), ExitVariant::WithoutCheck);
        assert_eq!(params.variant_for(3), ExitVariant::Check);
        assert_eq!(params.variant_for(7), ExitVariant::None);

        let day = params.day_params(1).unwrap();
        assert!((day.change - 0.02).abs() < 1e-12);
        assert_eq!(day.exit_window, 72);
        assert_eq!(day.reentry_window, 24);
        assert!(params.day_params(5).is_err());
    }
}
