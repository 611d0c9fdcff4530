//! Open-interest change features over configurable lookback windows.
//!
//! One [`OiSample`] is appended per tick cycle; features are recomputed from
//! the rolling history on demand and never persisted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One per-cycle aggregate of the option chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OiSample {
    pub timestamp: DateTime<Utc>,
    pub ce_total_oi: i64,
    pub pe_total_oi: i64,
    /// Put/call OI ratio; `None` when total CE OI is zero (unusable cycle).
    pub pcr: Option<f64>,
    pub atm_strike: Decimal,
    pub ce_iv: f64,
    pub pe_iv: f64,
    pub ce_premium: Decimal,
    pub pe_premium: Decimal,
}

impl OiSample {
    /// PCR with the zero-denominator case collapsed to `None`.
    #[must_use]
    pub fn pcr_of(pe_total_oi: i64, ce_total_oi: i64) -> Option<f64> {
        if ce_total_oi > 0 {
            Some(pe_total_oi as f64 / ce_total_oi as f64)
        } else {
            None
        }
    }
}

/// Raw value jumps larger than this are held back by the smoothed series.
const HOLD_JUMP_THRESHOLD: f64 = 0.001;

/// OI-change features for one lookback window, evaluated at the latest row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowFeatures {
    pub window: usize,
    /// Percentage change of total CE open interest over the window.
    pub ce_oi_change: f64,
    pub pe_oi_change: f64,
    /// `ce_oi_change - pe_oi_change`, unsmoothed.
    pub ce_minus_pe_change: f64,
    /// Smoothed spread: holds the previous value whenever the raw series
    /// jumps by more than [`HOLD_JUMP_THRESHOLD`] in one cycle.
    pub ce_minus_pe_held: f64,
    pub pe_minus_ce_held: f64,
    /// Absolute change of total CE open interest over the window.
    pub ce_oi_abs_change: f64,
    pub pe_oi_abs_change: f64,
    /// `pe_oi_abs_change / ce_oi_abs_change`, mapped to 0.0 whenever the
    /// denominator is zero or the quotient is non-finite. Never raises,
    /// never infinite.
    pub pe_by_ce_abs_change: f64,
}

impl WindowFeatures {
    /// False when an infinite/NaN percentage change makes the signal
    /// unusable this cycle; consumers must skip transitions on such rows.
    #[must_use]
    pub fn usable(&self) -> bool {
        self.ce_oi_change.is_finite()
            && self.pe_oi_change.is_finite()
            && self.ce_minus_pe_held.is_finite()
    }
}

fn pct_change(now: i64, then: i64) -> f64 {
    (now - then) as f64 / then as f64
}

/// Computes the features for one window at the last row of `history`.
///
/// Returns `None` while the history is shorter than the window (the signal
/// cannot be formed yet).
#[must_use]
pub fn window_features(history: &[OiSample], window: usize) -> Option<WindowFeatures> {
    if window == 0 || history.len() <= window {
        return None;
    }

    // The smoothed spread depends on every prior row, so walk the whole
    // series once and keep the running held value.
    let mut prev_raw = f64::NAN;
    let mut held = 0.0_f64;
    let mut last = WindowFeatures::default();

    for i in window..history.len() {
        let now = &history[i];
        let then = &history[i - window];

        let ce_change = pct_change(now.ce_total_oi, then.ce_total_oi);
        let pe_change = pct_change(now.pe_total_oi, then.pe_total_oi);
        let raw = ce_change - pe_change;

        let jumped = (raw - prev_raw).abs() > HOLD_JUMP_THRESHOLD;
        if raw.is_finite() && (prev_raw.is_nan() || !jumped) {
            held = raw;
        }
        prev_raw = raw;

        let ce_abs = (now.ce_total_oi - then.ce_total_oi) as f64;
        let pe_abs = (now.pe_total_oi - then.pe_total_oi) as f64;
        let ratio = if ce_abs == 0.0 { 0.0 } else { pe_abs / ce_abs };

        last = WindowFeatures {
            window,
            ce_oi_change: ce_change,
            pe_oi_change: pe_change,
            ce_minus_pe_change: raw,
            ce_minus_pe_held: held,
            pe_minus_ce_held: -held,
            ce_oi_abs_change: ce_abs,
            pe_oi_abs_change: pe_abs,
            pe_by_ce_abs_change: if ratio.is_finite() { ratio } else { 0.0 },
        };
    }

    Some(last)
}

/// Features for every configured window. Windows without enough history are
/// absent from the result.
#[must_use]
pub fn signal_features(history: &[OiSample], windows: &[usize]) -> Vec<WindowFeatures> {
    windows
        .iter()
        .filter_map(|w| window_features(history, *w))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample(ce: i64, pe: i64) -> OiSample {
        OiSample {
            timestamp: Utc::now(),
            ce_total_oi: ce,
            pe_total_oi: pe,
            pcr: OiSample::pcr_of(pe, ce),
            atm_strike: dec!(22000),
            ce_iv: 0.15,
            pe_iv: 0.16,
            ce_premium: dec!(120),
            pe_premium: dec!(110),
        }
    }

    #[test]
    fn pcr_is_none_when_ce_side_empty() {
        assert_eq!(OiSample::pcr_of(5000, 0), None);
        assert_eq!(OiSample::pcr_of(0, 0), None);
        assert_eq!(OiSample::pcr_of(5000, 2500), Some(2.0));
    }

    #[test]
    fn abs_change_ratio_is_zero_on_flat_ce_side() {
        // CE OI flat over the window -> denominator 0 -> ratio 0, not inf.
        let history = vec![sample(1000, 1000), sample(1000, 1500)];
        let f = window_features(&history, 1).unwrap();
        assert_eq!(f.ce_oi_abs_change, 0.0);
        assert_eq!(f.pe_by_ce_abs_change, 0.0);
        assert!(f.pe_by_ce_abs_change.is_finite());
    }

    #[test]
    fn pct_change_from_zero_base_is_unusable() {
        let history = vec![sample(0, 1000), sample(500, 1100)];
        let f = window_features(&history, 1).unwrap();
        assert!(!f.ce_oi_change.is_finite());
        assert!(!f.usable());
    }

    #[test]
    fn short_history_has_no_features() {
        let history = vec![sample(1000, 1000)];
        assert!(window_features(&history, 1).is_none());
        assert!(window_features(&history, 0).is_none());
    }

    #[test]
    fn held_series_ignores_single_cycle_jumps() {
        // Slow drift, then a one-cycle spike in CE OI change.
        let mut history = vec![
            sample(10000, 10000),
            sample(10010, 10000),
            sample(10020, 10000),
        ];
        let before = window_features(&history, 1).unwrap();
        assert!((before.ce_minus_pe_held - before.ce_minus_pe_change).abs() < 1e-12);

        history.push(sample(12000, 10000)); // ~20% jump in one cycle
        let after = window_features(&history, 1).unwrap();
        assert!(after.ce_minus_pe_change > 0.1);
        // Held value stays at the pre-jump level.
        assert!((after.ce_minus_pe_held - before.ce_minus_pe_held).abs() < 1e-9);
        assert_eq!(after.pe_minus_ce_held, -after.ce_minus_pe_held);
    }

    #[test]
    fn every_configured_window_with_history_is_reported() {
        let history: Vec<OiSample> =
            (0..10).map(|i| sample(1000 + i * 10, 1000 + i * 5)).collect();
        let features = signal_features(&history, &[1, 2, 50]);
        let windows: Vec<usize> = features.iter().map(|f| f.window).collect();
        assert_eq!(windows, vec![1, 2]);
    }
}
