//! Black-Scholes implied volatility and greeks.
//!
//! The observed option premium is inverted to an implied volatility by
//! bisection, and delta/theta/gamma/vega are bootstrapped from that sigma.
//! Degenerate inputs (expired contract, non-positive price or spot) yield
//! zeroed greeks instead of an error so a single bad row never aborts a
//! snapshot cycle.

use delta_desk_core::types::{Greeks, OptionType};

const SIGMA_LO: f64 = 1e-4;
const SIGMA_HI: f64 = 5.0;
const PRICE_TOL: f64 = 1e-6;
const MAX_ITERS: u32 = 100;

fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Standard normal CDF (Abramowitz & Stegun 26.2.17, |err| < 7.5e-8).
fn norm_cdf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.2316419 * x.abs());
    let poly = t
        * (0.319381530
            + t * (-0.356563782 + t * (1.781477937 + t * (-1.821255978 + t * 1.330274429))));
    let tail = norm_pdf(x.abs()) * poly;
    if x >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Black-Scholes price of a European option.
#[must_use]
pub fn bs_price(
    spot: f64,
    strike: f64,
    t_years: f64,
    rate: f64,
    sigma: f64,
    option_type: OptionType,
) -> f64 {
    if t_years <= 0.0 || spot <= 0.0 || strike <= 0.0 {
        return 0.0;
    }
    let sqrt_t = t_years.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * sigma * sigma) * t_years) / (sigma * sqrt_t);
    let d2 = d1 - sigma * sqrt_t;
    let df = (-rate * t_years).exp();
    match option_type {
        OptionType::Call => spot * norm_cdf(d1) - strike * df * norm_cdf(d2),
        OptionType::Put => strike * df * norm_cdf(-d2) - spot * norm_cdf(-d1),
    }
}

/// Solves for the volatility that reproduces the observed premium.
///
/// Returns `None` when the premium lies outside the attainable price range.
#[must_use]
pub fn implied_volatility(
    price: f64,
    spot: f64,
    strike: f64,
    t_years: f64,
    rate: f64,
    option_type: OptionType,
) -> Option<f64> {
    if price <= 0.0 || spot <= 0.0 || strike <= 0.0 || t_years <= 0.0 {
        return None;
    }
    if price <= bs_price(spot, strike, t_years, rate, SIGMA_LO, option_type) {
        return Some(SIGMA_LO);
    }
    if price >= bs_price(spot, strike, t_years, rate, SIGMA_HI, option_type) {
        return None;
    }

    let mut lo = SIGMA_LO;
    let mut hi = SIGMA_HI;
    for _ in 0..MAX_ITERS {
        let mid = 0.5 * (lo + hi);
        let diff = bs_price(spot, strike, t_years, rate, mid, option_type) - price;
        if diff.abs() < PRICE_TOL {
            return Some(mid);
        }
        if diff > 0.0 {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    Some(0.5 * (lo + hi))
}

/// Implied volatility plus the greeks derived from it.
///
/// Theta is per calendar day, vega per percentage point of volatility.
#[must_use]
pub fn option_greeks(
    price: f64,
    spot: f64,
    strike: f64,
    t_years: f64,
    rate: f64,
    option_type: OptionType,
) -> Greeks {
    let Some(sigma) = implied_volatility(price, spot, strike, t_years, rate, option_type) else {
        return Greeks::default();
    };

    let sqrt_t = t_years.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * sigma * sigma) * t_years) / (sigma * sqrt_t);
    let d2 = d1 - sigma * sqrt_t;
    let df = (-rate * t_years).exp();
    let pdf_d1 = norm_pdf(d1);

    let delta = match option_type {
        OptionType::Call => norm_cdf(d1),
        OptionType::Put => norm_cdf(d1) - 1.0,
    };
    let gamma = pdf_d1 / (spot * sigma * sqrt_t);
    let vega = spot * pdf_d1 * sqrt_t / 100.0;
    let theta_year = match option_type {
        OptionType::Call => {
            -spot * pdf_d1 * sigma / (2.0 * sqrt_t) - rate * strike * df * norm_cdf(d2)
        }
        OptionType::Put => {
            -spot * pdf_d1 * sigma / (2.0 * sqrt_t) + rate * strike * df * norm_cdf(-d2)
        }
    };

    Greeks {
        sigma,
        delta,
        theta: theta_year / 365.0,
        gamma,
        vega,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implied_vol_recovers_known_sigma() {
        let price = bs_price(22000.0, 22100.0, 7.0 / 365.0, 0.10, 0.18, OptionType::Call);
        let sigma =
            implied_volatility(price, 22000.0, 22100.0, 7.0 / 365.0, 0.10, OptionType::Call)
                .unwrap();
        assert!((sigma - 0.18).abs() < 1e-3, "sigma = {sigma}");
    }

    #[test]
    fn call_and_put_delta_ranges() {
        let call = option_greeks(180.0, 22000.0, 22000.0, 7.0 / 365.0, 0.10, OptionType::Call);
        assert!(call.delta > 0.0 && call.delta < 1.0);

        let put = option_greeks(140.0, 22000.0, 22000.0, 7.0 / 365.0, 0.10, OptionType::Put);
        assert!(put.delta < 0.0 && put.delta > -1.0);
    }

    #[test]
    fn atm_deltas_straddle_half() {
        let call = option_greeks(180.0, 22000.0, 22000.0, 7.0 / 365.0, 0.10, OptionType::Call);
        let put = option_greeks(175.0, 22000.0, 22000.0, 7.0 / 365.0, 0.10, OptionType::Put);
        assert!((call.delta - 0.5).abs() < 0.15);
        assert!((put.delta + 0.5).abs() < 0.15);
    }

    #[test]
    fn degenerate_inputs_zero_the_greeks() {
        assert_eq!(
            option_greeks(0.0, 22000.0, 22000.0, 0.02, 0.10, OptionType::Call),
            Greeks::default()
        );
        assert_eq!(
            option_greeks(100.0, 22000.0, 22000.0, 0.0, 0.10, OptionType::Put),
            Greeks::default()
        );
    }

    #[test]
    fn theta_is_negative_for_short_dated_atm() {
        let g = option_greeks(180.0, 22000.0, 22000.0, 7.0 / 365.0, 0.10, OptionType::Call);
        assert!(g.theta < 0.0);
    }
}
