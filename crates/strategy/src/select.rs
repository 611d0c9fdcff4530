//! Strike selection over the latest published option chain.

use rust_decimal::Decimal;

use delta_desk_core::types::{InstrumentSnapshot, OptionType};

/// Strikes further than this many points on the wrong side of spot are never
/// candidates, which keeps deep in-the-money rows out of delta queries.
const STRIKE_WINDOW: Decimal = Decimal::from_parts(45, 0, 0, false, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    AtLeast,
    AtMost,
}

/// A selected candidate strike and its implied volatility.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub strike: Decimal,
    pub sigma: f64,
}

fn in_window(row: &InstrumentSnapshot, spot: Decimal) -> bool {
    match row.option_type {
        OptionType::Call => row.strike > spot - STRIKE_WINDOW,
        OptionType::Put => row.strike < spot + STRIKE_WINDOW,
    }
}

/// Nearest strike whose delta is at least / at most `near`.
///
/// Deltas fall with strike for calls and for puts alike (puts go more
/// negative), so the nearest match is the highest qualifying strike for an
/// at-least query and the lowest for an at-most query.
#[must_use]
pub fn find_strike_by_delta(
    rows: &[InstrumentSnapshot],
    spot: Decimal,
    near: f64,
    option_type: OptionType,
    bound: Bound,
) -> Option<Candidate> {
    rows.iter()
        .filter(|r| r.option_type == option_type && in_window(r, spot))
        .filter(|r| match bound {
            Bound::AtLeast => r.delta() >= near,
            Bound::AtMost => r.delta() <= near,
        })
        .max_by_key(|r| match bound {
            Bound::AtLeast => r.strike,
            Bound::AtMost => -r.strike,
        })
        .map(|r| Candidate {
            strike: r.strike,
            sigma: r.sigma(),
        })
}

/// Nearest strike whose premium is at least / at most `near`. Premiums fall
/// with strike for calls and rise for puts.
#[must_use]
pub fn find_strike_by_premium(
    rows: &[InstrumentSnapshot],
    spot: Decimal,
    near: Decimal,
    option_type: OptionType,
    bound: Bound,
) -> Option<Candidate> {
    let toward_spot = matches!(
        (option_type, bound),
        (OptionType::Call, Bound::AtLeast) | (OptionType::Put, Bound::AtMost)
    );
    rows.iter()
        .filter(|r| r.option_type == option_type && in_window(r, spot))
        .filter(|r| match bound {
            Bound::AtLeast => r.last_price >= near,
            Bound::AtMost => r.last_price <= near,
        })
        .max_by_key(|r| if toward_spot { r.strike } else { -r.strike })
        .map(|r| Candidate {
            strike: r.strike,
            sigma: r.sigma(),
        })
}

/// One chain row by strike and option type.
#[must_use]
pub fn row_at(
    rows: &[InstrumentSnapshot],
    strike: Decimal,
    option_type: OptionType,
) -> Option<&InstrumentSnapshot> {
    rows.iter()
        .find(|r| r.option_type == option_type && r.strike == strike)
}

/// One chain row by trading symbol.
#[must_use]
pub fn row_by_symbol<'a>(
    rows: &'a [InstrumentSnapshot],
    tradingsymbol: &str,
) -> Option<&'a InstrumentSnapshot> {
    rows.iter().find(|r| r.tradingsymbol == tradingsymbol)
}

/// Entry pair: the lowest-delta call and highest-delta put inside the
/// (min_delta, max_delta) band. A skewed straddle (put strike above call
/// strike) is re-centered by swapping both legs onto each other's strikes so
/// the pair stays equidistant from spot.
#[must_use]
pub fn entry_pair<'a>(
    rows: &'a [InstrumentSnapshot],
    min_delta: f64,
    max_delta: f64,
) -> Option<(&'a InstrumentSnapshot, &'a InstrumentSnapshot)> {
    let ce = rows
        .iter()
        .filter(|r| r.option_type == OptionType::Call)
        .filter(|r| r.delta() > min_delta && r.delta() < max_delta)
        .min_by(|a, b| a.delta().total_cmp(&b.delta()))?;
    let pe = rows
        .iter()
        .filter(|r| r.option_type == OptionType::Put)
        .filter(|r| r.delta() < -min_delta && r.delta() > -max_delta)
        .max_by(|a, b| a.delta().total_cmp(&b.delta()))?;

    if pe.strike > ce.strike {
        let recentered_ce = row_at(rows, pe.strike, OptionType::Call)?;
        let recentered_pe = row_at(rows, ce.strike, OptionType::Put)?;
        Some((recentered_ce, recentered_pe))
    } else {
        Some((ce, pe))
    }
}
