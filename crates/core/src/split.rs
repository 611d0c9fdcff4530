//! Quantity splitting helpers.

/// Splits `total` lots across `parts` profiles by largest remainder.
///
/// `base = total / parts`, with the remainder distributed one unit at a time
/// to the first profiles, so the result always sums to `total` and every
/// element differs from `base` by at most 1.
#[must_use]
pub fn divide_lots(parts: usize, total: u32) -> Vec<u32> {
    if parts == 0 {
        return Vec::new();
    }

    let parts_u32 = parts as u32;
    let base = total / parts_u32;
    let mut remainder = total - base * parts_u32;

    let mut out = vec![base; parts];
    for slot in &mut out {
        if remainder == 0 {
            break;
        }
        *slot += 1;
        remainder -= 1;
    }

    out
}

/// Splits an order quantity into exchange-acceptable chunks.
///
/// Each chunk is at most `max_order`, with any remainder as a final smaller
/// chunk. A zero quantity produces no chunks.
#[must_use]
pub fn split_quantity(quantity: u32, max_order: u32) -> Vec<u32> {
    if quantity == 0 || max_order == 0 {
        return Vec::new();
    }

    let chunks = quantity / max_order;
    let mut out = vec![max_order; chunks as usize];

    let remaining = quantity % max_order;
    if remaining > 0 {
        out.push(remaining);
    }

    out
}
