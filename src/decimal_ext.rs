//! Exact-decimal helpers shared across every component that touches price,
//! quantity, or PnL. No floating point crosses this boundary anywhere in
//! the money path.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Round `value` to the nearest multiple of `step`, half-up (away from zero
/// at the midpoint), never to zero unless `value` itself is zero.
fn quantize_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    let units = (value / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    units * step
}

/// Quantize a price to the exchange's tick size.
pub fn quantize_tick(price: Decimal, tick_size: Decimal) -> Decimal {
    quantize_to_step(price, tick_size)
}

/// Quantize a quantity to the exchange's step size, floored at `min_qty`
/// only when the caller is computing an order size (never silently bumps a
/// genuinely-zero residual up to `min_qty`).
pub fn quantize_qty(qty: Decimal, qty_step: Decimal, min_qty: Decimal) -> Decimal {
    let q = quantize_to_step(qty, qty_step);
    if q < min_qty && !q.is_zero() {
        min_qty
    } else {
        q
    }
}

/// Percentage difference between two values, symmetric around `a`:
/// `|a - b| / a * 100`. Returns `Decimal::MAX` if `a` is zero (treated as a
/// 100%+ mismatch by callers, which only ever compare against a ≤100% gate).
pub fn percent_diff(a: Decimal, b: Decimal) -> Decimal {
    if a.is_zero() {
        return Decimal::from(100);
    }
    ((a - b).abs() / a.abs()) * Decimal::from(100)
}

/// Clamp `value` into `[min, max]`.
pub fn clamp(value: Decimal, min: Decimal, max: Decimal) -> Decimal {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantize_tick_idempotent() {
        let tick = dec!(0.01);
        let once = quantize_tick(dec!(100.0331), tick);
        assert_eq!(once, dec!(100.03));
        assert_eq!(quantize_tick(once, tick), once);
    }

    #[test]
    fn quantize_tick_half_up() {
        assert_eq!(quantize_tick(dec!(100.005), dec!(0.01)), dec!(100.01));
    }

    #[test]
    fn quantize_qty_floors_to_min() {
        let q = quantize_qty(dec!(0.0004), dec!(0.001), dec!(0.001));
        assert_eq!(q, dec!(0.001));
    }

    #[test]
    fn quantize_qty_allows_true_zero() {
        assert_eq!(quantize_qty(dec!(0), dec!(0.001), dec!(0.001)), dec!(0));
    }

    #[test]
    fn percent_diff_symmetric_around_a() {
        assert_eq!(percent_diff(dec!(100), dec!(105)), dec!(5));
    }
}
