//! Fixed-point monetary arithmetic.
//!
//! Amounts are carried as `i64` micro-units (6 fractional digits). All
//! tolerance comparisons go through [`EPSILON_MICROS`]; floating point
//! never enters the arithmetic.

/// Micro-units per whole currency unit.
pub const AMOUNT_SCALE: i64 = 1_000_000;

/// Reconciliation tolerance: 0.005 currency units.
pub const EPSILON_MICROS: i64 = 5_000;

pub type AmountMicros = i64;

/// Builds an amount from whole units, e.g. `from_units(-95)` is −95.000000.
#[must_use]
pub fn from_units(units: i64) -> AmountMicros {
    units * AMOUNT_SCALE
}

#[must_use]
pub fn abs(amount: AmountMicros) -> AmountMicros {
    amount.abs()
}

/// `|a − b| ≤ ε`.
#[must_use]
pub fn within_epsilon(a: AmountMicros, b: AmountMicros) -> bool {
    (a - b).abs() <= EPSILON_MICROS
}

/// `amount ≤ ε` — treats tolerance-sized residue as zero.
#[must_use]
pub fn is_zeroish(amount: AmountMicros) -> bool {
    amount.abs() <= EPSILON_MICROS
}

/// `|a − b| ≤ tolerance` for a caller-supplied tolerance.
#[must_use]
pub fn within_tolerance(a: AmountMicros, b: AmountMicros, tolerance: AmountMicros) -> bool {
    (a - b).abs() <= tolerance
}

/// Splits a tax-inclusive total into (base, tax) where
/// `base = total / (1 + rate/100)` rounded to micro-units and
/// `tax = total − base`. `rate_bps` is the tax rate in basis points
/// (e.g. 19% = 1_900).
#[must_use]
pub fn split_tax_inclusive(total_abs: AmountMicros, rate_bps: i64) -> (AmountMicros, AmountMicros) {
    // base = total * 10_000 / (10_000 + rate_bps), with half-up rounding
    // carried in i128 to avoid overflow on large totals.
    let denominator = 10_000 + rate_bps;
    let numerator = i128::from(total_abs) * 10_000;
    let base = ((numerator + i128::from(denominator) / 2) / i128::from(denominator)) as i64;
    (base, total_abs - base)
}

/// Renders an amount as a human-readable decimal, e.g. `-95.000000`.
#[must_use]
pub fn format_amount(amount: AmountMicros) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!(
        "{sign}{}.{:06}",
        abs / AMOUNT_SCALE as u64,
        abs % AMOUNT_SCALE as u64
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn epsilon_boundaries() {
        assert!(within_epsilon(from_units(100), from_units(100) + EPSILON_MICROS));
        assert!(!within_epsilon(
            from_units(100),
            from_units(100) + 2 * EPSILON_MICROS
        ));
        assert!(is_zeroish(EPSILON_MICROS));
        assert!(!is_zeroish(EPSILON_MICROS + 1));
    }

    #[test]
    fn tax_split_is_exact_and_positive() {
        // 119.000000 at 19% included tax -> base 100, tax 19.
        let (base, tax) = split_tax_inclusive(from_units(119), 1_900);
        assert_eq!(base, from_units(100));
        assert_eq!(tax, from_units(19));
        assert_eq!(base + tax, from_units(119));
    }

    #[test]
    fn tax_split_rounds_half_up() {
        let (base, tax) = split_tax_inclusive(1_000_001, 1_900);
        assert_eq!(base + tax, 1_000_001);
        assert!(base > 0 && tax > 0);
    }

    #[test]
    fn formats_signed_micros() {
        assert_eq!(format_amount(from_units(-95)), "-95.000000");
        assert_eq!(format_amount(1_234_560), "1.234560");
        assert_eq!(format_amount(0), "0.000000");
    }
}
