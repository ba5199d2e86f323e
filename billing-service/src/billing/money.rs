//! Canonical money rounding.

use rust_decimal::{Decimal, RoundingStrategy};

/// Round a fractional currency amount to 2 decimal places, half-up. Every
/// charge the engine computes goes through here before it is persisted.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn rounds_half_up_not_bankers() {
        assert_eq!(round_money(dec("10.005")), dec("10.01"));
        assert_eq!(round_money(dec("2.675")), dec("2.68"));
        assert_eq!(round_money(dec("0.125")), dec("0.13"));
    }

    #[test]
    fn rounds_down_below_midpoint() {
        assert_eq!(round_money(dec("10.004")), dec("10.00"));
        assert_eq!(round_money(dec("1064.5161")), dec("1064.52"));
    }

    #[test]
    fn exact_amounts_unchanged() {
        assert_eq!(round_money(dec("1500.00")), dec("1500.00"));
        assert_eq!(round_money(Decimal::ZERO), Decimal::ZERO);
    }
}
