//! Partial-period charge calculation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::money::round_money;

/// A prorated charge and the active-time ratio that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proration {
    pub amount: Decimal,
    pub ratio: f64,
}

/// Charge the fraction of `full_price` covering the active sub-interval of a
/// billing period, by seconds.
///
/// The active interval is clipped to the period and the ratio clamped to
/// `[0, 1]`. A fully covered period yields a ratio of exactly 1.0, so
/// full-period billing is the identity case of this path rather than a
/// separate one. A zero-length period prorates to zero.
pub fn prorate(
    full_price: Decimal,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    active_start: DateTime<Utc>,
    active_end: DateTime<Utc>,
) -> Proration {
    let total_seconds = (period_end - period_start).num_seconds();
    if total_seconds <= 0 {
        return Proration {
            amount: Decimal::ZERO,
            ratio: 0.0,
        };
    }

    let active_start = active_start.max(period_start);
    let active_end = active_end.min(period_end);
    let active_seconds = (active_end - active_start).num_seconds();

    let ratio = (active_seconds as f64 / total_seconds as f64).clamp(0.0, 1.0);
    let factor = Decimal::from_f64_retain(ratio).unwrap_or(Decimal::ZERO);

    Proration {
        amount: round_money(full_price * factor),
        ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn full_period_is_the_identity_case() {
        let start = utc(2024, 3, 1);
        let end = utc(2024, 4, 1);
        let p = prorate(dec("1500.00"), start, end, start, end);
        assert_eq!(p.ratio, 1.0);
        assert_eq!(p.amount, dec("1500.00"));
    }

    #[test]
    fn march_scenario_rounds_to_cents() {
        // 22 active days of a 31-day March at 1500/month.
        let p = prorate(
            dec("1500"),
            utc(2024, 3, 1),
            utc(2024, 4, 1),
            utc(2024, 3, 10),
            utc(2024, 4, 1),
        );
        assert_eq!(p.amount, dec("1064.52"));
        assert!((p.ratio - 22.0 / 31.0).abs() < 1e-12);
    }

    #[test]
    fn charge_is_monotonic_in_active_interval() {
        let start = utc(2024, 3, 1);
        let end = utc(2024, 4, 1);
        let mut previous = Decimal::ZERO;
        for day in 1..=31 {
            let active_end = start + chrono::Duration::days(day);
            let p = prorate(dec("999.99"), start, end, start, active_end.min(end));
            assert!(p.amount >= previous, "charge shrank at day {}", day);
            previous = p.amount;
        }
        assert_eq!(previous, dec("999.99"));
    }

    #[test]
    fn active_interval_is_clipped_to_the_period() {
        let p = prorate(
            dec("100"),
            utc(2024, 3, 1),
            utc(2024, 4, 1),
            utc(2024, 2, 1),
            utc(2024, 5, 1),
        );
        assert_eq!(p.ratio, 1.0);
        assert_eq!(p.amount, dec("100.00"));
    }

    #[test]
    fn inverted_active_interval_charges_nothing() {
        let p = prorate(
            dec("100"),
            utc(2024, 3, 1),
            utc(2024, 4, 1),
            utc(2024, 3, 20),
            utc(2024, 3, 10),
        );
        assert_eq!(p.ratio, 0.0);
        assert_eq!(p.amount, Decimal::ZERO);
    }

    #[test]
    fn degenerate_period_does_not_divide_by_zero() {
        let instant = utc(2024, 3, 1);
        let p = prorate(dec("100"), instant, instant, instant, instant);
        assert_eq!(p.ratio, 0.0);
        assert_eq!(p.amount, Decimal::ZERO);
    }
}
