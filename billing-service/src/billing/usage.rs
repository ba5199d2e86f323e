//! Metered-consumption charges.

use rust_decimal::Decimal;

use super::money::round_money;

const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;

/// Convert a byte total for a period into a charge at `rate_per_gb`.
pub fn data_charge(total_bytes: i64, rate_per_gb: Decimal) -> Decimal {
    if total_bytes <= 0 {
        return Decimal::ZERO;
    }
    let gb = Decimal::from(total_bytes) / Decimal::from(BYTES_PER_GB);
    round_money(gb * rate_per_gb)
}

/// Convert an hour accumulator into a charge at `rate_per_hour`.
pub fn time_charge(hours: Decimal, rate_per_hour: Decimal) -> Decimal {
    if hours <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    round_money(hours * rate_per_hour)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn two_gib_at_fifty_per_gb() {
        assert_eq!(data_charge(2_147_483_648, dec("50")), dec("100.00"));
    }

    #[test]
    fn fractional_gigabytes_round_to_cents() {
        // 1.5 GiB at 10/GB.
        assert_eq!(data_charge(1_610_612_736, dec("10")), dec("15.00"));
        // 100 MiB at 7/GB = 0.68359375 -> 0.68.
        assert_eq!(data_charge(104_857_600, dec("7")), dec("0.68"));
    }

    #[test]
    fn no_bytes_no_charge() {
        assert_eq!(data_charge(0, dec("50")), Decimal::ZERO);
        assert_eq!(data_charge(-10, dec("50")), Decimal::ZERO);
    }

    #[test]
    fn hours_are_billed_at_the_hourly_rate() {
        assert_eq!(time_charge(dec("10.5"), dec("5")), dec("52.50"));
        assert_eq!(time_charge(Decimal::ZERO, dec("5")), Decimal::ZERO);
    }
}
