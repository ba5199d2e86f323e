//! Billing-cycle calendar arithmetic.
//!
//! All periods are half-open `[start, end)` in UTC. Daily periods start at
//! midnight, weekly periods at Monday 00:00, monthly periods on the first of
//! the month.

use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, Utc};

use crate::models::BillingCycleKind;

fn midnight_of(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// The period enclosing `instant` for the given cycle kind.
pub fn period_containing(
    instant: DateTime<Utc>,
    kind: BillingCycleKind,
) -> (DateTime<Utc>, DateTime<Utc>) {
    match kind {
        BillingCycleKind::Daily => {
            let start = midnight_of(instant);
            (start, start + Duration::days(1))
        }
        BillingCycleKind::Weekly => {
            let since_monday = instant.weekday().num_days_from_monday() as i64;
            let start = midnight_of(instant) - Duration::days(since_monday);
            (start, start + Duration::days(7))
        }
        BillingCycleKind::Monthly => {
            let first = instant
                .date_naive()
                .with_day(1)
                .expect("the first of the month is always a valid date");
            let start = first.and_time(NaiveTime::MIN).and_utc();
            // December rolls over to January of the next year.
            let end = (first + Months::new(1)).and_time(NaiveTime::MIN).and_utc();
            (start, end)
        }
    }
}

/// The first period boundary strictly after `instant`.
///
/// For a billing cursor sitting exactly on a boundary, the period starting
/// there applies, so the result is always strictly greater than `instant`.
pub fn next_boundary_after(instant: DateTime<Utc>, kind: BillingCycleKind) -> DateTime<Utc> {
    period_containing(instant, kind).1
}
