//! Subscription model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Invoice;

/// A subscriber's enrollment in a plan over time.
///
/// `last_billed_at` is the billing cursor: the exclusive end of the last
/// period already invoiced. It only ever moves forward, and every advance is
/// committed atomically with the invoice that justifies it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub active: bool,
    pub auto_renew: bool,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub last_billed_at: Option<DateTime<Utc>>,
    pub mid_cycle_plan_change: bool,
    pub usage_bytes: i64,
    pub usage_hours: Decimal,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    /// Where billing resumes from: the cursor, or the enrollment instant for
    /// a subscription that has never been invoiced.
    pub fn billing_cursor(&self) -> DateTime<Utc> {
        self.last_billed_at.unwrap_or(self.start_at)
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.end_at.is_some_and(|end| end <= now)
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub auto_renew: bool,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
}

/// Result of a committed mid-cycle plan switch.
#[derive(Debug, Clone)]
pub struct PlanChangeOutcome {
    pub subscription: Subscription,
    pub settlement: Option<Invoice>,
}
