//! Persistence seam for the billing engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    BillingRun, BillingRunKind, BillingRunStatus, Invoice, InvoiceDraft, PassSummary, Plan,
    PlanChangeOutcome, Subscriber, Subscription,
};

/// Storage operations the engine needs. The production implementation is
/// [`crate::services::Database`]; tests drive the engine through an in-memory
/// implementation instead of a live Postgres.
///
/// The two `commit_*` methods are the engine's only writes that touch the
/// billing cursor, and both are atomic: the invoice row and the cursor
/// advance land in one transaction, guarded by a compare-and-swap on
/// `last_billed_at`. `Ok(None)` from either means the cursor moved since it
/// was read — a concurrent pass won — and the caller must not retry within
/// the same pass.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, AppError>;

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError>;

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError>;

    async fn get_subscriber(&self, user_id: Uuid) -> Result<Option<Subscriber>, AppError>;

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    /// Sum `rx_bytes + tx_bytes` over `[period_start, period_end)`.
    async fn sum_usage_bytes(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    /// Insert one invoice and advance the billing cursor to `new_cursor`,
    /// atomically. `expected_cursor` is the cursor value the caller read;
    /// `consume_hours` additionally zeroes the time accumulator billed by
    /// this invoice.
    async fn commit_invoice(
        &self,
        draft: &InvoiceDraft,
        expected_cursor: Option<DateTime<Utc>>,
        new_cursor: DateTime<Utc>,
        consume_hours: bool,
    ) -> Result<Option<Invoice>, AppError>;

    /// Switch a subscription to a new plan at `change_at`, optionally
    /// inserting the old plan's settlement invoice in the same transaction.
    /// The cursor never moves backwards: it becomes
    /// `max(change_at, last_billed_at)`.
    async fn commit_plan_change(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        change_at: DateTime<Utc>,
        settlement: Option<&InvoiceDraft>,
        expected_cursor: Option<DateTime<Utc>>,
    ) -> Result<Option<PlanChangeOutcome>, AppError>;

    async fn deactivate_subscription(&self, subscription_id: Uuid) -> Result<(), AppError>;

    /// Unpaid -> Paid. Idempotent; a second confirmation is a no-op.
    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Unpaid invoices past their due date become Overdue; returns the
    /// invoices transitioned by this call.
    async fn sweep_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, AppError>;

    async fn create_billing_run(
        &self,
        kind: BillingRunKind,
        started: DateTime<Utc>,
    ) -> Result<BillingRun, AppError>;

    async fn finish_billing_run(
        &self,
        run_id: Uuid,
        status: BillingRunStatus,
        summary: &PassSummary,
        completed: DateTime<Utc>,
    ) -> Result<(), AppError>;
}
