//! Mid-cycle plan switches.
//!
//! Switching plans settles the outgoing plan for the elapsed fraction of the
//! current cycle and resets the billing cursor to the switch instant, so the
//! next regular pass bills the new plan's first period from exactly there —
//! prorated through the ordinary path when the switch does not land on a
//! cycle boundary.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

use crate::billing::cycle::period_containing;
use crate::billing::proration::prorate;
use crate::models::{InvoiceDetails, InvoiceDraft, PlanChangeOutcome};
use crate::services::metrics::record_invoice_created;
use crate::services::BillingStore;

/// Switch a subscription to a new plan at `change_at`.
///
/// When the cursor already covers `change_at` nothing is owed for the old
/// plan and only the switch is committed. Otherwise the elapsed fraction of
/// the current cycle is invoiced against the old plan in the same transaction
/// as the switch.
pub async fn change_plan<S: BillingStore + ?Sized>(
    store: &S,
    subscription_id: Uuid,
    new_plan_id: Uuid,
    change_at: DateTime<Utc>,
    due_days: i64,
) -> Result<PlanChangeOutcome, AppError> {
    let subscription = store
        .get_subscription(subscription_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("subscription {} not found", subscription_id))
        })?;

    if !subscription.active {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "subscription must be active to change plan"
        )));
    }

    let old_plan = store
        .get_plan(subscription.plan_id)
        .await?
        .ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "current plan {} not found",
                subscription.plan_id
            ))
        })?;

    let new_plan = store.get_plan(new_plan_id).await?.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("new plan {} not found", new_plan_id))
    })?;

    if !new_plan.is_active {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "cannot switch to a retired plan"
        )));
    }

    let cursor = subscription.billing_cursor();
    let (period_start, period_end) = period_containing(cursor, old_plan.cycle());

    let settlement = if change_at <= cursor {
        // The old plan is already settled through the switch instant.
        None
    } else {
        let used = prorate(
            old_plan.price,
            period_start,
            period_end,
            period_start,
            change_at,
        );
        Some(InvoiceDraft {
            user_id: subscription.user_id,
            subscription_id,
            period_start,
            period_end: change_at,
            amount: used.amount,
            generated_at: change_at,
            due_date: change_at + Duration::days(due_days),
            details: InvoiceDetails {
                plan_price: old_plan.price,
                prorated_price: used.amount,
                proration_ratio: used.ratio,
                usage_bytes: 0,
                usage_charge: Decimal::ZERO,
                note: Some(format!("mid-cycle settlement of plan '{}'", old_plan.name)),
            },
        })
    };

    let outcome = store
        .commit_plan_change(
            subscription_id,
            new_plan_id,
            change_at,
            settlement.as_ref(),
            subscription.last_billed_at,
        )
        .await?
        .ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!(
                "subscription was billed concurrently; retry the plan change"
            ))
        })?;

    if let Some(invoice) = &outcome.settlement {
        record_invoice_created("plan_change", invoice.amount);
    }

    tracing::info!(
        subscription_id = %subscription_id,
        old_plan = %old_plan.name,
        new_plan = %new_plan.name,
        settled = outcome.settlement.is_some(),
        change_at = %change_at,
        "Plan changed"
    );

    Ok(outcome)
}
