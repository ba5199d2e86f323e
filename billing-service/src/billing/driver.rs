//! The billing pass driver.
//!
//! One pass walks every active subscription, decides whether billing
//! boundaries have been crossed since its cursor, and emits exactly one
//! invoice per crossed period. Subscriptions are independent of each other,
//! so the pass fans out over a bounded worker pool; correctness under
//! concurrent passes rests entirely on the store's compare-and-swap cursor
//! advance, not on any in-process locking.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::{stream, StreamExt};
use rust_decimal::Decimal;
use service_core::error::AppError;

use crate::billing::cycle::{next_boundary_after, period_containing};
use crate::billing::money::round_money;
use crate::billing::payment::SettlementOrchestrator;
use crate::billing::proration::prorate;
use crate::billing::usage::{data_charge, time_charge};
use crate::models::{
    BillingRunKind, ChargePolicy, Invoice, InvoiceDetails, InvoiceDraft, PassSummary, Plan,
    Subscription,
};
use crate::services::metrics::{
    record_billing_pass, record_error, record_invoice_created, record_invoice_overdue,
    record_subscription_deactivated,
};
use crate::services::BillingStore;

/// Upper bound on boundaries billed for one subscription in one pass. A
/// cursor can only fall this far behind if the scheduler was down for months;
/// the remainder is picked up by the next pass.
const MAX_PERIODS_PER_PASS: usize = 120;

/// Tunables for a driver instance.
#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    /// Concurrent subscriptions in flight.
    pub worker_count: usize,
    /// Days between invoice generation and its due date.
    pub due_days: i64,
    /// Attempt immediate settlement of auto-renew subscriptions.
    pub auto_charge: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            worker_count: 8,
            due_days: 3,
            auto_charge: false,
        }
    }
}

/// Per-subscription result of one pass.
enum SubscriptionOutcome {
    NothingDue,
    Invoiced(u32),
    Deactivated,
    Skipped,
    Conflict,
    Failed,
}

/// Runs billing passes against a [`BillingStore`].
pub struct BillingDriver<S> {
    store: Arc<S>,
    orchestrator: Arc<SettlementOrchestrator>,
    settings: DriverSettings,
}

impl<S: BillingStore> BillingDriver<S> {
    pub fn new(
        store: Arc<S>,
        orchestrator: Arc<SettlementOrchestrator>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            store,
            orchestrator,
            settings,
        }
    }

    /// Run one billing pass at the caller-supplied instant.
    ///
    /// `now` is explicit so the scheduler is a trivial wrapper and tests are
    /// deterministic. Re-running with the same `now` is a no-op: every
    /// decision below re-derives from durable cursor state.
    pub async fn run_pass(
        &self,
        now: DateTime<Utc>,
        kind: BillingRunKind,
    ) -> Result<PassSummary, AppError> {
        let run = self.store.create_billing_run(kind, now).await?;
        tracing::info!(run_id = %run.run_id, kind = kind.as_str(), now = %now, "Starting billing pass");

        let subscriptions = self.store.list_active_subscriptions().await?;

        let outcomes: Vec<SubscriptionOutcome> = stream::iter(subscriptions)
            .map(|subscription| self.bill_subscription(subscription, now))
            .buffer_unordered(self.settings.worker_count.max(1))
            .collect()
            .await;

        let mut summary = PassSummary::default();
        for outcome in outcomes {
            summary.processed += 1;
            match outcome {
                SubscriptionOutcome::NothingDue => {}
                SubscriptionOutcome::Invoiced(count) => summary.invoices += count,
                SubscriptionOutcome::Deactivated => summary.deactivated += 1,
                SubscriptionOutcome::Skipped => summary.skipped += 1,
                SubscriptionOutcome::Conflict => summary.conflicts += 1,
                SubscriptionOutcome::Failed => summary.failed += 1,
            }
        }

        let status = summary.status();
        self.store
            .finish_billing_run(run.run_id, status, &summary, now)
            .await?;
        record_billing_pass(kind.as_str(), status.as_str());

        tracing::info!(
            run_id = %run.run_id,
            processed = summary.processed,
            invoices = summary.invoices,
            deactivated = summary.deactivated,
            skipped = summary.skipped,
            conflicts = summary.conflicts,
            failed = summary.failed,
            "Billing pass finished"
        );

        Ok(summary)
    }

    async fn bill_subscription(
        &self,
        subscription: Subscription,
        now: DateTime<Utc>,
    ) -> SubscriptionOutcome {
        let plan = match self.store.get_plan(subscription.plan_id).await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                record_error("configuration", "get_plan");
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    plan_id = %subscription.plan_id,
                    "Subscription references a missing plan; skipping"
                );
                return SubscriptionOutcome::Skipped;
            }
            Err(e) => {
                record_error("database", "get_plan");
                tracing::error!(
                    subscription_id = %subscription.subscription_id,
                    error = %e,
                    "Failed to load plan"
                );
                return SubscriptionOutcome::Failed;
            }
        };

        if subscription.expired_at(now) {
            return self.expire_subscription(&subscription, &plan).await;
        }

        let policy = match ChargePolicy::from_plan(&plan) {
            Ok(policy) => policy,
            Err(e) => {
                record_error("configuration", "charge_policy");
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    plan = %plan.name,
                    error = %e,
                    "Plan misconfigured; subscription skipped"
                );
                return SubscriptionOutcome::Skipped;
            }
        };

        let cycle = plan.cycle();
        let mut expected_cursor = subscription.last_billed_at;
        let mut cursor = subscription.billing_cursor();
        let mut pending_hours = subscription.usage_hours;
        let mut invoices = 0u32;

        // Bill every boundary crossed since the cursor, one invoice per
        // period, so a scheduler outage cannot silently under-bill.
        for _ in 0..MAX_PERIODS_PER_PASS {
            let boundary = next_boundary_after(cursor, cycle);
            if now < boundary {
                break;
            }

            let (period_start, _) = period_containing(cursor, cycle);
            let period_end = boundary;
            if period_end <= period_start {
                record_error("invariant", "billing_period");
                tracing::error!(
                    subscription_id = %subscription.subscription_id,
                    period_start = %period_start,
                    period_end = %period_end,
                    "Billing period is not a positive interval"
                );
                return SubscriptionOutcome::Failed;
            }

            // Nothing before the cursor may be billed twice, and nothing
            // outside the enrollment window may be billed at all.
            let bill_start = subscription.start_at.max(period_start).max(cursor);
            let bill_end = subscription.end_at.unwrap_or(period_end).min(period_end);

            let base = prorate(plan.price, period_start, period_end, bill_start, bill_end);

            let mut usage_bytes = 0i64;
            let mut usage_charge = Decimal::ZERO;
            if let Some(rate) = policy.data_rate() {
                usage_bytes = match self
                    .store
                    .sum_usage_bytes(subscription.subscription_id, period_start, period_end)
                    .await
                {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        record_error("database", "sum_usage_bytes");
                        tracing::error!(
                            subscription_id = %subscription.subscription_id,
                            error = %e,
                            "Failed to aggregate usage"
                        );
                        return SubscriptionOutcome::Failed;
                    }
                };
                usage_charge = data_charge(usage_bytes, rate);
            }
            let bills_hours = policy.hourly_rate().is_some();
            if let Some(rate) = policy.hourly_rate() {
                usage_charge += time_charge(pending_hours, rate);
            }

            let total = round_money(base.amount + usage_charge);
            if total < Decimal::ZERO {
                record_error("invariant", "invoice_amount");
                tracing::error!(
                    subscription_id = %subscription.subscription_id,
                    amount = %total,
                    "Computed a negative invoice amount"
                );
                return SubscriptionOutcome::Failed;
            }

            let draft = InvoiceDraft {
                user_id: subscription.user_id,
                subscription_id: subscription.subscription_id,
                period_start,
                period_end,
                amount: total,
                generated_at: now,
                due_date: now + Duration::days(self.settings.due_days),
                details: InvoiceDetails {
                    plan_price: plan.price,
                    prorated_price: base.amount,
                    proration_ratio: base.ratio,
                    usage_bytes,
                    usage_charge,
                    note: None,
                },
            };

            let invoice = match self
                .store
                .commit_invoice(&draft, expected_cursor, period_end, bills_hours)
                .await
            {
                Ok(Some(invoice)) => invoice,
                Ok(None) => {
                    // Another pass advanced the cursor between our read and
                    // this commit. Expected under concurrent scheduling.
                    tracing::debug!(
                        subscription_id = %subscription.subscription_id,
                        "Billing cursor advanced concurrently; deferring to the other pass"
                    );
                    return if invoices > 0 {
                        SubscriptionOutcome::Invoiced(invoices)
                    } else {
                        SubscriptionOutcome::Conflict
                    };
                }
                Err(e) => {
                    record_error("database", "commit_invoice");
                    tracing::error!(
                        subscription_id = %subscription.subscription_id,
                        error = %e,
                        "Failed to commit invoice"
                    );
                    return if invoices > 0 {
                        SubscriptionOutcome::Invoiced(invoices)
                    } else {
                        SubscriptionOutcome::Failed
                    };
                }
            };

            invoices += 1;
            record_invoice_created("recurring", invoice.amount);
            tracing::info!(
                invoice_id = %invoice.invoice_id,
                subscription_id = %subscription.subscription_id,
                amount = %invoice.amount,
                period_start = %period_start,
                period_end = %period_end,
                proration_ratio = base.ratio,
                "Invoice created"
            );

            // Settlement strictly follows the commit: the gateway call must
            // never run inside the cursor transaction.
            if self.settings.auto_charge && subscription.auto_renew {
                self.settle(&invoice, &subscription, &plan, now).await;
            }

            expected_cursor = Some(period_end);
            cursor = period_end;
            if bills_hours {
                pending_hours = Decimal::ZERO;
            }
        }

        if invoices == 0 {
            SubscriptionOutcome::NothingDue
        } else {
            SubscriptionOutcome::Invoiced(invoices)
        }
    }

    async fn settle(
        &self,
        invoice: &Invoice,
        subscription: &Subscription,
        plan: &Plan,
        now: DateTime<Utc>,
    ) {
        let subscriber = match self.store.get_subscriber(subscription.user_id).await {
            Ok(Some(subscriber)) => subscriber,
            Ok(None) => {
                tracing::warn!(
                    user_id = %subscription.user_id,
                    "No subscriber record; settlement skipped"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %subscription.user_id,
                    error = %e,
                    "Could not load subscriber; settlement deferred to the next pass"
                );
                return;
            }
        };

        self.orchestrator
            .settle_invoice(
                self.store.as_ref(),
                invoice,
                subscription,
                &subscriber,
                plan,
                now,
            )
            .await;
    }

    async fn expire_subscription(
        &self,
        subscription: &Subscription,
        plan: &Plan,
    ) -> SubscriptionOutcome {
        if let Err(e) = self
            .store
            .deactivate_subscription(subscription.subscription_id)
            .await
        {
            record_error("database", "deactivate_subscription");
            tracing::error!(
                subscription_id = %subscription.subscription_id,
                error = %e,
                "Failed to deactivate expired subscription"
            );
            return SubscriptionOutcome::Failed;
        }

        record_subscription_deactivated("expired");
        tracing::info!(
            subscription_id = %subscription.subscription_id,
            end_at = ?subscription.end_at,
            "Subscription expired; deactivated"
        );

        match self.store.get_subscriber(subscription.user_id).await {
            Ok(Some(subscriber)) => {
                self.orchestrator
                    .revoke_access(&subscriber, plan.connection())
                    .await;
            }
            Ok(None) => {
                tracing::warn!(
                    user_id = %subscription.user_id,
                    "No subscriber record; access revocation skipped"
                );
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %subscription.user_id,
                    error = %e,
                    "Could not load subscriber for access revocation"
                );
            }
        }

        SubscriptionOutcome::Deactivated
    }

    /// Transition Unpaid invoices past their due date to Overdue and revoke
    /// the defaulting subscribers' access. Amounts are never touched.
    pub async fn sweep_overdue(&self, now: DateTime<Utc>) -> Result<u32, AppError> {
        let overdue = self.store.sweep_overdue(now).await?;
        let count = overdue.len() as u32;

        for invoice in overdue {
            record_invoice_overdue();
            let subscription = match self.store.get_subscription(invoice.subscription_id).await {
                Ok(Some(subscription)) => subscription,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        invoice_id = %invoice.invoice_id,
                        error = %e,
                        "Could not load subscription for overdue revocation"
                    );
                    continue;
                }
            };
            let plan = self.store.get_plan(subscription.plan_id).await.ok().flatten();
            let subscriber = self
                .store
                .get_subscriber(subscription.user_id)
                .await
                .ok()
                .flatten();
            if let (Some(plan), Some(subscriber)) = (plan, subscriber) {
                tracing::info!(
                    invoice_id = %invoice.invoice_id,
                    phone = %subscriber.phone,
                    "Invoice overdue; revoking access"
                );
                self.orchestrator
                    .revoke_access(&subscriber, plan.connection())
                    .await;
            }
        }

        if count > 0 {
            tracing::info!(count = count, "Overdue sweep complete");
        }
        Ok(count)
    }
}
