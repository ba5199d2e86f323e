//! Payment and access-provisioning boundary.
//!
//! Settlement never creates or deletes records: it only ever moves an
//! already-committed invoice from Unpaid to Paid. A gateway transport failure
//! therefore cannot corrupt invoice state — the invoice simply stays Unpaid
//! until the next pass or a manual reconciliation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{ConnectionType, Invoice, Plan, Subscriber, Subscription};
use crate::services::metrics::{record_access_change, record_payment_request};
use crate::services::BillingStore;

/// Outcome of a payment attempt. Callers must handle every arm; there is no
/// exception path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Confirmed,
    Failed,
    Pending,
}

impl PaymentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOutcome::Confirmed => "confirmed",
            PaymentOutcome::Failed => "failed",
            PaymentOutcome::Pending => "pending",
        }
    }
}

/// Payment initiation against the external gateway. An accepted push-payment
/// request that still awaits the subscriber's confirmation is `Pending`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn request_payment(
        &self,
        phone: &str,
        amount: Decimal,
        invoice_id: Uuid,
    ) -> Result<PaymentOutcome, AppError>;
}

/// Network access control. Fire-and-forget from the engine's point of view:
/// failures are logged and never block invoice correctness.
#[async_trait]
pub trait AccessProvisioner: Send + Sync {
    async fn enable_access(
        &self,
        subscriber: &Subscriber,
        connection: ConnectionType,
    ) -> Result<(), AppError>;

    async fn disable_access(
        &self,
        subscriber: &Subscriber,
        connection: ConnectionType,
    ) -> Result<(), AppError>;
}

/// Glue between a committed invoice and the payment/access collaborators.
pub struct SettlementOrchestrator {
    gateway: std::sync::Arc<dyn PaymentGateway>,
    provisioner: std::sync::Arc<dyn AccessProvisioner>,
}

impl SettlementOrchestrator {
    pub fn new(
        gateway: std::sync::Arc<dyn PaymentGateway>,
        provisioner: std::sync::Arc<dyn AccessProvisioner>,
    ) -> Self {
        Self {
            gateway,
            provisioner,
        }
    }

    /// Attempt immediate settlement of a freshly committed invoice.
    ///
    /// On `Confirmed` the invoice is marked Paid and access (re)enabled. On
    /// `Failed` or `Pending` the invoice stays Unpaid and access is left
    /// alone — non-payment is handled by the overdue sweep, never
    /// preemptively here.
    pub async fn settle_invoice<S: BillingStore + ?Sized>(
        &self,
        store: &S,
        invoice: &Invoice,
        subscription: &Subscription,
        subscriber: &Subscriber,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> PaymentOutcome {
        let outcome = match self
            .gateway
            .request_payment(&subscriber.phone, invoice.amount, invoice.invoice_id)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    invoice_id = %invoice.invoice_id,
                    subscription_id = %subscription.subscription_id,
                    error = %e,
                    "Payment gateway unreachable; invoice left unpaid"
                );
                record_payment_request("error");
                return PaymentOutcome::Pending;
            }
        };

        record_payment_request(outcome.as_str());

        match outcome {
            PaymentOutcome::Confirmed => {
                if let Err(e) = store.mark_invoice_paid(invoice.invoice_id, now).await {
                    tracing::error!(
                        invoice_id = %invoice.invoice_id,
                        error = %e,
                        "Payment confirmed but invoice could not be marked paid"
                    );
                    return PaymentOutcome::Pending;
                }
                self.grant_access(subscriber, plan.connection()).await;
                tracing::info!(
                    invoice_id = %invoice.invoice_id,
                    amount = %invoice.amount,
                    "Invoice settled immediately"
                );
                PaymentOutcome::Confirmed
            }
            other => {
                tracing::info!(
                    invoice_id = %invoice.invoice_id,
                    outcome = other.as_str(),
                    "Payment not confirmed; invoice remains unpaid"
                );
                other
            }
        }
    }

    /// Apply the gateway's asynchronous payment notification. Maps a
    /// successful result onto the Unpaid -> Paid transition and re-enables
    /// access; an unsuccessful result changes nothing.
    pub async fn payment_result<S: BillingStore + ?Sized>(
        &self,
        store: &S,
        invoice_id: Uuid,
        success: bool,
        receipt_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if !success {
            tracing::info!(invoice_id = %invoice_id, "Payment result: not successful");
            record_payment_request("failed");
            return Ok(());
        }

        let invoice = store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("invoice {} not found", invoice_id)))?;

        store.mark_invoice_paid(invoice.invoice_id, now).await?;
        record_payment_request("confirmed");
        tracing::info!(
            invoice_id = %invoice_id,
            receipt_ref = receipt_ref.unwrap_or("-"),
            "Payment result: invoice marked paid"
        );

        let subscription = store.get_subscription(invoice.subscription_id).await?;
        if let Some(subscription) = subscription {
            let plan = store.get_plan(subscription.plan_id).await?;
            let subscriber = store.get_subscriber(subscription.user_id).await?;
            if let (Some(plan), Some(subscriber)) = (plan, subscriber) {
                self.grant_access(&subscriber, plan.connection()).await;
            }
        }

        Ok(())
    }

    /// Enable access, logging failure. Never propagates: provisioning
    /// problems must not affect invoice state.
    pub async fn grant_access(&self, subscriber: &Subscriber, connection: ConnectionType) {
        match self.provisioner.enable_access(subscriber, connection).await {
            Ok(()) => record_access_change("enable", connection.as_str()),
            Err(e) => {
                record_access_change("enable_failed", connection.as_str());
                tracing::warn!(
                    phone = %subscriber.phone,
                    connection = connection.as_str(),
                    error = %e,
                    "Failed to enable access"
                );
            }
        }
    }

    /// Disable access, logging failure.
    pub async fn revoke_access(&self, subscriber: &Subscriber, connection: ConnectionType) {
        match self.provisioner.disable_access(subscriber, connection).await {
            Ok(()) => record_access_change("disable", connection.as_str()),
            Err(e) => {
                record_access_change("disable_failed", connection.as_str());
                tracing::warn!(
                    phone = %subscriber.phone,
                    connection = connection.as_str(),
                    error = %e,
                    "Failed to disable access"
                );
            }
        }
    }
}

/// Whole currency units for gateways that do not accept cents.
pub fn whole_units(amount: Decimal) -> u64 {
    amount
        .round_dp_with_strategy(0, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .unwrap_or(0)
}
