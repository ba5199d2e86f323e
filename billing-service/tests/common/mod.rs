//! Test helpers: an in-memory billing store and recording collaborator fakes.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use billing_service::billing::payment::{AccessProvisioner, PaymentGateway, PaymentOutcome};
use billing_service::billing::{BillingDriver, DriverSettings, SettlementOrchestrator};
use billing_service::models::{
    BillingRun, BillingRunKind, BillingRunStatus, ConnectionType, Invoice, InvoiceDraft,
    InvoiceStatus, PassSummary, Plan, PlanChangeOutcome, Subscriber, Subscription, UsageRecord,
};
use billing_service::services::BillingStore;

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
}

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory [`BillingStore`] with the same compare-and-swap cursor semantics
/// as the Postgres implementation.
#[derive(Default)]
pub struct MemoryStore {
    pub plans: Mutex<HashMap<Uuid, Plan>>,
    pub subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    pub subscriptions: Mutex<HashMap<Uuid, Subscription>>,
    pub usage: Mutex<Vec<UsageRecord>>,
    pub invoices: Mutex<Vec<Invoice>>,
    pub runs: Mutex<Vec<BillingRun>>,
    /// When set, `list_active_subscriptions` returns this snapshot instead of
    /// the live rows, simulating a pass racing a concurrent writer.
    pub stale_listing: Mutex<Option<Vec<Subscription>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_plan(&self, plan: Plan) -> Uuid {
        let id = plan.plan_id;
        self.plans.lock().unwrap().insert(id, plan);
        id
    }

    pub fn insert_subscriber(&self, subscriber: Subscriber) -> Uuid {
        let id = subscriber.user_id;
        self.subscribers.lock().unwrap().insert(id, subscriber);
        id
    }

    pub fn insert_subscription(&self, subscription: Subscription) -> Uuid {
        let id = subscription.subscription_id;
        self.subscriptions.lock().unwrap().insert(id, subscription);
        id
    }

    pub fn add_usage(
        &self,
        subscription_id: Uuid,
        timestamp: DateTime<Utc>,
        rx_bytes: i64,
        tx_bytes: i64,
    ) {
        self.usage.lock().unwrap().push(UsageRecord {
            record_id: Uuid::new_v4(),
            subscription_id,
            timestamp,
            rx_bytes,
            tx_bytes,
            created_utc: timestamp,
        });
    }

    pub fn subscription(&self, subscription_id: Uuid) -> Subscription {
        self.subscriptions
            .lock()
            .unwrap()
            .get(&subscription_id)
            .cloned()
            .expect("subscription exists")
    }

    pub fn invoices_for(&self, subscription_id: Uuid) -> Vec<Invoice> {
        self.invoices
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.subscription_id == subscription_id)
            .cloned()
            .collect()
    }

    fn invoice_from_draft(draft: &InvoiceDraft) -> Result<Invoice, AppError> {
        let details = serde_json::to_value(&draft.details)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("bad details: {}", e)))?;
        Ok(Invoice {
            invoice_id: Uuid::new_v4(),
            user_id: draft.user_id,
            subscription_id: draft.subscription_id,
            period_start: draft.period_start,
            period_end: draft.period_end,
            amount: draft.amount,
            status: InvoiceStatus::Unpaid.as_str().to_string(),
            generated_at: draft.generated_at,
            due_date: draft.due_date,
            paid_at: None,
            details,
        })
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, AppError> {
        if let Some(stale) = self.stale_listing.lock().unwrap().clone() {
            return Ok(stale);
        }
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .get(&subscription_id)
            .cloned())
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        Ok(self.plans.lock().unwrap().get(&plan_id).cloned())
    }

    async fn get_subscriber(&self, user_id: Uuid) -> Result<Option<Subscriber>, AppError> {
        Ok(self.subscribers.lock().unwrap().get(&user_id).cloned())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self
            .invoices
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.invoice_id == invoice_id)
            .cloned())
    }

    async fn sum_usage_bytes(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        Ok(self
            .usage
            .lock()
            .unwrap()
            .iter()
            .filter(|u| {
                u.subscription_id == subscription_id
                    && u.timestamp >= period_start
                    && u.timestamp < period_end
            })
            .map(|u| u.rx_bytes + u.tx_bytes)
            .sum())
    }

    async fn commit_invoice(
        &self,
        draft: &InvoiceDraft,
        expected_cursor: Option<DateTime<Utc>>,
        new_cursor: DateTime<Utc>,
        consume_hours: bool,
    ) -> Result<Option<Invoice>, AppError> {
        {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            let subscription = subscriptions
                .get_mut(&draft.subscription_id)
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("subscription missing")))?;
            if subscription.last_billed_at != expected_cursor {
                return Ok(None);
            }
            subscription.last_billed_at = Some(new_cursor);
            if consume_hours {
                subscription.usage_hours = Decimal::ZERO;
            }
        }

        let mut invoices = self.invoices.lock().unwrap();
        // Mirror the unique (subscription, period) constraint.
        if invoices.iter().any(|i| {
            i.subscription_id == draft.subscription_id
                && i.period_start == draft.period_start
                && i.period_end == draft.period_end
        }) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "duplicate invoice for period"
            )));
        }
        let invoice = Self::invoice_from_draft(draft)?;
        invoices.push(invoice.clone());
        Ok(Some(invoice))
    }

    async fn commit_plan_change(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        change_at: DateTime<Utc>,
        settlement: Option<&InvoiceDraft>,
        expected_cursor: Option<DateTime<Utc>>,
    ) -> Result<Option<PlanChangeOutcome>, AppError> {
        let updated = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            let subscription = subscriptions
                .get_mut(&subscription_id)
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("subscription missing")))?;
            if subscription.last_billed_at != expected_cursor {
                return Ok(None);
            }
            subscription.plan_id = new_plan_id;
            subscription.last_billed_at = Some(match subscription.last_billed_at {
                Some(cursor) => cursor.max(change_at),
                None => change_at,
            });
            subscription.mid_cycle_plan_change = false;
            subscription.clone()
        };

        let settlement = match settlement {
            Some(draft) => {
                let invoice = Self::invoice_from_draft(draft)?;
                self.invoices.lock().unwrap().push(invoice.clone());
                Some(invoice)
            }
            None => None,
        };

        Ok(Some(PlanChangeOutcome {
            subscription: updated,
            settlement,
        }))
    }

    async fn deactivate_subscription(&self, subscription_id: Uuid) -> Result<(), AppError> {
        if let Some(subscription) = self
            .subscriptions
            .lock()
            .unwrap()
            .get_mut(&subscription_id)
        {
            subscription.active = false;
        }
        Ok(())
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut invoices = self.invoices.lock().unwrap();
        if let Some(invoice) = invoices.iter_mut().find(|i| i.invoice_id == invoice_id) {
            if invoice.status != InvoiceStatus::Paid.as_str() {
                invoice.status = InvoiceStatus::Paid.as_str().to_string();
                invoice.paid_at = Some(paid_at);
            }
        }
        Ok(())
    }

    async fn sweep_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, AppError> {
        let mut transitioned = Vec::new();
        let mut invoices = self.invoices.lock().unwrap();
        for invoice in invoices.iter_mut() {
            if invoice.status == InvoiceStatus::Unpaid.as_str() && invoice.due_date < now {
                invoice.status = InvoiceStatus::Overdue.as_str().to_string();
                transitioned.push(invoice.clone());
            }
        }
        Ok(transitioned)
    }

    async fn create_billing_run(
        &self,
        kind: BillingRunKind,
        started: DateTime<Utc>,
    ) -> Result<BillingRun, AppError> {
        let run = BillingRun {
            run_id: Uuid::new_v4(),
            kind: kind.as_str().to_string(),
            status: BillingRunStatus::Running.as_str().to_string(),
            started_utc: started,
            completed_utc: None,
            subscriptions_processed: 0,
            invoices_created: 0,
            subscriptions_failed: 0,
            subscriptions_skipped: 0,
            error_message: None,
        };
        self.runs.lock().unwrap().push(run.clone());
        Ok(run)
    }

    async fn finish_billing_run(
        &self,
        run_id: Uuid,
        status: BillingRunStatus,
        summary: &PassSummary,
        completed: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.iter_mut().find(|r| r.run_id == run_id) {
            run.status = status.as_str().to_string();
            run.completed_utc = Some(completed);
            run.subscriptions_processed = summary.processed as i32;
            run.invoices_created = summary.invoices as i32;
            run.subscriptions_failed = summary.failed as i32;
            run.subscriptions_skipped = (summary.skipped + summary.conflicts) as i32;
        }
        Ok(())
    }
}

// ============================================================================
// Collaborator fakes
// ============================================================================

#[derive(Clone, Copy)]
pub enum GatewayBehavior {
    Confirm,
    Fail,
    Pending,
    Error,
}

pub struct FakeGateway {
    pub behavior: GatewayBehavior,
    pub calls: Mutex<Vec<(String, Decimal, Uuid)>>,
}

impl FakeGateway {
    pub fn new(behavior: GatewayBehavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn request_payment(
        &self,
        phone: &str,
        amount: Decimal,
        invoice_id: Uuid,
    ) -> Result<PaymentOutcome, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((phone.to_string(), amount, invoice_id));
        match self.behavior {
            GatewayBehavior::Confirm => Ok(PaymentOutcome::Confirmed),
            GatewayBehavior::Fail => Ok(PaymentOutcome::Failed),
            GatewayBehavior::Pending => Ok(PaymentOutcome::Pending),
            GatewayBehavior::Error => {
                Err(AppError::BadGateway("gateway offline".to_string()))
            }
        }
    }
}

#[derive(Default)]
pub struct FakeProvisioner {
    /// (action, phone) pairs in call order.
    pub events: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl AccessProvisioner for FakeProvisioner {
    async fn enable_access(
        &self,
        subscriber: &Subscriber,
        _connection: ConnectionType,
    ) -> Result<(), AppError> {
        self.events
            .lock()
            .unwrap()
            .push(("enable".to_string(), subscriber.phone.clone()));
        Ok(())
    }

    async fn disable_access(
        &self,
        subscriber: &Subscriber,
        _connection: ConnectionType,
    ) -> Result<(), AppError> {
        self.events
            .lock()
            .unwrap()
            .push(("disable".to_string(), subscriber.phone.clone()));
        Ok(())
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn plan_with(
    name: &str,
    cycle: &str,
    kind: &str,
    price: &str,
    rate_per_gb: Option<&str>,
    rate_per_hour: Option<&str>,
) -> Plan {
    Plan {
        plan_id: Uuid::new_v4(),
        name: name.to_string(),
        billing_cycle: cycle.to_string(),
        billing_kind: kind.to_string(),
        price: dec(price),
        rate_per_gb: rate_per_gb.map(dec),
        rate_per_hour: rate_per_hour.map(dec),
        data_quota_gb: None,
        download_mbps: Some(dec("10")),
        upload_mbps: Some(dec("5")),
        connection_type: "hotspot".to_string(),
        is_active: true,
        created_utc: utc(2024, 1, 1, 0, 0, 0),
    }
}

pub fn monthly_plan(name: &str, price: &str) -> Plan {
    plan_with(name, "monthly", "flat", price, None, None)
}

pub fn daily_plan(name: &str, price: &str) -> Plan {
    plan_with(name, "daily", "flat", price, None, None)
}

pub fn subscriber(phone: &str) -> Subscriber {
    Subscriber {
        user_id: Uuid::new_v4(),
        name: Some("Test Subscriber".to_string()),
        phone: phone.to_string(),
        email: None,
        is_active: true,
        created_utc: utc(2024, 1, 1, 0, 0, 0),
    }
}

pub fn subscription(user_id: Uuid, plan_id: Uuid, start_at: DateTime<Utc>) -> Subscription {
    Subscription {
        subscription_id: Uuid::new_v4(),
        user_id,
        plan_id,
        active: true,
        auto_renew: false,
        start_at,
        end_at: None,
        last_billed_at: None,
        mid_cycle_plan_change: false,
        usage_bytes: 0,
        usage_hours: Decimal::ZERO,
        created_utc: start_at,
        updated_utc: start_at,
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub provisioner: Arc<FakeProvisioner>,
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub driver: BillingDriver<MemoryStore>,
}

pub fn harness(auto_charge: bool, behavior: GatewayBehavior) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(FakeGateway::new(behavior));
    let provisioner = Arc::new(FakeProvisioner::default());

    let gateway_dyn: Arc<dyn PaymentGateway> = gateway.clone();
    let provisioner_dyn: Arc<dyn AccessProvisioner> = provisioner.clone();
    let orchestrator = Arc::new(SettlementOrchestrator::new(gateway_dyn, provisioner_dyn));

    let driver = BillingDriver::new(
        store.clone(),
        orchestrator.clone(),
        DriverSettings {
            worker_count: 4,
            due_days: 3,
            auto_charge,
        },
    );

    Harness {
        store,
        gateway,
        provisioner,
        orchestrator,
        driver,
    }
}

/// Seed one subscriber on one plan; returns (subscription_id, user_id).
pub fn seed_subscription(
    store: &MemoryStore,
    plan: Plan,
    start_at: DateTime<Utc>,
) -> (Uuid, Uuid) {
    let plan_id = store.insert_plan(plan);
    let user_id = store.insert_subscriber(subscriber("254700000001"));
    let subscription_id = store.insert_subscription(subscription(user_id, plan_id, start_at));
    (subscription_id, user_id)
}
