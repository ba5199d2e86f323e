//! Domain models for the billing engine.

mod billing_run;
mod invoice;
mod plan;
mod subscriber;
mod subscription;
mod usage;

pub use billing_run::{BillingRun, BillingRunKind, BillingRunStatus, PassSummary};
pub use invoice::{Invoice, InvoiceDetails, InvoiceDraft, InvoiceStatus};
pub use plan::{BillingCycleKind, BillingKind, ChargePolicy, ConnectionType, CreatePlan, Plan};
pub use subscriber::Subscriber;
pub use subscription::{CreateSubscription, PlanChangeOutcome, Subscription};
pub use usage::{RecordUsage, UsageRecord};
