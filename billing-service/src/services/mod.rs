//! Infrastructure services for the billing engine.

pub mod database;
pub mod metrics;
pub mod mpesa;
pub mod provisioning;
pub mod store;

pub use database::Database;
pub use metrics::{get_metrics, init_metrics};
pub use mpesa::MpesaGateway;
pub use provisioning::RouterOsProvisioner;
pub use store::BillingStore;
