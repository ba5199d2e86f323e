//! Subscriber account model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscriber account. The phone number doubles as the payment-gateway
/// address and the provisioning username; both collaborators key on it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscriber {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub phone: String,
    pub email: Option<String>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}
