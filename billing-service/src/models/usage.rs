//! Usage metering model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Append-only metering record written by the metering collaborator. The
/// engine only ever sums these over a half-open time range.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub record_id: Uuid,
    pub subscription_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
    pub created_utc: DateTime<Utc>,
}

/// Input for recording usage.
#[derive(Debug, Clone)]
pub struct RecordUsage {
    pub subscription_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}
