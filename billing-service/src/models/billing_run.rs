//! Billing run audit model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What triggered a billing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingRunKind {
    Scheduled,
    Manual,
}

impl BillingRunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingRunKind::Scheduled => "scheduled",
            BillingRunKind::Manual => "manual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "manual" => BillingRunKind::Manual,
            _ => BillingRunKind::Scheduled,
        }
    }
}

/// Billing run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingRunStatus {
    Running,
    Completed,
    Failed,
}

impl BillingRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingRunStatus::Running => "running",
            BillingRunStatus::Completed => "completed",
            BillingRunStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => BillingRunStatus::Completed,
            "failed" => BillingRunStatus::Failed,
            _ => BillingRunStatus::Running,
        }
    }
}

/// Audit record of one driver pass.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingRun {
    pub run_id: Uuid,
    pub kind: String,
    pub status: String,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub subscriptions_processed: i32,
    pub invoices_created: i32,
    pub subscriptions_failed: i32,
    pub subscriptions_skipped: i32,
    pub error_message: Option<String>,
}

/// In-memory tally of one driver pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Active subscriptions examined.
    pub processed: u32,
    /// Invoices committed across all subscriptions.
    pub invoices: u32,
    /// Subscriptions skipped for configuration errors.
    pub skipped: u32,
    /// Subscriptions whose iteration failed.
    pub failed: u32,
    /// Subscriptions deferred because another pass advanced their cursor.
    pub conflicts: u32,
    /// Expired subscriptions deactivated this pass.
    pub deactivated: u32,
}

impl PassSummary {
    pub fn status(&self) -> BillingRunStatus {
        if self.failed > 0 && self.failed == self.processed {
            BillingRunStatus::Failed
        } else {
            BillingRunStatus::Completed
        }
    }
}
