//! Access plan model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

/// Recurring billing interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycleKind {
    Daily,
    Weekly,
    Monthly,
}

impl BillingCycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycleKind::Daily => "daily",
            BillingCycleKind::Weekly => "weekly",
            BillingCycleKind::Monthly => "monthly",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "daily" => BillingCycleKind::Daily,
            "weekly" => BillingCycleKind::Weekly,
            _ => BillingCycleKind::Monthly,
        }
    }
}

/// How a plan charges its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingKind {
    Flat,
    Data,
    Time,
}

impl BillingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingKind::Flat => "flat",
            BillingKind::Data => "data",
            BillingKind::Time => "time",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "data" => BillingKind::Data,
            "time" => BillingKind::Time,
            _ => BillingKind::Flat,
        }
    }
}

/// How the subscriber reaches the network; drives access provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Hotspot,
    Pppoe,
    StaticIp,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Hotspot => "hotspot",
            ConnectionType::Pppoe => "pppoe",
            ConnectionType::StaticIp => "static_ip",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "pppoe" => ConnectionType::Pppoe,
            "static_ip" => ConnectionType::StaticIp,
            _ => ConnectionType::Hotspot,
        }
    }
}

/// Access plan. Immutable pricing policy from the engine's point of view.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub billing_cycle: String,
    pub billing_kind: String,
    pub price: Decimal,
    pub rate_per_gb: Option<Decimal>,
    pub rate_per_hour: Option<Decimal>,
    pub data_quota_gb: Option<Decimal>,
    pub download_mbps: Option<Decimal>,
    pub upload_mbps: Option<Decimal>,
    pub connection_type: String,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl Plan {
    pub fn cycle(&self) -> BillingCycleKind {
        BillingCycleKind::from_string(&self.billing_cycle)
    }

    pub fn kind(&self) -> BillingKind {
        BillingKind::from_string(&self.billing_kind)
    }

    pub fn connection(&self) -> ConnectionType {
        ConnectionType::from_string(&self.connection_type)
    }
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub name: String,
    pub billing_cycle: BillingCycleKind,
    pub billing_kind: BillingKind,
    pub price: Decimal,
    pub rate_per_gb: Option<Decimal>,
    pub rate_per_hour: Option<Decimal>,
    pub data_quota_gb: Option<Decimal>,
    pub download_mbps: Option<Decimal>,
    pub upload_mbps: Option<Decimal>,
    pub connection_type: ConnectionType,
}

/// Charge computation policy derived from a plan row.
///
/// Metered kinds require their rate at construction time; a data or time plan
/// missing its rate is a configuration error for the whole subscription, not
/// a silent zero charge. A flat plan may still carry `rate_per_gb` as a
/// metered add-on; without it, usage is tracked for quota purposes only and
/// never billed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChargePolicy {
    Flat { data_addon: Option<Decimal> },
    Data { rate_per_gb: Decimal },
    Time { rate_per_hour: Decimal },
}

impl ChargePolicy {
    pub fn from_plan(plan: &Plan) -> Result<Self, AppError> {
        match plan.kind() {
            BillingKind::Flat => Ok(ChargePolicy::Flat {
                data_addon: plan.rate_per_gb,
            }),
            BillingKind::Data => match plan.rate_per_gb {
                Some(rate) => Ok(ChargePolicy::Data { rate_per_gb: rate }),
                None => Err(AppError::ConfigError(anyhow::anyhow!(
                    "data plan '{}' has no rate_per_gb",
                    plan.name
                ))),
            },
            BillingKind::Time => match plan.rate_per_hour {
                Some(rate) => Ok(ChargePolicy::Time {
                    rate_per_hour: rate,
                }),
                None => Err(AppError::ConfigError(anyhow::anyhow!(
                    "time plan '{}' has no rate_per_hour",
                    plan.name
                ))),
            },
        }
    }

    /// Per-GiB rate when byte metering is billable under this policy.
    pub fn data_rate(&self) -> Option<Decimal> {
        match self {
            ChargePolicy::Flat { data_addon } => *data_addon,
            ChargePolicy::Data { rate_per_gb } => Some(*rate_per_gb),
            ChargePolicy::Time { .. } => None,
        }
    }

    /// Per-hour rate when time metering is billable under this policy.
    pub fn hourly_rate(&self) -> Option<Decimal> {
        match self {
            ChargePolicy::Time { rate_per_hour } => Some(*rate_per_hour),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(kind: &str, rate_per_gb: Option<&str>, rate_per_hour: Option<&str>) -> Plan {
        Plan {
            plan_id: Uuid::new_v4(),
            name: "Test".to_string(),
            billing_cycle: "monthly".to_string(),
            billing_kind: kind.to_string(),
            price: "100".parse().unwrap(),
            rate_per_gb: rate_per_gb.map(|r| r.parse().unwrap()),
            rate_per_hour: rate_per_hour.map(|r| r.parse().unwrap()),
            data_quota_gb: None,
            download_mbps: None,
            upload_mbps: None,
            connection_type: "hotspot".to_string(),
            is_active: true,
            created_utc: Utc::now(),
        }
    }

    #[test]
    fn data_plan_requires_rate() {
        let err = ChargePolicy::from_plan(&plan("data", None, None));
        assert!(matches!(err, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn time_plan_requires_rate() {
        let err = ChargePolicy::from_plan(&plan("time", None, None));
        assert!(matches!(err, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn flat_plan_never_fails_construction() {
        let policy = ChargePolicy::from_plan(&plan("flat", None, None)).unwrap();
        assert_eq!(policy.data_rate(), None);
        assert_eq!(policy.hourly_rate(), None);
    }

    #[test]
    fn flat_plan_with_addon_bills_data() {
        let policy = ChargePolicy::from_plan(&plan("flat", Some("25"), None)).unwrap();
        assert_eq!(policy.data_rate(), Some("25".parse().unwrap()));
    }
}
