//! Postgres persistence for the billing engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    BillingRun, BillingRunKind, BillingRunStatus, CreatePlan, CreateSubscription, Invoice,
    InvoiceDraft, InvoiceStatus, PassSummary, Plan, PlanChangeOutcome, RecordUsage, Subscriber,
    Subscription,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::BillingStore;

const PLAN_COLUMNS: &str = "plan_id, name, billing_cycle, billing_kind, price, rate_per_gb, rate_per_hour, data_quota_gb, download_mbps, upload_mbps, connection_type, is_active, created_utc";
const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, plan_id, active, auto_renew, start_at, end_at, last_billed_at, mid_cycle_plan_change, usage_bytes, usage_hours, created_utc, updated_utc";
const INVOICE_COLUMNS: &str = "invoice_id, user_id, subscription_id, period_start, period_end, amount, status, generated_at, due_date, paid_at, details";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Collaborator-facing writes (plan purchase, metering)
    // =========================================================================

    /// Create a new access plan.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_plan(&self, input: &CreatePlan) -> Result<Plan, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            INSERT INTO plans (plan_id, name, billing_cycle, billing_kind, price, rate_per_gb, rate_per_hour, data_quota_gb, download_mbps, upload_mbps, connection_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {PLAN_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(input.billing_cycle.as_str())
        .bind(input.billing_kind.as_str())
        .bind(input.price)
        .bind(input.rate_per_gb)
        .bind(input.rate_per_hour)
        .bind(input.data_quota_gb)
        .bind(input.download_mbps)
        .bind(input.upload_mbps)
        .bind(input.connection_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create plan: {}", e)))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, name = %plan.name, "Plan created");

        Ok(plan)
    }

    /// Create a subscriber account.
    #[instrument(skip(self, name, email), fields(phone = %phone))]
    pub async fn create_subscriber(
        &self,
        name: Option<&str>,
        phone: &str,
        email: Option<&str>,
    ) -> Result<Subscriber, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscriber"])
            .start_timer();

        let subscriber = sqlx::query_as::<_, Subscriber>(
            r#"
            INSERT INTO subscribers (user_id, name, phone, email)
            VALUES ($1, $2, $3, $4)
            RETURNING user_id, name, phone, email, is_active, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(phone)
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create subscriber: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscriber)
    }

    /// Enroll a subscriber in a plan.
    #[instrument(skip(self, input), fields(user_id = %input.user_id, plan_id = %input.plan_id))]
    pub async fn create_subscription(
        &self,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, plan_id, auto_renew, start_at, end_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(input.user_id)
        .bind(input.plan_id)
        .bind(input.auto_renew)
        .bind(input.start_at)
        .bind(input.end_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create subscription: {}", e))
        })?;

        timer.observe_duration();
        info!(subscription_id = %subscription.subscription_id, "Subscription created");

        Ok(subscription)
    }

    /// Append one metering record. Called by the metering collaborator.
    #[instrument(skip(self, input), fields(subscription_id = %input.subscription_id))]
    pub async fn record_usage(&self, input: &RecordUsage) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_usage"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO usage_records (record_id, subscription_id, "timestamp", rx_bytes, tx_bytes)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.subscription_id)
        .bind(input.timestamp)
        .bind(input.rx_bytes)
        .bind(input.tx_bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record usage: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }

    async fn insert_invoice(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        draft: &InvoiceDraft,
    ) -> Result<Invoice, AppError> {
        let details = serde_json::to_value(&draft.details).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to serialize invoice details: {}", e))
        })?;

        sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (invoice_id, user_id, subscription_id, period_start, period_end, amount, status, generated_at, due_date, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(draft.user_id)
        .bind(draft.subscription_id)
        .bind(draft.period_start)
        .bind(draft.period_end)
        .bind(draft.amount)
        .bind(InvoiceStatus::Unpaid.as_str())
        .bind(draft.generated_at)
        .bind(draft.due_date)
        .bind(details)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert invoice: {}", e)))
    }
}

#[async_trait]
impl BillingStore for Database {
    #[instrument(skip(self))]
    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_subscriptions"])
            .start_timer();

        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE active = TRUE
            ORDER BY created_utc
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list subscriptions: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscriptions)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE subscription_id = $1
            "#
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get subscription: {}", e))
        })?;

        timer.observe_duration();

        Ok(subscription)
    }

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            SELECT {PLAN_COLUMNS}
            FROM plans
            WHERE plan_id = $1
            "#
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get plan: {}", e)))?;

        timer.observe_duration();

        Ok(plan)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn get_subscriber(&self, user_id: Uuid) -> Result<Option<Subscriber>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscriber"])
            .start_timer();

        let subscriber = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT user_id, name, phone, email, is_active, created_utc
            FROM subscribers
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get subscriber: {}", e)))?;

        timer.observe_duration();

        Ok(subscriber)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE invoice_id = $1
            "#
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn sum_usage_bytes(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sum_usage_bytes"])
            .start_timer();

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(rx_bytes + tx_bytes), 0)::BIGINT
            FROM usage_records
            WHERE subscription_id = $1
              AND "timestamp" >= $2
              AND "timestamp" < $3
            "#,
        )
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum usage: {}", e)))?;

        timer.observe_duration();

        Ok(total)
    }

    #[instrument(skip(self, draft), fields(subscription_id = %draft.subscription_id))]
    async fn commit_invoice(
        &self,
        draft: &InvoiceDraft,
        expected_cursor: Option<DateTime<Utc>>,
        new_cursor: DateTime<Utc>,
        consume_hours: bool,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Compare-and-swap on the cursor: a concurrent pass that already
        // advanced it makes this a clean no-op, never a double bill.
        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_billed_at = $2,
                usage_hours = CASE WHEN $3 THEN 0 ELSE usage_hours END,
                updated_utc = now()
            WHERE subscription_id = $1
              AND last_billed_at IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(draft.subscription_id)
        .bind(new_cursor)
        .bind(consume_hours)
        .bind(expected_cursor)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to advance billing cursor: {}", e))
        })?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        }

        let invoice = Self::insert_invoice(&mut tx, draft).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit invoice: {}", e))
        })?;

        timer.observe_duration();

        Ok(Some(invoice))
    }

    #[instrument(skip(self, settlement), fields(subscription_id = %subscription_id, new_plan_id = %new_plan_id))]
    async fn commit_plan_change(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        change_at: DateTime<Utc>,
        settlement: Option<&InvoiceDraft>,
        expected_cursor: Option<DateTime<Utc>>,
    ) -> Result<Option<PlanChangeOutcome>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_plan_change"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // GREATEST keeps the cursor monotone when the switch instant is
        // already covered by earlier billing.
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET plan_id = $2,
                last_billed_at = GREATEST($3, last_billed_at),
                mid_cycle_plan_change = FALSE,
                updated_utc = now()
            WHERE subscription_id = $1
              AND last_billed_at IS NOT DISTINCT FROM $4
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(new_plan_id)
        .bind(change_at)
        .bind(expected_cursor)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to switch plan: {}", e)))?;

        let Some(subscription) = subscription else {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        };

        let settlement_invoice = match settlement {
            Some(draft) => Some(Self::insert_invoice(&mut tx, draft).await?),
            None => None,
        };

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit plan change: {}", e))
        })?;

        timer.observe_duration();

        Ok(Some(PlanChangeOutcome {
            subscription,
            settlement: settlement_invoice,
        }))
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn deactivate_subscription(&self, subscription_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["deactivate_subscription"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET active = FALSE, updated_utc = now()
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to deactivate subscription: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_paid"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, paid_at = COALESCE(paid_at, $3)
            WHERE invoice_id = $1 AND status <> $2
            "#,
        )
        .bind(invoice_id)
        .bind(InvoiceStatus::Paid.as_str())
        .bind(paid_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark invoice paid: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self))]
    async fn sweep_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sweep_overdue"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET status = $1
            WHERE status = $2 AND due_date < $3
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(InvoiceStatus::Overdue.as_str())
        .bind(InvoiceStatus::Unpaid.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to sweep overdue invoices: {}", e))
        })?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn create_billing_run(
        &self,
        kind: BillingRunKind,
        started: DateTime<Utc>,
    ) -> Result<BillingRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_billing_run"])
            .start_timer();

        let run = sqlx::query_as::<_, BillingRun>(
            r#"
            INSERT INTO billing_runs (run_id, kind, status, started_utc)
            VALUES ($1, $2, $3, $4)
            RETURNING run_id, kind, status, started_utc, completed_utc, subscriptions_processed, invoices_created, subscriptions_failed, subscriptions_skipped, error_message
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(BillingRunStatus::Running.as_str())
        .bind(started)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create billing run: {}", e))
        })?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self, summary), fields(run_id = %run_id))]
    async fn finish_billing_run(
        &self,
        run_id: Uuid,
        status: BillingRunStatus,
        summary: &PassSummary,
        completed: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finish_billing_run"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE billing_runs
            SET status = $2,
                completed_utc = $3,
                subscriptions_processed = $4,
                invoices_created = $5,
                subscriptions_failed = $6,
                subscriptions_skipped = $7
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(completed)
        .bind(summary.processed as i32)
        .bind(summary.invoices as i32)
        .bind(summary.failed as i32)
        .bind((summary.skipped + summary.conflicts) as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to finish billing run: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }
}
